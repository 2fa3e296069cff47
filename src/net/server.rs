use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::Interest;

use crate::channel::{ChannelIoHandler, ChannelState};
use crate::error::Result;
use crate::event::IoEvent;
use crate::future::Promise;
use crate::group::EventLoopGroup;
use crate::handler::{EventHandler, HandlerContext};
use crate::net::{build_channel, ChannelConfig, ChannelInitializer};
use crate::pipeline::Pipeline;

/// Accepts connections on a parent group and serves each one on a loop of
/// the child group.
pub struct Server {
    parent: Arc<EventLoopGroup>,
    child: Arc<EventLoopGroup>,
    config: ChannelConfig,
    initializer: ChannelInitializer,
}

impl Server {
    /// `initializer` runs once per accepted connection, on the loop that will
    /// own it, and installs the connection's stages.
    pub fn new<I>(
        parent: Arc<EventLoopGroup>,
        child: Arc<EventLoopGroup>,
        config: ChannelConfig,
        initializer: I,
    ) -> Result<Self>
    where
        I: Fn(&mut Pipeline) + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            parent,
            child,
            config,
            initializer: Arc::new(initializer),
        })
    }

    /// Starts listening on `addr`. Resolves with the bound address, which
    /// carries the actual port when `addr` asked for port 0.
    pub fn bind(&self, addr: SocketAddr) -> Promise<SocketAddr> {
        let (listener, local) = match TcpListener::bind(addr).and_then(|l| {
            let local = l.local_addr()?;
            Ok((l, local))
        }) {
            Ok(bound) => bound,
            Err(e) => return Promise::failed(e.into()),
        };

        let event_loop = self.parent.next().clone();
        let bound = Promise::with_executor(event_loop.clone());
        let child = Arc::clone(&self.child);
        let config = self.config.clone();
        let initializer = Arc::clone(&self.initializer);

        let completer = bound.clone();
        event_loop
            .register(listener, Interest::READABLE, move |registered| {
                Ok(Acceptor {
                    listener: registered.source,
                    local,
                    child,
                    config,
                    initializer,
                })
            })
            .add_listener(move |registration| match registration.try_get() {
                Some(Ok(_token)) => {
                    tracing::info!(address = %local, "listening");
                    let _ = completer.try_set_success(local);
                }
                Some(Err(error)) => {
                    let _ = completer.try_set_failure(error);
                }
                None => {}
            });
        bound
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

/// Handler for the listening socket.
struct Acceptor {
    listener: TcpListener,
    local: SocketAddr,
    child: Arc<EventLoopGroup>,
    config: ChannelConfig,
    initializer: ChannelInitializer,
}

impl Acceptor {
    fn spawn_channel(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            tracing::warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let config = self.config.clone();
        let initializer = Arc::clone(&self.initializer);
        self.child
            .next()
            .register(
                stream,
                Interest::READABLE | Interest::WRITABLE,
                move |registered| {
                    let channel =
                        build_channel(registered, peer, &config, &initializer, ChannelState::Connected);
                    Ok(ChannelIoHandler::new(channel))
                },
            )
            .add_listener(move |registration| {
                if let Some(Err(error)) = registration.try_get() {
                    tracing::warn!(%peer, %error, "dropping accepted connection");
                }
            });
    }
}

impl EventHandler for Acceptor {
    fn handle_event(&mut self, _cx: &mut HandlerContext<'_>, event: &IoEvent) {
        if !event.is_readable() {
            return;
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    self.spawn_channel(stream, peer);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(address = %self.local, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_removed(&mut self, _cx: &mut HandlerContext<'_>) {
        tracing::debug!(address = %self.local, "listener closed");
    }
}
