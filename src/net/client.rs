use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Interest;

use crate::channel::{Channel, ChannelIoHandler, ChannelState};
use crate::error::Result;
use crate::future::Promise;
use crate::group::EventLoopGroup;
use crate::net::{build_channel, ChannelConfig, ChannelInitializer};
use crate::pipeline::Pipeline;

/// Opens outbound connections, each served by a loop of `group`.
pub struct Client {
    group: Arc<EventLoopGroup>,
    config: ChannelConfig,
    initializer: ChannelInitializer,
}

impl Client {
    pub fn new<I>(group: Arc<EventLoopGroup>, config: ChannelConfig, initializer: I) -> Result<Self>
    where
        I: Fn(&mut Pipeline) + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            group,
            config,
            initializer: Arc::new(initializer),
        })
    }

    /// Starts a non-blocking connect to `addr`.
    ///
    /// The promise resolves with the channel once the connection is
    /// established and every stage has seen `on_connected`, or fails with the
    /// socket error.
    pub fn connect(&self, addr: SocketAddr) -> Promise<Channel> {
        let event_loop = self.group.next().clone();
        let connected = Promise::with_executor(event_loop.clone());
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = connected.try_set_failure(e.into());
                return connected;
            }
        };

        let config = self.config.clone();
        let initializer = Arc::clone(&self.initializer);
        let pending = connected.clone();
        let failed = connected.clone();
        event_loop
            .register(
                stream,
                Interest::READABLE | Interest::WRITABLE,
                move |registered| {
                    let state = ChannelState::Connecting(pending);
                    let channel = build_channel(registered, addr, &config, &initializer, state);
                    Ok(ChannelIoHandler::new(channel))
                },
            )
            .add_listener(move |registration| {
                if let Some(Err(error)) = registration.try_get() {
                    let _ = failed.try_set_failure(error);
                }
            });
        connected
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}
