//! A connection owned by one event loop.
//!
//! ```text
//!            ┌────────────────────── Channel ───────────────────────┐
//!  socket ──▶│ inbound RingBuffer ──▶ Pipeline (0 → n-1) ──▶ app     │
//!  socket ◀──│ outbound RingBuffer ◀── Pipeline (n-1 → 0) ◀── write  │
//!            └───────────────────────────────────────────────────────┘
//! ```
//!
//! The socket, both buffers and the pipeline live behind a lock that is only
//! ever taken on the owning loop's thread. The public [`Channel`] methods never
//! take it: they queue work on the loop instead, so they are safe to call from
//! any thread, including from inside a stage or a promise listener.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;

use crate::buffer::RingBuffer;
use crate::error::{Error, Result};
use crate::event::IoEvent;
use crate::event_loop::EventLoop;
use crate::future::Promise;
use crate::handler::{EventHandler, HandlerContext};
use crate::net::ChannelConfig;
use crate::pipeline::{ChannelContext, Deferred, Message, Pipeline};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Socket reads per readiness event before the rest is handed back to the
/// loop as a task, so one busy peer cannot hold the loop.
const MAX_READS_PER_EVENT: usize = 16;

pub(crate) enum ChannelState {
    /// Client side, waiting for the OS to confirm the connect.
    Connecting(Promise<Channel>),
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Open,
    Close,
}

struct ChannelShared {
    id: u64,
    token: Token,
    event_loop: EventLoop,
    peer_addr: SocketAddr,
    active: AtomicBool,
    close_promise: Promise<()>,
    core: Mutex<ChannelCore>,
}

/// Handle to a connection. Cheap to clone; every clone refers to the same
/// connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(
        stream: TcpStream,
        token: Token,
        event_loop: EventLoop,
        peer_addr: SocketAddr,
        config: &ChannelConfig,
        pipeline: Pipeline,
        state: ChannelState,
    ) -> Self {
        let active = matches!(state, ChannelState::Connected);
        let close_promise = Promise::with_executor(event_loop.clone());
        Channel {
            shared: Arc::new(ChannelShared {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                token,
                event_loop,
                peer_addr,
                active: AtomicBool::new(active),
                close_promise,
                core: Mutex::new(ChannelCore {
                    stream,
                    state,
                    no_delay: config.no_delay,
                    inbound: RingBuffer::new(config.inbound_capacity),
                    outbound: RingBuffer::new(config.outbound_capacity),
                    pipeline,
                    appended: 0,
                    flushed: 0,
                    flush_waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn token(&self) -> Token {
        self.shared.token
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Whether the channel is connected and not yet closed.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Completed once the channel has closed, whoever closed it.
    pub fn close_future(&self) -> Promise<()> {
        self.shared.close_promise.clone()
    }

    /// Sends `msg` through the pipeline from the application end.
    ///
    /// The promise completes once every byte the message produced has been
    /// written to the socket. It fails with [`Error::BufferOverflow`] if the
    /// bytes do not fit in the outbound buffer (the channel stays open), and
    /// with [`Error::ChannelClosed`] if the channel closes first.
    pub fn write<M: Any + Send>(&self, msg: M) -> Promise<()> {
        let promise = Promise::with_executor(self.event_loop().clone());
        if !self.is_active() {
            let _ = promise.try_set_failure(Error::ChannelClosed);
            return promise;
        }

        let channel = self.clone();
        let completer = promise.clone();
        let msg: Message = Box::new(msg);
        let queued = self.event_loop().execute_with_reactor(move |reactor| {
            let flow = {
                let mut core = channel.shared.core.lock();
                if !matches!(core.state, ChannelState::Connected) {
                    let _ = completer.try_set_failure(Error::ChannelClosed);
                    return;
                }
                let mut deferred = Deferred::default();
                deferred.writes.push_back((msg, completer));
                core.apply_deferred(&channel, deferred)
            };
            if flow == Flow::Close {
                reactor.remove_handler(channel.token());
            }
        });
        if queued.is_err() {
            let _ = promise.try_set_failure(Error::ChannelClosed);
        }
        promise
    }

    /// Closes the channel. Writes queued before the close that were not
    /// flushed yet fail with [`Error::ChannelClosed`].
    pub fn close(&self) -> Promise<()> {
        let channel = self.clone();
        let queued = self.event_loop().execute_with_reactor(move |reactor| {
            reactor.remove_handler(channel.token());
        });
        if queued.is_err() {
            // the loop is gone and took every handler with it
            tracing::trace!(channel = self.id(), "close after event loop termination");
        }
        self.close_future()
    }
}

impl Channel {
    /// Queues another round of reads on the owning loop.
    fn resume_read(&self) {
        let channel = self.clone();
        let queued = self.event_loop().execute_with_reactor(move |reactor| {
            let flow = {
                let mut core = channel.shared.core.lock();
                if !matches!(core.state, ChannelState::Connected) {
                    return;
                }
                match core.read(&channel) {
                    Flow::Open => core.flush(&channel),
                    Flow::Close => Flow::Close,
                }
            };
            if flow == Flow::Close {
                reactor.remove_handler(channel.token());
            }
        });
        if queued.is_err() {
            tracing::trace!(channel = self.id(), "event loop gone; dropping read resume");
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("token", &self.token())
            .field("peer_addr", &self.peer_addr())
            .field("active", &self.is_active())
            .finish()
    }
}

struct ChannelCore {
    stream: TcpStream,
    state: ChannelState,
    no_delay: bool,
    inbound: RingBuffer,
    outbound: RingBuffer,
    pipeline: Pipeline,
    /// Total bytes ever appended to the outbound buffer.
    appended: u64,
    /// Total bytes ever written to the socket.
    flushed: u64,
    /// Write promises keyed by the `appended` total that completes them.
    flush_waiters: VecDeque<(u64, Promise<()>)>,
}

impl ChannelCore {
    fn handle_ready(&mut self, channel: &Channel, event: &IoEvent) -> Flow {
        match self.state {
            ChannelState::Closed => return Flow::Close,
            ChannelState::Connecting(_) => match self.finish_connect(channel) {
                Ok(None) => return Flow::Open,
                Ok(Some(Flow::Close)) => return Flow::Close,
                Ok(Some(Flow::Open)) => {}
                Err(error) => {
                    tracing::debug!(channel = channel.id(), peer = %channel.peer_addr(), %error, "connect failed");
                    self.fire_error(channel, &error);
                    if let ChannelState::Connecting(promise) = &self.state {
                        let _ = promise.try_set_failure(error);
                    }
                    return Flow::Close;
                }
            },
            ChannelState::Connected => {}
        }

        if (event.is_readable() || event.is_read_closed() || event.is_error())
            && self.read(channel) == Flow::Close
        {
            return Flow::Close;
        }
        if event.is_writable() || !self.outbound.is_empty() {
            return self.flush(channel);
        }
        Flow::Open
    }

    /// `Ok(None)` while the connect is still in progress.
    fn finish_connect(&mut self, channel: &Channel) -> Result<Option<Flow>> {
        if let Some(error) = self.stream.take_error()? {
            return Err(error.into());
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected || e.kind() == ErrorKind::WouldBlock => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.stream.set_nodelay(self.no_delay) {
            tracing::warn!(channel = channel.id(), error = %e, "failed to set TCP_NODELAY");
        }
        let ChannelState::Connecting(connected) = mem::replace(&mut self.state, ChannelState::Connected)
        else {
            return Ok(Some(Flow::Open));
        };
        channel.shared.active.store(true, Ordering::SeqCst);
        tracing::debug!(channel = channel.id(), peer = %channel.peer_addr(), "connected");

        let flow = self.fire_connected(channel);
        let _ = connected.try_set_success(channel.clone());
        Ok(Some(flow))
    }

    fn fire_connected(&mut self, channel: &Channel) -> Flow {
        let mut deferred = Deferred::default();
        let result = {
            let mut cx = ChannelContext::new(channel, &mut deferred);
            self.pipeline.fire_connected(&mut cx)
        };
        self.after_callback(channel, result, deferred)
    }

    /// Reads until the socket would block, running the pipeline after each
    /// successful read. After `MAX_READS_PER_EVENT` reads the rest is left to
    /// a queued task: readiness is edge-triggered, so no new event would come.
    fn read(&mut self, channel: &Channel) -> Flow {
        for _ in 0..MAX_READS_PER_EVENT {
            if self.inbound.is_full() {
                let error = Error::BufferOverflow {
                    requested: 1,
                    available: 0,
                };
                self.fire_error(channel, &error);
                return Flow::Close;
            }
            match self.inbound.read_from_channel(&mut self.stream) {
                Ok(0) => {
                    tracing::trace!(channel = channel.id(), "peer closed the connection");
                    return Flow::Close;
                }
                Ok(n) => {
                    tracing::trace!(channel = channel.id(), bytes = n, "read");
                    if self.dispatch_read(channel) == Flow::Close {
                        return Flow::Close;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Flow::Open,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fire_error(channel, &e.into());
                    return Flow::Close;
                }
            }
        }
        channel.resume_read();
        Flow::Open
    }

    fn dispatch_read(&mut self, channel: &Channel) -> Flow {
        let mut deferred = Deferred::default();
        let result = {
            let mut cx = ChannelContext::new(channel, &mut deferred);
            self.pipeline.fire_read(&mut cx, &mut self.inbound)
        };
        self.after_callback(channel, result, deferred)
    }

    fn after_callback(&mut self, channel: &Channel, result: Result<()>, mut deferred: Deferred) -> Flow {
        match result {
            Ok(()) => self.apply_deferred(channel, deferred),
            Err(error) => {
                deferred.fail_writes(&Error::ChannelClosed);
                self.fire_error(channel, &error);
                Flow::Close
            }
        }
    }

    /// Runs queued writes through the outbound pipeline in order, then either
    /// closes or flushes.
    fn apply_deferred(&mut self, channel: &Channel, mut deferred: Deferred) -> Flow {
        while let Some((msg, promise)) = deferred.writes.pop_front() {
            let before = self.outbound.remaining_can_get();
            let result = {
                let mut cx = ChannelContext::new(channel, &mut deferred);
                self.pipeline.fire_write(&mut cx, msg, &mut self.outbound)
            };
            match result {
                Ok(()) => {
                    self.appended += (self.outbound.remaining_can_get() - before) as u64;
                    self.flush_waiters.push_back((self.appended, promise));
                }
                Err(error) => {
                    // a rejected message leaves none of its bytes behind
                    self.outbound.truncate_to(before);
                    tracing::debug!(channel = channel.id(), %error, "write rejected");
                    let _ = promise.try_set_failure(error);
                }
            }
        }
        if deferred.close {
            // pending bytes get one last chance before the socket goes away
            self.flush(channel);
            return Flow::Close;
        }
        self.flush(channel)
    }

    /// Writes until the outbound buffer is empty or the socket would block.
    /// The rest goes out on the next writable event.
    fn flush(&mut self, channel: &Channel) -> Flow {
        let mut flow = Flow::Open;
        while !self.outbound.is_empty() {
            match self.outbound.write_to_channel(&mut self.stream) {
                Ok(0) => {
                    self.fire_error(channel, &io::Error::from(ErrorKind::WriteZero).into());
                    flow = Flow::Close;
                    break;
                }
                Ok(n) => self.flushed += n as u64,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fire_error(channel, &e.into());
                    flow = Flow::Close;
                    break;
                }
            }
        }
        while let Some((target, _)) = self.flush_waiters.front() {
            if *target > self.flushed {
                break;
            }
            if let Some((_, promise)) = self.flush_waiters.pop_front() {
                let _ = promise.try_set_success(());
            }
        }
        flow
    }

    fn fire_error(&mut self, channel: &Channel, error: &Error) {
        tracing::debug!(channel = channel.id(), %error, "channel error");
        let mut deferred = Deferred::default();
        {
            let mut cx = ChannelContext::new(channel, &mut deferred);
            self.pipeline.fire_error(&mut cx, error);
        }
        deferred.fail_writes(&Error::ChannelClosed);
    }

    /// Tears the connection down. Runs once; later calls do nothing.
    fn close(&mut self, channel: &Channel) {
        let previous = mem::replace(&mut self.state, ChannelState::Closed);
        if let ChannelState::Closed = previous {
            return;
        }
        channel.shared.active.store(false, Ordering::SeqCst);

        if let Err(e) = channel.event_loop().registry().deregister(&mut self.stream) {
            tracing::trace!(channel = channel.id(), error = %e, "deregister on close failed");
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                tracing::trace!(channel = channel.id(), error = %e, "socket shutdown failed");
            }
        }

        for (_, promise) in self.flush_waiters.drain(..) {
            let _ = promise.try_set_failure(Error::ChannelClosed);
        }
        self.inbound.clear();
        self.outbound.clear();

        if let ChannelState::Connecting(connected) = &previous {
            let _ = connected.try_set_failure(Error::ChannelClosed);
        }
        let mut deferred = Deferred::default();
        {
            let mut cx = ChannelContext::new(channel, &mut deferred);
            self.pipeline.fire_closed(&mut cx);
        }
        deferred.fail_writes(&Error::ChannelClosed);

        tracing::debug!(channel = channel.id(), peer = %channel.peer_addr(), "channel closed");
        let _ = channel.shared.close_promise.try_set_success(());
    }
}

/// Drives a [`Channel`] from its loop's readiness events.
pub(crate) struct ChannelIoHandler {
    channel: Channel,
}

impl ChannelIoHandler {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl EventHandler for ChannelIoHandler {
    fn handle_event(&mut self, cx: &mut HandlerContext<'_>, event: &IoEvent) {
        let flow = self.channel.shared.core.lock().handle_ready(&self.channel, event);
        if flow == Flow::Close {
            cx.deregister();
        }
    }

    fn on_registered(&mut self, cx: &mut HandlerContext<'_>) {
        let flow = {
            let mut core = self.channel.shared.core.lock();
            match core.state {
                // accepted channels are connected from the start
                ChannelState::Connected => {
                    tracing::debug!(
                        channel = self.channel.id(),
                        peer = %self.channel.peer_addr(),
                        loop_id = cx.event_loop().id(),
                        "channel registered"
                    );
                    core.fire_connected(&self.channel)
                }
                _ => Flow::Open,
            }
        };
        if flow == Flow::Close {
            cx.deregister();
        }
    }

    fn on_removed(&mut self, _cx: &mut HandlerContext<'_>) {
        self.channel.shared.core.lock().close(&self.channel);
    }
}
