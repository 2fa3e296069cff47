//! Per-channel chain of protocol stages.
//!
//! ```text
//!          inbound: index 0 ──────────────▶ n-1
//!  wire ◀──▶ [stage 0] [stage 1] ... [stage n-1] ◀──▶ application
//!          outbound: index n-1 ─────────────▶ 0
//! ```
//!
//! Inbound data enters at stage 0 as [`InboundMessage::Bytes`] borrowing the
//! channel's inbound [`RingBuffer`]. A decoder consumes what it can, leaves
//! partial frames in the buffer for the next read, and forwards decoded
//! messages with [`InboundNext::invoke`]. Outbound messages enter at the last
//! stage and travel towards the wire through [`OutboundNext::invoke`]; whatever
//! falls off stage 0 must be bytes and is appended to the outbound buffer.
//!
//! Connection lifecycle notifications (`on_connected`, `on_closed`,
//! `on_error`) are delivered to every stage in inbound order.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use crate::buffer::RingBuffer;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::future::Promise;

/// A type-erased message travelling through the pipeline.
pub type Message = Box<dyn Any + Send>;

/// What an inbound stage receives.
pub enum InboundMessage<'a> {
    /// Raw bytes read from the socket, still owned by the channel's buffer.
    Bytes(&'a mut RingBuffer),
    /// A message produced by an earlier stage.
    Message(Message),
}

impl InboundMessage<'_> {
    /// Takes the message out as a `T`, handing it back if it is something else.
    pub fn downcast<T: Any>(self) -> std::result::Result<Box<T>, Self> {
        match self {
            InboundMessage::Message(msg) => msg.downcast::<T>().map_err(InboundMessage::Message),
            bytes => Err(bytes),
        }
    }
}

impl fmt::Debug for InboundMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundMessage::Bytes(buf) => f.debug_tuple("Bytes").field(buf).finish(),
            InboundMessage::Message(_) => f.write_str("Message(..)"),
        }
    }
}

/// One stage of a channel's pipeline.
///
/// Every method has a default: inbound and outbound messages are forwarded
/// untouched and lifecycle notifications are ignored, so a stage only
/// implements the directions it cares about. Stages run on the channel's
/// event loop thread, one callback at a time. Returning an error from a
/// callback reports it to every stage's [`on_error`](Self::on_error) and
/// closes the channel.
pub trait ChannelHandler: Send + 'static {
    fn on_connected(&mut self, cx: &mut ChannelContext<'_>) -> Result<()> {
        let _ = cx;
        Ok(())
    }

    fn on_read(
        &mut self,
        cx: &mut ChannelContext<'_>,
        msg: InboundMessage<'_>,
        next: &mut InboundNext<'_>,
    ) -> Result<()> {
        next.invoke(cx, msg)
    }

    fn on_write(
        &mut self,
        cx: &mut ChannelContext<'_>,
        msg: Message,
        next: &mut OutboundNext<'_>,
    ) -> Result<()> {
        next.invoke(cx, msg)
    }

    fn on_closed(&mut self, cx: &mut ChannelContext<'_>) {
        let _ = cx;
    }

    fn on_error(&mut self, cx: &mut ChannelContext<'_>, error: &Error) {
        let _ = (cx, error);
    }
}

/// Cursor over the stages after the current one, towards the application.
pub struct InboundNext<'a> {
    rest: &'a mut [Box<dyn ChannelHandler>],
}

impl InboundNext<'_> {
    /// Hands `msg` to the next stage. May be called any number of times from
    /// one `on_read`.
    pub fn invoke(&mut self, cx: &mut ChannelContext<'_>, msg: InboundMessage<'_>) -> Result<()> {
        match self.rest.split_first_mut() {
            Some((stage, rest)) => stage.on_read(cx, msg, &mut InboundNext { rest }),
            None => {
                discard_inbound(cx, msg);
                Ok(())
            }
        }
    }

    pub fn is_tail(&self) -> bool {
        self.rest.is_empty()
    }
}

fn discard_inbound(cx: &ChannelContext<'_>, msg: InboundMessage<'_>) {
    match msg {
        InboundMessage::Bytes(buf) => {
            if !buf.is_empty() {
                tracing::debug!(
                    channel = cx.channel().id(),
                    bytes = buf.remaining_can_get(),
                    "discarding inbound bytes no stage consumed"
                );
                buf.clear();
            }
        }
        InboundMessage::Message(_) => {
            tracing::trace!(
                channel = cx.channel().id(),
                "inbound message reached the end of the pipeline"
            );
        }
    }
}

/// Cursor over the stages before the current one, towards the wire.
pub struct OutboundNext<'a> {
    rest: &'a mut [Box<dyn ChannelHandler>],
    wire: &'a mut RingBuffer,
}

impl OutboundNext<'_> {
    /// Hands `msg` to the next stage closer to the wire, or appends it to the
    /// outbound buffer when no stage is left.
    pub fn invoke(&mut self, cx: &mut ChannelContext<'_>, msg: Message) -> Result<()> {
        match self.rest.split_last_mut() {
            Some((stage, rest)) => stage.on_write(
                cx,
                msg,
                &mut OutboundNext {
                    rest,
                    wire: &mut *self.wire,
                },
            ),
            None => write_to_wire(self.wire, msg),
        }
    }
}

/// Only raw bytes can leave the pipeline.
fn write_to_wire(wire: &mut RingBuffer, msg: Message) -> Result<()> {
    let msg = match msg.downcast::<Vec<u8>>() {
        Ok(bytes) => return wire.put_slice(&bytes),
        Err(msg) => msg,
    };
    match msg.downcast::<&'static [u8]>() {
        Ok(bytes) => wire.put_slice(*bytes),
        Err(_) => Err(Error::UnsupportedMessage(
            "expected Vec<u8> or &'static [u8] at the wire",
        )),
    }
}

/// Work a stage asked for during a callback, applied once it returns.
#[derive(Default)]
pub(crate) struct Deferred {
    pub writes: VecDeque<(Message, Promise<()>)>,
    pub close: bool,
}

impl Deferred {
    pub fn fail_writes(&mut self, error: &Error) {
        for (_, promise) in self.writes.drain(..) {
            let _ = promise.try_set_failure(error.clone());
        }
    }
}

/// The channel as seen from inside a stage callback.
pub struct ChannelContext<'a> {
    channel: &'a Channel,
    deferred: &'a mut Deferred,
}

impl<'a> ChannelContext<'a> {
    pub(crate) fn new(channel: &'a Channel, deferred: &'a mut Deferred) -> Self {
        Self { channel, deferred }
    }

    pub fn channel(&self) -> &Channel {
        self.channel
    }

    /// Writes `msg` through the whole outbound pipeline once the current
    /// callback returns. The promise completes when its bytes are flushed.
    pub fn write<M: Any + Send>(&mut self, msg: M) -> Promise<()> {
        let promise = Promise::with_executor(self.channel.event_loop().clone());
        self.deferred
            .writes
            .push_back((Box::new(msg), promise.clone()));
        promise
    }

    /// Closes the channel once the current callback returns.
    ///
    /// Writes queued from the same callback go through the pipeline first and
    /// get one flush attempt. Whatever the socket does not take right away is
    /// dropped and those writes fail with [`Error::ChannelClosed`]; to close
    /// only after a write is fully flushed, close from its promise listener.
    pub fn close(&mut self) {
        self.deferred.close = true;
    }
}

/// Ordered list of stages. Built by a channel initializer, then owned by the
/// channel.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn ChannelHandler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage at the application end.
    pub fn add_last<H: ChannelHandler>(&mut self, stage: H) -> &mut Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Inserts a stage at the wire end.
    pub fn add_first<H: ChannelHandler>(&mut self, stage: H) -> &mut Self {
        self.stages.insert(0, Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub(crate) fn fire_connected(&mut self, cx: &mut ChannelContext<'_>) -> Result<()> {
        for stage in &mut self.stages {
            stage.on_connected(cx)?;
        }
        Ok(())
    }

    pub(crate) fn fire_read(&mut self, cx: &mut ChannelContext<'_>, inbound: &mut RingBuffer) -> Result<()> {
        InboundNext {
            rest: &mut self.stages,
        }
        .invoke(cx, InboundMessage::Bytes(inbound))
    }

    pub(crate) fn fire_write(
        &mut self,
        cx: &mut ChannelContext<'_>,
        msg: Message,
        outbound: &mut RingBuffer,
    ) -> Result<()> {
        OutboundNext {
            rest: &mut self.stages,
            wire: outbound,
        }
        .invoke(cx, msg)
    }

    pub(crate) fn fire_closed(&mut self, cx: &mut ChannelContext<'_>) {
        for stage in &mut self.stages {
            stage.on_closed(cx);
        }
    }

    pub(crate) fn fire_error(&mut self, cx: &mut ChannelContext<'_>, error: &Error) {
        for stage in &mut self.stages {
            stage.on_error(cx, error);
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::detached_channel;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Turns every 2 readable bytes into a big-endian `u16`.
    struct PairDecoder;

    impl ChannelHandler for PairDecoder {
        fn on_read(
            &mut self,
            cx: &mut ChannelContext<'_>,
            msg: InboundMessage<'_>,
            next: &mut InboundNext<'_>,
        ) -> Result<()> {
            let buf = match msg {
                InboundMessage::Bytes(buf) => buf,
                other => return next.invoke(cx, other),
            };
            while buf.remaining_can_get() >= 2 {
                let value = u16::from_be_bytes([buf.get_u8()?, buf.get_u8()?]);
                next.invoke(cx, InboundMessage::Message(Box::new(value)))?;
            }
            Ok(())
        }
    }

    struct Collect(Arc<Mutex<Vec<u16>>>);

    impl ChannelHandler for Collect {
        fn on_read(
            &mut self,
            _cx: &mut ChannelContext<'_>,
            msg: InboundMessage<'_>,
            _next: &mut InboundNext<'_>,
        ) -> Result<()> {
            if let Ok(value) = msg.downcast::<u16>() {
                self.0.lock().push(*value);
            }
            Ok(())
        }
    }

    /// Encodes a `u16` to bytes on its way out.
    struct PairEncoder;

    impl ChannelHandler for PairEncoder {
        fn on_write(
            &mut self,
            cx: &mut ChannelContext<'_>,
            msg: Message,
            next: &mut OutboundNext<'_>,
        ) -> Result<()> {
            match msg.downcast::<u16>() {
                Ok(value) => next.invoke(cx, Box::new(value.to_be_bytes().to_vec())),
                Err(msg) => next.invoke(cx, msg),
            }
        }
    }

    #[test]
    fn test_decoder_keeps_partial_frames() {
        let (channel, event_loop, _peer) = detached_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.add_last(PairDecoder).add_last(Collect(Arc::clone(&seen)));

        let mut inbound = RingBuffer::new(8);
        let mut deferred = Deferred::default();
        let mut cx = ChannelContext::new(&channel, &mut deferred);

        inbound.put_slice(&[0x01, 0x02, 0x03]).unwrap();
        pipeline.fire_read(&mut cx, &mut inbound).unwrap();
        assert_eq!(*seen.lock(), vec![0x0102]);
        assert_eq!(inbound.remaining_can_get(), 1);

        inbound.put_slice(&[0x04]).unwrap();
        pipeline.fire_read(&mut cx, &mut inbound).unwrap();
        assert_eq!(*seen.lock(), vec![0x0102, 0x0304]);
        assert!(inbound.is_empty());

        event_loop.shutdown().get().unwrap();
    }

    #[test]
    fn test_unconsumed_bytes_are_dropped_at_tail() {
        let (channel, event_loop, _peer) = detached_channel();
        let mut pipeline = Pipeline::new();
        let mut inbound = RingBuffer::new(4);
        inbound.put_slice(b"abc").unwrap();

        let mut deferred = Deferred::default();
        let mut cx = ChannelContext::new(&channel, &mut deferred);
        pipeline.fire_read(&mut cx, &mut inbound).unwrap();
        assert!(inbound.is_empty());
        event_loop.shutdown().get().unwrap();
    }

    #[test]
    fn test_outbound_runs_from_application_end() {
        let (channel, event_loop, _peer) = detached_channel();
        let mut pipeline = Pipeline::new();
        pipeline.add_last(PairEncoder);
        let mut wire = RingBuffer::new(4);

        let mut deferred = Deferred::default();
        let mut cx = ChannelContext::new(&channel, &mut deferred);
        pipeline
            .fire_write(&mut cx, Box::new(0xBEEFu16), &mut wire)
            .unwrap();
        pipeline
            .fire_write(&mut cx, Box::new(&b"!"[..]), &mut wire)
            .unwrap();
        let mut out = [0u8; 3];
        wire.get_slice(&mut out).unwrap();
        assert_eq!(out, [0xBE, 0xEF, b'!']);

        assert!(matches!(
            pipeline.fire_write(&mut cx, Box::new("not bytes"), &mut wire),
            Err(Error::UnsupportedMessage(_))
        ));
        assert!(matches!(
            pipeline.fire_write(&mut cx, Box::new(vec![0u8; 5]), &mut wire),
            Err(Error::BufferOverflow { requested: 5, available: 4 })
        ));
        assert!(wire.is_empty());
        event_loop.shutdown().get().unwrap();
    }

    #[test]
    fn test_context_defers_writes_and_close() {
        let (channel, event_loop, _peer) = detached_channel();
        let mut deferred = Deferred::default();
        {
            let mut cx = ChannelContext::new(&channel, &mut deferred);
            let pending = cx.write(b"hi".to_vec());
            cx.close();
            assert!(!pending.is_done());
        }
        assert_eq!(deferred.writes.len(), 1);
        assert!(deferred.close);

        let promise = deferred.writes[0].1.clone();
        deferred.fail_writes(&Error::ChannelClosed);
        assert!(matches!(promise.try_get(), Some(Err(Error::ChannelClosed))));
        event_loop.shutdown().get().unwrap();
    }

    #[test]
    fn test_add_first_and_last_order() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last(PairEncoder).add_first(PairDecoder);
        assert_eq!(pipeline.len(), 2);
        assert!(!pipeline.is_empty());
    }
}
