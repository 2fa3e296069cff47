//! Line-oriented UTF-32 text codec.
//!
//! Each character travels as one big-endian 32-bit code point; a `'\n'` code
//! point ends a line. The decoder emits one `String` per line without the
//! newline, and the encoder turns `String` or `&'static str` messages into
//! code point bytes.

use crate::error::{Error, Result};
use crate::pipeline::{ChannelContext, ChannelHandler, InboundMessage, InboundNext, Message, OutboundNext};

const CODE_POINT_LEN: usize = 4;

#[derive(Debug, Default)]
pub struct Utf32Decoder {
    line: String,
}

impl Utf32Decoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelHandler for Utf32Decoder {
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

        // a partial code point stays in the buffer until the rest arrives
        while buf.remaining_can_get() >= CODE_POINT_LEN {
            let code_point = buf.get_u32()?;
            let ch = char::from_u32(code_point)
                .ok_or_else(|| Error::Decode(format!("invalid code point {code_point:#x}")))?;
            if ch == '\n' {
                let line = std::mem::take(&mut self.line);
                next.invoke(cx, InboundMessage::Message(Box::new(line)))?;
            } else {
                self.line.push(ch);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Utf32Encoder;

impl Utf32Encoder {
    pub fn encode(text: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(text.chars().count() * CODE_POINT_LEN);
        for ch in text.chars() {
            bytes.extend_from_slice(&u32::from(ch).to_be_bytes());
        }
        bytes
    }
}

impl ChannelHandler for Utf32Encoder {
    fn on_write(
        &mut self,
        cx: &mut ChannelContext<'_>,
        msg: Message,
        next: &mut OutboundNext<'_>,
    ) -> Result<()> {
        let msg = match msg.downcast::<String>() {
            Ok(text) => return next.invoke(cx, Box::new(Self::encode(&text))),
            Err(msg) => msg,
        };
        match msg.downcast::<&'static str>() {
            Ok(text) => next.invoke(cx, Box::new(Self::encode(*text))),
            Err(msg) => next.invoke(cx, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use crate::channel::testing::detached_channel;
    use crate::pipeline::{Deferred, Pipeline};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Lines(Arc<Mutex<Vec<String>>>);

    impl ChannelHandler for Lines {
        fn on_read(
            &mut self,
            _cx: &mut ChannelContext<'_>,
            msg: InboundMessage<'_>,
            _next: &mut InboundNext<'_>,
        ) -> Result<()> {
            if let Ok(line) = msg.downcast::<String>() {
                self.0.lock().push(*line);
            }
            Ok(())
        }
    }

    #[test]
    fn test_encode_is_big_endian() {
        assert_eq!(Utf32Encoder::encode("A\n"), vec![0, 0, 0, 0x41, 0, 0, 0, 0x0A]);
        assert_eq!(Utf32Encoder::encode("€"), vec![0, 0, 0x20, 0xAC]);
    }

    #[test]
    fn test_decoder_waits_for_whole_code_points() {
        let (channel, event_loop, _peer) = detached_channel();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_last(Utf32Decoder::new())
            .add_last(Lines(Arc::clone(&lines)));

        let mut inbound = RingBuffer::new(16);
        let mut deferred = Deferred::default();
        let mut cx = ChannelContext::new(&channel, &mut deferred);

        let bytes = Utf32Encoder::encode("hé\nx\n");
        // two bytes at a time: half a code point per read
        for chunk in bytes.chunks(2) {
            inbound.put_slice(chunk).unwrap();
            pipeline.fire_read(&mut cx, &mut inbound).unwrap();
        }
        assert_eq!(*lines.lock(), vec!["hé".to_string(), "x".to_string()]);
        assert!(inbound.is_empty());
        event_loop.shutdown().get().unwrap();
    }

    #[test]
    fn test_invalid_code_point_is_a_decode_error() {
        let (channel, event_loop, _peer) = detached_channel();
        let mut pipeline = Pipeline::new();
        pipeline.add_last(Utf32Decoder::new());
        let mut inbound = RingBuffer::new(8);
        inbound.put_u32(0xD800).unwrap();

        let mut deferred = Deferred::default();
        let mut cx = ChannelContext::new(&channel, &mut deferred);
        assert!(matches!(
            pipeline.fire_read(&mut cx, &mut inbound),
            Err(Error::Decode(_))
        ));
        event_loop.shutdown().get().unwrap();
    }

    #[test]
    fn test_encoder_handles_both_string_kinds() {
        let (channel, event_loop, _peer) = detached_channel();
        let mut pipeline = Pipeline::new();
        pipeline.add_last(Utf32Encoder);
        let mut wire = RingBuffer::new(16);

        let mut deferred = Deferred::default();
        let mut cx = ChannelContext::new(&channel, &mut deferred);
        pipeline.fire_write(&mut cx, Box::new("a"), &mut wire).unwrap();
        pipeline
            .fire_write(&mut cx, Box::new(String::from("b")), &mut wire)
            .unwrap();
        pipeline
            .fire_write(&mut cx, Box::new(vec![9u8]), &mut wire)
            .unwrap();

        let mut out = [0u8; 9];
        wire.get_slice(&mut out).unwrap();
        assert_eq!(out, [0, 0, 0, b'a', 0, 0, 0, b'b', 9]);
        event_loop.shutdown().get().unwrap();
    }
}
