//! # spindle-io
//! An event-driven network I/O framework built on [`mio`]: single-threaded
//! reactors grouped into fixed-size pools, promises for moving results and
//! continuations between threads, ring buffers for vectored socket I/O, and a
//! per-connection pipeline of protocol stages.
//! ## Core Philosophy
//! spindle-io was designed for applications that require:
//! - **Predictable threading**: every connection lives on exactly one loop thread
//! - **Runtime-agnostic architecture** that doesn't force async/await patterns
//! - **Layered protocols**: decoders and encoders compose as pipeline stages
//! ## Architecture Overview
//! ```text
//! ┌────────────────┐ next() ┌─────────────┐    ┌─────────────┐
//! │ EventLoopGroup │───────▶│  EventLoop  │───▶│   Reactor   │ (loop thread)
//! └────────────────┘        └─────────────┘    └──────┬──────┘
//!                              ▲ tasks + Waker         │ IoEvent
//!                              │                       ▼
//!                      ┌───────┴──────┐    ┌──────────────────────┐
//!                      │   Promise    │◀───│ ChannelIoHandler     │
//!                      └──────────────┘    │  RingBuffer in / out │
//!                                          │  Pipeline of stages  │
//!                                          └──────────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spindle_io::prelude::*;
//!
//! struct Greeter;
//!
//! impl ChannelHandler for Greeter {
//!     fn on_connected(&mut self, cx: &mut ChannelContext<'_>) -> spindle_io::Result<()> {
//!         let channel = cx.channel().clone();
//!         cx.write("hello\n").add_listener(move |_| {
//!             channel.close();
//!         });
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> spindle_io::Result<()> {
//!     let group = Arc::new(EventLoopGroup::new(2)?);
//!     let server = Server::new(group.clone(), group.clone(), ChannelConfig::default(), |pipeline| {
//!         pipeline.add_last(Utf32Encoder).add_last(Greeter);
//!     })?;
//!     let addr = server.bind("127.0.0.1:0".parse().unwrap()).get()?;
//!     println!("listening on {addr}");
//!     group.shutdown().get()
//! }
//! ```
//!
//! Plain tasks work the same way without any socket:
//!
//! ```rust
//! use spindle_io::EventLoop;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let answer = event_loop.submit(|| Ok(6 * 7)).get().unwrap();
//! assert_eq!(answer, 42);
//! event_loop.shutdown().get().unwrap();
//! ```
//!
//! - [`EventLoop`]: one reactor thread; tasks, registration and shutdown
//! - [`EventLoopGroup`]: fixed set of loops handed out round-robin
//! - [`Promise`]: write-once result with listeners
//! - [`RingBuffer`]: circular byte buffer with vectored socket I/O
//! - [`Pipeline`] and [`ChannelHandler`]: per-connection protocol stages
//! - [`Server`] and [`Client`]: TCP wiring on top of groups

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod future;
pub mod group;
pub mod handler;
pub mod net;
pub mod pipeline;
mod poll;
mod reactor;

pub use buffer::{Fragment, FragmentList, RingBuffer};
pub use channel::Channel;
pub use codec::{Utf32Decoder, Utf32Encoder};
pub use error::{Error, Result};
pub use event::IoEvent;
pub use event_loop::{EventLoop, EventLoopConfig, EventLoopConfigBuilder, LoopState};
pub use future::Promise;
pub use group::EventLoopGroup;
pub use handler::{EventHandler, HandlerContext, Registered};
pub use net::{ChannelConfig, ChannelConfigBuilder, ChannelInitializer, Client, Server};
pub use pipeline::{
    ChannelContext, ChannelHandler, InboundMessage, InboundNext, Message, OutboundNext, Pipeline,
};

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use spindle_io::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::RingBuffer;
    pub use crate::channel::Channel;
    pub use crate::codec::{Utf32Decoder, Utf32Encoder};
    pub use crate::event_loop::{EventLoop, EventLoopConfig};
    pub use crate::future::Promise;
    pub use crate::group::EventLoopGroup;
    pub use crate::handler::{EventHandler, HandlerContext, Registered};
    pub use crate::net::{ChannelConfig, Client, Server};
    pub use crate::pipeline::{
        ChannelContext, ChannelHandler, InboundMessage, InboundNext, Message, OutboundNext,
        Pipeline,
    };
}
