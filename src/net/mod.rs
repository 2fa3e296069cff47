//! TCP server and client wiring on top of event loop groups.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌──────────────────┐             │
//! │  │ Server /     │────────▶ │ ChannelInitializer│            │
//! │  │ Client       │          │ (builds Pipeline) │            │
//! │  └──────────────┘          └──────────────────┘             │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ register             │ on_connected / on_read /
//!              ▼                      │ on_write / on_closed
//! ┌─────────────────────────────────────────────────────────────┐
//! │  parent group                 child group                   │
//! │  ┌──────────┐  accept   ┌──────────┐  ┌──────────┐          │
//! │  │ Acceptor │─────────▶│ loop 0   │  │ loop 1   │  ...     │
//! │  └──────────┘ next()    │ channels │  │ channels │          │
//! │                         └──────────┘  └──────────┘          │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS Events
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue/IOCP)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Server`] registers its listening socket on one loop of the parent
//! group. Every accepted stream is handed to the child group's next loop,
//! where the initializer builds its pipeline and the channel stays for its
//! whole life. A [`Client`] does the same for outbound connections on a
//! single group.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spindle_io::prelude::*;
//!
//! # fn main() -> spindle_io::Result<()> {
//! let parent = Arc::new(EventLoopGroup::new(1)?);
//! let child = Arc::new(EventLoopGroup::new(2)?);
//! let server = Server::new(parent, child, ChannelConfig::default(), |pipeline| {
//!     pipeline.add_last(Utf32Decoder::new()).add_last(Utf32Encoder);
//! })?;
//! let addr = server.bind("127.0.0.1:0".parse().unwrap()).get()?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;

use crate::channel::{Channel, ChannelState};
use crate::handler::Registered;
use crate::pipeline::Pipeline;

pub use client::Client;
pub use config::{ChannelConfig, ChannelConfigBuilder, DEFAULT_INBOUND_CAPACITY, DEFAULT_OUTBOUND_CAPACITY};
pub use server::Server;

/// Installs the stages of a new channel's pipeline.
pub type ChannelInitializer = Arc<dyn Fn(&mut Pipeline) + Send + Sync>;

pub(crate) fn build_channel(
    registered: Registered<TcpStream>,
    peer: SocketAddr,
    config: &ChannelConfig,
    initializer: &ChannelInitializer,
    state: ChannelState,
) -> Channel {
    let mut pipeline = Pipeline::new();
    initializer(&mut pipeline);
    Channel::new(
        registered.source,
        registered.token,
        registered.event_loop,
        peer,
        config,
        pipeline,
        state,
    )
}
