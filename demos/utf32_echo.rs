//! UTF-32 line echo: a server that sends every decoded line back, and a client
//! that sends a few lines and prints what comes back.
//!
//! ```text
//! RUST_LOG=spindle_io=debug cargo run --example utf32_echo -- 127.0.0.1:7000
//! ```

use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Context;
use spindle_io::prelude::*;
use tracing_subscriber::EnvFilter;

/// Writes every inbound line back to its sender.
struct Echo;

impl ChannelHandler for Echo {
    fn on_connected(&mut self, cx: &mut ChannelContext<'_>) -> spindle_io::Result<()> {
        tracing::info!(peer = %cx.channel().peer_addr(), "client connected");
        Ok(())
    }

    fn on_read(
        &mut self,
        cx: &mut ChannelContext<'_>,
        msg: InboundMessage<'_>,
        _next: &mut InboundNext<'_>,
    ) -> spindle_io::Result<()> {
        if let Ok(line) = msg.downcast::<String>() {
            tracing::info!(line = %line, "echo");
            cx.write(format!("{line}\n"));
        }
        Ok(())
    }

    fn on_closed(&mut self, cx: &mut ChannelContext<'_>) {
        tracing::info!(peer = %cx.channel().peer_addr(), "client disconnected");
    }
}

/// Hands every line the server sends back to `main`.
struct Replies(mpsc::Sender<String>);

impl ChannelHandler for Replies {
    fn on_read(
        &mut self,
        _cx: &mut ChannelContext<'_>,
        msg: InboundMessage<'_>,
        _next: &mut InboundNext<'_>,
    ) -> spindle_io::Result<()> {
        if let Ok(line) = msg.downcast::<String>() {
            let _ = self.0.send(*line);
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:0".to_string())
        .parse()
        .context("invalid listen address")?;

    let boss = Arc::new(EventLoopGroup::new(1)?);
    let workers = Arc::new(EventLoopGroup::with_default_size()?);

    let server = Server::new(
        Arc::clone(&boss),
        Arc::clone(&workers),
        ChannelConfig::default(),
        |pipeline| {
            pipeline
                .add_last(Utf32Decoder::new())
                .add_last(Utf32Encoder)
                .add_last(Echo);
        },
    )?;
    let local = server.bind(addr).get()?;
    tracing::info!(address = %local, "echo server ready");

    let (tx, rx) = mpsc::channel();
    let client = Client::new(Arc::clone(&workers), ChannelConfig::default(), move |pipeline| {
        pipeline
            .add_last(Utf32Decoder::new())
            .add_last(Utf32Encoder)
            .add_last(Replies(tx.clone()));
    })?;
    let channel = client.connect(local).get()?;

    for line in ["hello", "naïve café", "ünïcödé ✓"] {
        channel.write(format!("{line}\n")).get()?;
        let reply = rx
            .recv_timeout(Duration::from_secs(5))
            .context("no reply from server")?;
        println!("{line} -> {reply}");
    }

    channel.close().get()?;
    workers.shutdown().get()?;
    boss.shutdown().get()?;
    Ok(())
}
