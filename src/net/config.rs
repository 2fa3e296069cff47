use crate::error::{Error, Result};

pub const DEFAULT_INBOUND_CAPACITY: usize = 8192;
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64 * 1024;

/// Per-channel settings shared by [`Server`](crate::Server) and
/// [`Client`](crate::Client).
///
/// ## Buffers
///
/// - inbound_capacity: bytes read from the socket that no stage has consumed
///   yet. A channel whose pipeline leaves this buffer full is closed with
///   `BufferOverflow`.
/// - outbound_capacity: bytes written by the application that the socket has
///   not accepted yet. A write that does not fit fails on its own promise.
///
/// ## Socket Options
///
/// - no_delay: When enabled (default), disables Nagle's algorithm for lower latency
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Size of the inbound ring buffer
    pub inbound_capacity: usize,
    /// Size of the outbound ring buffer
    pub outbound_capacity: usize,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
}

impl ChannelConfig {
    /// Create a new builder for ChannelConfig
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.inbound_capacity == 0 {
            return Err(Error::InvalidConfig(
                "inbound_capacity must be greater than zero".into(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(Error::InvalidConfig(
                "outbound_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            no_delay: true,
        }
    }
}

/// Builder for ChannelConfig.
///
/// Fields left unset fall back to ChannelConfig::default().
#[derive(Debug, Default)]
pub struct ChannelConfigBuilder {
    inbound_capacity: Option<usize>,
    outbound_capacity: Option<usize>,
    no_delay: Option<bool>,
}

impl ChannelConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the inbound buffer size
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = Some(capacity);
        self
    }

    /// Set the outbound buffer size
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = Some(capacity);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn build(self) -> ChannelConfig {
        let default = ChannelConfig::default();
        ChannelConfig {
            inbound_capacity: self.inbound_capacity.unwrap_or(default.inbound_capacity),
            outbound_capacity: self
                .outbound_capacity
                .unwrap_or(default.outbound_capacity),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
        }
    }
}
