use mio::{event::Event, Token};
use std::fmt;

/// Readiness snapshot of one registered source, copied out of a
/// `mio::event::Event` so it can outlive the poller's event buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    token: Token,
    readable: bool,
    writable: bool,
    read_closed: bool,
    write_closed: bool,
    error: bool,
}

impl fmt::Debug for IoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoEvent")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .field("error", &self.error)
            .finish()
    }
}

impl IoEvent {
    /// Builds a readiness event by hand, for handlers driven outside a poller.
    pub fn new(token: Token, readable: bool, writable: bool) -> Self {
        Self {
            token,
            readable,
            writable,
            read_closed: false,
            write_closed: false,
            error: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

impl From<&Event> for IoEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}
