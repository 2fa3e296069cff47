use std::{io, result::Result as StdResult, sync::Arc};

pub type Result<T> = StdResult<T, Error>;

/// Every failure the crate reports, either synchronously from a call or
/// through a failed [`Promise`](crate::Promise).
///
/// The type is `Clone` so a single failure can be handed to every waiter and
/// listener of a promise; I/O errors are shared behind an `Arc` for that reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Read or consume more bytes than a ring buffer holds.
    #[error("buffer underflow: requested {requested} bytes, {available} available")]
    BufferUnderflow { requested: usize, available: usize },

    /// Write or produce more bytes than a ring buffer has free.
    #[error("buffer overflow: requested {requested} bytes, {available} free")]
    BufferOverflow { requested: usize, available: usize },

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A promise was completed a second time.
    #[error("promise already completed")]
    AlreadyCompleted,

    /// The event loop no longer accepts the work.
    #[error("event loop is shutting down")]
    Shutdown,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("channel is closed")]
    ChannelClosed,

    /// Blocking on a pending promise from the thread that must complete it.
    #[error("blocking on a pending promise from its own event loop would deadlock")]
    WouldDeadlock,

    #[error("timed out waiting for completion")]
    Timeout,

    /// An outbound message reached the wire without being encoded to bytes.
    #[error("unsupported outbound message type: {0}")]
    UnsupportedMessage(&'static str),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns the underlying I/O error kind, if this is an I/O failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io(e) => Some(e.kind()),
            _ => None,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::TaskPanicked(message)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion_keeps_kind() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "peer went away").into();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
        assert_eq!(Error::ChannelClosed.io_kind(), None);
    }

    #[test]
    fn test_panic_payloads() {
        let static_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert!(matches!(Error::from_panic(static_payload), Error::TaskPanicked(m) if m == "boom"));

        let owned_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert!(
            matches!(Error::from_panic(owned_payload), Error::TaskPanicked(m) if m == "owned boom")
        );
    }
}
