use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};

use crate::event::IoEvent;

/// Token reserved for the loop's waker; never handed out to a source.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// The poller half of an event loop: owned and polled by the loop thread only.
pub(crate) struct PollHandle {
    poller: Poll,
    events: Events,
}

impl PollHandle {
    /// Creates the poller together with a cloned registry and a waker that
    /// other threads use to interrupt [`poll`](Self::poll).
    pub fn new(events_capacity: usize) -> io::Result<(Self, Registry, Waker)> {
        let poller = Poll::new()?;
        let registry = poller.registry().try_clone()?;
        let waker = Waker::new(poller.registry(), WAKE_TOKEN)?;
        Ok((
            PollHandle {
                poller,
                events: Events::with_capacity(events_capacity),
            },
            registry,
            waker,
        ))
    }

    /// Blocks for readiness and copies the ready events into `ready`, skipping
    /// wake-ups. A poll interrupted by a signal yields no events.
    pub fn poll(&mut self, ready: &mut Vec<IoEvent>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        match self.poller.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        ready.extend(
            self.events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(IoEvent::from),
        );
        Ok(())
    }
}
