use mio::{Interest, Token};

use crate::event::IoEvent;
use crate::event_loop::EventLoop;

/// Readiness callback for a source registered with an [`EventLoop`].
///
/// A handler is created on its loop's thread by the factory passed to
/// [`EventLoop::register`] and never leaves that thread, so it needs neither
/// `Send` nor `Sync` and gets `&mut self`.
pub trait EventHandler: 'static {
    /// Called for every readiness event delivered for the handler's token.
    fn handle_event(&mut self, cx: &mut HandlerContext<'_>, event: &IoEvent);

    /// Called once, right after the handler was inserted into the registry
    /// and before any event is dispatched to it.
    fn on_registered(&mut self, cx: &mut HandlerContext<'_>) {
        let _ = cx;
    }

    /// Called once when the handler leaves the registry, whatever the reason:
    /// it asked to be deregistered, someone deregistered its token, it
    /// panicked, or the loop is shutting down.
    fn on_removed(&mut self, cx: &mut HandlerContext<'_>) {
        let _ = cx;
    }
}

/// What a handler sees of the loop while one of its callbacks runs.
pub struct HandlerContext<'a> {
    token: Token,
    event_loop: &'a EventLoop,
    deregister: bool,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(token: Token, event_loop: &'a EventLoop) -> Self {
        Self {
            token,
            event_loop,
            deregister: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn event_loop(&self) -> &EventLoop {
        self.event_loop
    }

    /// Removes this handler from the registry once the current callback
    /// returns; [`EventHandler::on_removed`] follows.
    pub fn deregister(&mut self) {
        self.deregister = true;
    }

    pub(crate) fn deregister_requested(&self) -> bool {
        self.deregister
    }
}

/// Everything a handler factory receives once its source is registered.
pub struct Registered<S> {
    pub source: S,
    pub token: Token,
    pub event_loop: EventLoop,
}

pub(crate) struct HandlerEntry {
    pub handler: Box<dyn EventHandler>,
    pub interest: Interest,
}

impl HandlerEntry {
    pub fn new<H>(handler: H, interest: Interest) -> Self
    where
        H: EventHandler,
    {
        HandlerEntry {
            handler: Box::new(handler),
            interest,
        }
    }

    /// Whether `event` carries anything this entry registered for. Error and
    /// hang-up conditions are always of interest.
    pub fn wants(&self, event: &IoEvent) -> bool {
        (self.interest.is_readable() && (event.is_readable() || event.is_read_closed()))
            || (self.interest.is_writable() && (event.is_writable() || event.is_write_closed()))
            || event.is_error()
    }
}
