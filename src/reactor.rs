use std::collections::HashMap;
use std::io;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use mio::{event::Source, Interest, Token};

use crate::error::{Error, Result};
use crate::event::IoEvent;
use crate::event_loop::EventLoop;
use crate::handler::{EventHandler, HandlerContext, HandlerEntry, Registered};
use crate::poll::{PollHandle, WAKE_TOKEN};

pub(crate) enum Task {
    Run(Box<dyn FnOnce() + Send>),
    WithReactor(Box<dyn FnOnce(&mut Reactor) + Send>),
}

/// The loop-thread half of an [`EventLoop`]: owns the poller and every
/// registered handler. Built and run on the loop thread, never shared.
pub(crate) struct Reactor {
    poll_handle: PollHandle,
    ready: Vec<IoEvent>,
    handlers: HashMap<Token, HandlerEntry>,
    next_token: usize,
    event_loop: EventLoop,
    poll_timeout: Option<Duration>,
}

impl Reactor {
    pub fn new(poll_handle: PollHandle, event_loop: EventLoop, poll_timeout: Option<Duration>) -> Self {
        Self {
            poll_handle,
            ready: Vec::new(),
            handlers: HashMap::new(),
            next_token: 0,
            event_loop,
            poll_timeout,
        }
    }

    /// Polls, dispatches and runs tasks until shutdown is requested, then
    /// tears the loop down.
    pub fn run(mut self) {
        let event_loop = self.event_loop.clone();
        event_loop.mark_started();
        tracing::debug!(loop_id = event_loop.id(), "event loop started");

        while !event_loop.is_shutting_down() {
            if let Err(e) = self.turn() {
                tracing::error!(
                    loop_id = event_loop.id(),
                    error = %e,
                    "poll failed; shutting the event loop down"
                );
                event_loop.shutdown();
            }
        }

        self.terminate();
    }

    fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.event_loop.pending_tasks() > 0 {
            Some(Duration::ZERO)
        } else {
            self.poll_timeout
        };
        self.poll_handle.poll(&mut self.ready, timeout)?;

        let ready = mem::take(&mut self.ready);
        for event in &ready {
            self.dispatch(event);
        }
        self.ready = ready;

        self.run_tasks();
        Ok(())
    }

    fn dispatch(&mut self, event: &IoEvent) {
        let token = event.token();
        let Some(entry) = self.handlers.get_mut(&token) else {
            tracing::trace!(?token, "event for unknown token");
            return;
        };
        if !entry.wants(event) {
            return;
        }

        let mut cx = HandlerContext::new(token, &self.event_loop);
        let outcome = catch_unwind(AssertUnwindSafe(|| entry.handler.handle_event(&mut cx, event)));
        let remove = match outcome {
            Ok(()) => cx.deregister_requested(),
            Err(panic) => {
                let error = Error::from_panic(panic);
                tracing::error!(?token, %error, "event handler panicked; removing it");
                true
            }
        };
        if remove {
            self.remove_handler(token);
        }
    }

    /// Runs the tasks queued so far. Tasks queued by these tasks wait for
    /// the next turn so I/O keeps being served.
    fn run_tasks(&mut self) -> usize {
        let budget = self.event_loop.pending_tasks();
        let mut ran = 0;
        while ran < budget {
            let Some(task) = self.event_loop.pop_task() else {
                break;
            };
            let outcome = match task {
                Task::Run(task) => catch_unwind(AssertUnwindSafe(task)),
                Task::WithReactor(task) => catch_unwind(AssertUnwindSafe(|| task(self))),
            };
            self.event_loop.task_done();
            if let Err(panic) = outcome {
                let error = Error::from_panic(panic);
                tracing::error!(loop_id = self.event_loop.id(), %error, "task panicked");
            }
            ran += 1;
        }
        ran
    }

    pub fn register<S, H, F>(&mut self, mut source: S, interest: Interest, factory: F) -> Result<Token>
    where
        S: Source + Send + 'static,
        H: EventHandler,
        F: FnOnce(Registered<S>) -> Result<H>,
    {
        if self.event_loop.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let token = self.allocate_token();
        self.event_loop
            .registry()
            .register(&mut source, token, interest)?;

        let registered = Registered {
            source,
            token,
            event_loop: self.event_loop.clone(),
        };
        let handler = catch_unwind(AssertUnwindSafe(|| factory(registered)))
            .unwrap_or_else(|panic| Err(Error::from_panic(panic)))?;
        self.handlers
            .insert(token, HandlerEntry::new(handler, interest));
        tracing::trace!(loop_id = self.event_loop.id(), ?token, "source registered");

        let Some(entry) = self.handlers.get_mut(&token) else {
            return Ok(token);
        };
        let mut cx = HandlerContext::new(token, &self.event_loop);
        let outcome = catch_unwind(AssertUnwindSafe(|| entry.handler.on_registered(&mut cx)));
        let remove = match outcome {
            Ok(()) => cx.deregister_requested(),
            Err(panic) => {
                let error = Error::from_panic(panic);
                tracing::error!(?token, %error, "on_registered panicked; removing handler");
                true
            }
        };
        if remove {
            self.remove_handler(token);
        }
        Ok(token)
    }

    /// Drops the handler for `token`, giving it its `on_removed` callback.
    pub fn remove_handler(&mut self, token: Token) -> bool {
        let Some(mut entry) = self.handlers.remove(&token) else {
            return false;
        };
        let mut cx = HandlerContext::new(token, &self.event_loop);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| entry.handler.on_removed(&mut cx))) {
            let error = Error::from_panic(panic);
            tracing::error!(?token, %error, "on_removed panicked");
        }
        tracing::trace!(loop_id = self.event_loop.id(), ?token, "handler removed");
        true
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if token != WAKE_TOKEN && !self.handlers.contains_key(&token) {
                return token;
            }
        }
    }

    fn terminate(mut self) {
        let event_loop = self.event_loop.clone();
        self.run_tasks();

        let tokens: Vec<Token> = self.handlers.keys().copied().collect();
        for token in tokens {
            self.remove_handler(token);
        }
        self.run_tasks();

        event_loop.mark_terminated();
        while event_loop.pending_tasks() > 0 {
            if self.run_tasks() == 0 {
                thread::yield_now();
            }
        }

        // closes the poller before anyone waiting on termination wakes up
        drop(self);
        tracing::debug!(loop_id = event_loop.id(), "event loop terminated");
        let _ = event_loop.termination_future().try_set_success(());
    }
}

#[cfg(test)]
mod tests {
    use mio::Registry;

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    struct TestSource;

    impl Source for TestSource {
        fn register(&mut self, _registry: &Registry, _token: Token, _interests: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&mut self, _registry: &Registry, _token: Token, _interests: Interest) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    struct Counting {
        registered: Arc<AtomicUsize>,
        removed: Arc<AtomicUsize>,
        leave_at_once: bool,
    }

    impl EventHandler for Counting {
        fn handle_event(&mut self, _cx: &mut HandlerContext<'_>, _event: &IoEvent) {}

        fn on_registered(&mut self, cx: &mut HandlerContext<'_>) {
            self.registered.fetch_add(1, Ordering::SeqCst);
            if self.leave_at_once {
                cx.deregister();
            }
        }

        fn on_removed(&mut self, _cx: &mut HandlerContext<'_>) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_reactor<T, F>(event_loop: &EventLoop, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut Reactor) -> T + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        event_loop
            .execute_with_reactor(move |reactor| {
                let _ = tx.send(f(reactor));
            })
            .unwrap();
        rx.recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn test_tokens_are_unique_and_removal_notifies() {
        let event_loop = EventLoop::new().unwrap();
        let registered = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let (r, d) = (Arc::clone(&registered), Arc::clone(&removed));
        let tokens = on_reactor(&event_loop, move |reactor| {
            (0..3)
                .map(|_| {
                    let (r, d) = (Arc::clone(&r), Arc::clone(&d));
                    reactor
                        .register(TestSource, Interest::READABLE, move |_| {
                            Ok(Counting {
                                registered: r,
                                removed: d,
                                leave_at_once: false,
                            })
                        })
                        .unwrap()
                })
                .collect::<Vec<_>>()
        });
        assert_eq!(tokens, vec![Token(0), Token(1), Token(2)]);
        assert_eq!(registered.load(Ordering::SeqCst), 3);

        let count = on_reactor(&event_loop, move |reactor| {
            assert!(reactor.remove_handler(Token(1)));
            assert!(!reactor.remove_handler(Token(1)));
            reactor.handler_count()
        });
        assert_eq!(count, 2);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        // shutdown removes whatever is left
        event_loop.shutdown().get_timeout(WAIT).unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_deregister_from_on_registered() {
        let event_loop = EventLoop::new().unwrap();
        let registered = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let (r, d) = (Arc::clone(&registered), Arc::clone(&removed));
        let count = on_reactor(&event_loop, move |reactor| {
            reactor
                .register(TestSource, Interest::WRITABLE, move |_| {
                    Ok(Counting {
                        registered: r,
                        removed: d,
                        leave_at_once: true,
                    })
                })
                .unwrap();
            reactor.handler_count()
        });
        assert_eq!(count, 0);
        assert_eq!(registered.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        event_loop.shutdown().get_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_tasks_queued_during_shutdown_still_run() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let ran = Arc::clone(&ran);
            let again = event_loop.clone();
            event_loop
                .execute(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    let ran = Arc::clone(&ran);
                    // follow-up work scheduled from the loop itself
                    let _ = again.execute(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                })
                .unwrap();
        }
        event_loop.shutdown().get_timeout(WAIT).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 200);
    }
}
