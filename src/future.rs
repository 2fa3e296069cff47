//! Single-assignment results with listener continuations.
//!
//! A [`Promise`] is both ends of a future: the producer completes it once with
//! [`set_success`](Promise::set_success) or [`set_failure`](Promise::set_failure),
//! and any number of consumers either block on [`get`](Promise::get) or attach
//! listeners with [`add_listener`](Promise::add_listener).
//!
//! A promise may be bound to an [`EventLoop`]. Listeners of a bound promise
//! that complete on some other thread are handed to that loop as one task, so
//! code that only ever touches loop-owned state from listeners stays on the
//! loop thread. Listeners added after completion run right away on the caller's
//! thread; callers that need loop affinity in that case check
//! [`EventLoop::in_event_loop`] themselves.

use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

type Listener<T> = Box<dyn FnOnce(&Promise<T>) + Send + 'static>;

enum Outcome<T> {
    Pending,
    Success(T),
    Failure(Error),
}

struct State<T> {
    outcome: Outcome<T>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
    executor: Option<EventLoop>,
}

/// A write-once result shared between a producer and its consumers.
///
/// Cloning a promise clones the handle, not the result.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a pending promise whose listeners run on the completing thread.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a pending promise whose listeners run on `event_loop`.
    pub fn with_executor(event_loop: EventLoop) -> Self {
        Self::build(Some(event_loop))
    }

    /// Creates a promise that is already successful.
    pub fn succeeded(value: T) -> Self {
        let promise = Self::new();
        promise.inner.state.lock().outcome = Outcome::Success(value);
        promise
    }

    /// Creates a promise that has already failed.
    pub fn failed(error: Error) -> Self {
        let promise = Self::new();
        promise.inner.state.lock().outcome = Outcome::Failure(error);
        promise
    }

    fn build(executor: Option<EventLoop>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: Outcome::Pending,
                    listeners: Vec::new(),
                }),
                completed: Condvar::new(),
                executor,
            }),
        }
    }

    pub fn executor(&self) -> Option<&EventLoop> {
        self.inner.executor.as_ref()
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.inner.state.lock().outcome, Outcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Outcome::Success(_))
    }

    /// Completes the promise with `value`.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already completed: completing twice is a bug
    /// in the caller, not a condition to recover from.
    #[track_caller]
    pub fn set_success(&self, value: T) {
        if let Err(e) = self.try_set_success(value) {
            panic!("set_success: {e}");
        }
    }

    /// Fails the promise with `error`.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already completed.
    #[track_caller]
    pub fn set_failure(&self, error: Error) {
        if let Err(e) = self.try_set_failure(error) {
            panic!("set_failure: {e}");
        }
    }

    /// Completes the promise unless it is already done, in which case
    /// [`Error::AlreadyCompleted`] is returned and `value` is dropped.
    pub fn try_set_success(&self, value: T) -> Result<()> {
        self.complete(Outcome::Success(value))
    }

    /// Fails the promise unless it is already done.
    pub fn try_set_failure(&self, error: Error) -> Result<()> {
        self.complete(Outcome::Failure(error))
    }

    /// Registers `listener` to run once the promise completes.
    ///
    /// Listeners run exactly once, in registration order. If the promise is
    /// already complete the listener runs immediately on the calling thread.
    ///
    /// Order is only kept among listeners added while pending. When a
    /// loop-bound promise is completed off its loop, those listeners wait in
    /// the loop's task queue, and a listener added after completion runs
    /// inline and may come first.
    pub fn add_listener<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(&Promise<T>) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if let Outcome::Pending = state.outcome {
                state.listeners.push(Box::new(listener));
                return self;
            }
        }
        invoke(self, listener);
        self
    }

    fn complete(&self, outcome: Outcome<T>) -> Result<()> {
        let listeners = {
            let mut state = self.inner.state.lock();
            if !matches!(state.outcome, Outcome::Pending) {
                return Err(Error::AlreadyCompleted);
            }
            state.outcome = outcome;
            mem::take(&mut state.listeners)
        };
        self.inner.completed.notify_all();
        self.notify(listeners);
        Ok(())
    }

    fn notify(&self, listeners: Vec<Listener<T>>) {
        if listeners.is_empty() {
            return;
        }
        match &self.inner.executor {
            Some(event_loop) if !event_loop.in_event_loop() => {
                let promise = self.clone();
                let task = Box::new(move || notify_all(&promise, listeners));
                if let Err(task) = event_loop.try_execute(task) {
                    tracing::debug!(
                        loop_id = event_loop.id(),
                        "event loop terminated; running promise listeners inline"
                    );
                    task();
                }
            }
            _ => notify_all(self, listeners),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Blocks until the promise completes and returns its outcome.
    ///
    /// Fails with [`Error::WouldDeadlock`] when called on the promise's own
    /// event loop thread while it is still pending, since nothing could ever
    /// complete it.
    pub fn get(&self) -> Result<T> {
        let mut state = self.inner.state.lock();
        if matches!(state.outcome, Outcome::Pending) && self.on_own_loop() {
            return Err(Error::WouldDeadlock);
        }
        while matches!(state.outcome, Outcome::Pending) {
            self.inner.completed.wait(&mut state);
        }
        state.outcome.cloned()
    }

    /// Like [`get`](Self::get) but gives up with [`Error::Timeout`] after
    /// `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        if matches!(state.outcome, Outcome::Pending) && self.on_own_loop() {
            return Err(Error::WouldDeadlock);
        }
        while matches!(state.outcome, Outcome::Pending) {
            if self
                .inner
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                if matches!(state.outcome, Outcome::Pending) {
                    return Err(Error::Timeout);
                }
                break;
            }
        }
        state.outcome.cloned()
    }

    /// Returns the outcome without blocking, or `None` while pending.
    pub fn try_get(&self) -> Option<Result<T>> {
        let state = self.inner.state.lock();
        match state.outcome {
            Outcome::Pending => None,
            _ => Some(state.outcome.cloned()),
        }
    }
}

impl<T> Promise<T> {
    fn on_own_loop(&self) -> bool {
        self.inner
            .executor
            .as_ref()
            .is_some_and(EventLoop::in_event_loop)
    }
}

impl<T: Clone> Outcome<T> {
    fn cloned(&self) -> Result<T> {
        match self {
            Outcome::Success(value) => Ok(value.clone()),
            Outcome::Failure(error) => Err(error.clone()),
            Outcome::Pending => unreachable!("outcome read while pending"),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.lock().outcome {
            Outcome::Pending => "pending",
            Outcome::Success(_) => "success",
            Outcome::Failure(_) => "failure",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

fn notify_all<T>(promise: &Promise<T>, listeners: Vec<Listener<T>>) {
    for listener in listeners {
        invoke(promise, listener);
    }
}

fn invoke<T, F>(promise: &Promise<T>, listener: F)
where
    F: FnOnce(&Promise<T>),
{
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(promise))) {
        let error = Error::from_panic(panic);
        tracing::error!(%error, "promise listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_listeners_run_in_order_once() {
        let promise = Promise::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..2 {
            let order = Arc::clone(&order);
            promise.add_listener(move |p| {
                let value = p.try_get().unwrap().unwrap();
                order.lock().push((id, value));
            });
        }
        assert!(order.lock().is_empty());

        promise.set_success(7);
        assert_eq!(*order.lock(), vec![(0, 7), (1, 7)]);
        assert!(promise.try_set_success(8).is_err());
        assert_eq!(order.lock().len(), 2);
    }

    #[test]
    fn test_late_listener_runs_immediately() {
        let promise = Promise::<&'static str>::new();
        promise.set_success("done");

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        promise.add_listener(move |p| {
            assert_eq!(p.get().unwrap(), "done");
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "promise already completed")]
    fn test_double_completion_panics() {
        let promise = Promise::<()>::new();
        promise.set_success(());
        promise.set_success(());
    }

    #[test]
    fn test_try_set_reports_already_completed() {
        let promise = Promise::<()>::new();
        promise.try_set_failure(Error::ChannelClosed).unwrap();
        assert!(matches!(
            promise.try_set_success(()),
            Err(Error::AlreadyCompleted)
        ));
        assert!(matches!(promise.get(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_get_blocks_until_completed_elsewhere() {
        let promise = Promise::<u64>::new();
        let producer = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.set_success(42);
        });
        assert_eq!(promise.get().unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_get_timeout() {
        let promise = Promise::<u8>::new();
        assert!(matches!(
            promise.get_timeout(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
        promise.set_success(1);
        assert_eq!(promise.get_timeout(Duration::from_millis(10)).unwrap(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let promise = Promise::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        promise.add_listener(|_| panic!("listener bug"));
        let c = Arc::clone(&calls);
        promise.add_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        promise.set_success(());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_listener_overtakes_queued_hop() {
        let event_loop = EventLoop::new().unwrap();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        event_loop
            .execute(move || {
                let _ = gate_rx.recv();
            })
            .unwrap();

        let promise = Promise::<()>::with_executor(event_loop.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        let early = Arc::clone(&order);
        promise.add_listener(move |_| early.lock().push("early"));

        // the loop is parked, so the early listener stays queued behind it
        promise.set_success(());
        let late = Arc::clone(&order);
        promise.add_listener(move |_| late.lock().push("late"));
        assert_eq!(*order.lock(), vec!["late"]);

        gate_tx.send(()).unwrap();
        event_loop.shutdown().get_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), vec!["late", "early"]);
    }

    #[test]
    fn test_prebuilt_outcomes() {
        assert_eq!(Promise::succeeded(3).try_get().unwrap().unwrap(), 3);
        assert!(matches!(
            Promise::<u8>::failed(Error::Shutdown).try_get(),
            Some(Err(Error::Shutdown))
        ));
        assert!(Promise::<u8>::new().try_get().is_none());
    }
}
