//! The thread-safe handle to a single-threaded reactor.
//!
//! An [`EventLoop`] is a cheap, clonable handle. The loop itself runs on a
//! dedicated thread spawned at construction and owns
//! the poller and the handler registry; everything else reaches it through the
//! task queue:
//!
//! ```text
//!  any thread                          loop thread
//!  ──────────                          ───────────
//!  execute / submit ──▶ task queue ──▶ run_tasks()
//!  register         ──▶ task queue ──▶ Reactor::register ──▶ registry
//!        │                                   ▲
//!        └──────── mio::Waker ───────────────┘ (interrupts poll)
//! ```
//!
//! Because only the loop thread ever touches the registry and the poller,
//! neither needs a lock.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use lockfree::queue::Queue;
use mio::{event::Source, Interest, Registry, Token, Waker};

use crate::error::{Error, Result};
use crate::future::Promise;
use crate::handler::{EventHandler, Registered};
use crate::poll::PollHandle;
use crate::reactor::{Reactor, Task};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "spindle-loop";

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

/// Configuration shared by every loop built from it.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Maximum number of readiness events collected per poll
    pub events_capacity: usize,
    /// Upper bound on one poll wait; `None` blocks until an event or a wake-up
    pub poll_timeout: Option<Duration>,
    /// Loop threads are named `"{prefix}-{id}"`
    pub thread_name_prefix: String,
}

impl EventLoopConfig {
    pub fn builder() -> EventLoopConfigBuilder {
        EventLoopConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.events_capacity == 0 {
            return Err(Error::InvalidConfig(
                "events_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

/// Builder for [`EventLoopConfig`]; unset fields keep their defaults.
#[derive(Debug, Default)]
pub struct EventLoopConfigBuilder {
    events_capacity: Option<usize>,
    poll_timeout: Option<Option<Duration>>,
    thread_name_prefix: Option<String>,
}

impl EventLoopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> EventLoopConfig {
        let default = EventLoopConfig::default();
        EventLoopConfig {
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            thread_name_prefix: self
                .thread_name_prefix
                .unwrap_or(default.thread_name_prefix),
        }
    }
}

/// Lifecycle of a loop. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LoopState {
    NotStarted = 0,
    Running = 1,
    ShuttingDown = 2,
    Terminated = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::NotStarted,
            1 => LoopState::Running,
            2 => LoopState::ShuttingDown,
            _ => LoopState::Terminated,
        }
    }
}

struct Shared {
    id: usize,
    tasks: Queue<Task>,
    // admitted tasks not yet run; bumped before the push so the loop can
    // tell a task is on its way even before it is visible in the queue
    pending: AtomicUsize,
    state: AtomicU8,
    waker: Waker,
    registry: Registry,
    thread: OnceLock<ThreadId>,
    termination: Promise<()>,
}

/// Handle to one reactor thread.
///
/// All methods may be called from any thread. Handlers registered on the loop
/// only ever run on its thread, one callback at a time.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Starts a loop with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(&EventLoopConfig::default())
    }

    /// Creates the poller and spawns the loop thread.
    pub fn with_config(config: &EventLoopConfig) -> Result<Self> {
        config.validate()?;
        let (poll, registry, waker) = PollHandle::new(config.events_capacity)?;
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let event_loop = EventLoop {
            shared: Arc::new(Shared {
                id,
                tasks: Queue::new(),
                pending: AtomicUsize::new(0),
                state: AtomicU8::new(LoopState::NotStarted as u8),
                waker,
                registry,
                thread: OnceLock::new(),
                termination: Promise::new(),
            }),
        };

        let handle = event_loop.clone();
        let poll_timeout = config.poll_timeout;
        let thread = thread::Builder::new()
            .name(format!("{}-{id}", config.thread_name_prefix))
            .spawn(move || Reactor::new(poll, handle, poll_timeout).run())?;
        let _ = event_loop.shared.thread.set(thread.thread().id());

        Ok(event_loop)
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() >= LoopState::ShuttingDown
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == LoopState::Terminated
    }

    /// Whether the calling thread is this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    /// Queues `task` to run on the loop thread.
    ///
    /// Tasks from one producer run in submission order. Tasks are accepted
    /// until the loop has terminated, including while it shuts down.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.admit() {
            return Err(Error::Shutdown);
        }
        self.push(Task::Run(Box::new(task)));
        Ok(())
    }

    /// Queues `work` and returns a promise for its result. A panic inside
    /// `work` fails the promise with [`Error::TaskPanicked`].
    pub fn submit<T, F>(&self, work: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let promise = Promise::with_executor(self.clone());
        let completer = promise.clone();
        let task = move || {
            let outcome = catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|panic| Err(Error::from_panic(panic)));
            let _ = match outcome {
                Ok(value) => completer.try_set_success(value),
                Err(error) => completer.try_set_failure(error),
            };
        };
        if let Err(error) = self.execute(task) {
            let _ = promise.try_set_failure(error);
        }
        promise
    }

    /// Registers `source` for `interest` and installs the handler built by
    /// `factory`.
    ///
    /// Registration always happens on the loop thread, as a queued task, even
    /// when called from it; the returned promise resolves with the source's
    /// token once the handler is in place. Fails with [`Error::Shutdown`] once
    /// the loop is shutting down.
    pub fn register<S, H, F>(&self, source: S, interest: Interest, factory: F) -> Promise<Token>
    where
        S: Source + Send + 'static,
        H: EventHandler,
        F: FnOnce(Registered<S>) -> Result<H> + Send + 'static,
    {
        let promise = Promise::with_executor(self.clone());
        if self.is_shutting_down() {
            let _ = promise.try_set_failure(Error::Shutdown);
            return promise;
        }
        let completer = promise.clone();
        let queued = self.execute_with_reactor(move |reactor| {
            let _ = match reactor.register(source, interest, factory) {
                Ok(token) => completer.try_set_success(token),
                Err(error) => completer.try_set_failure(error),
            };
        });
        if let Err(error) = queued {
            let _ = promise.try_set_failure(error);
        }
        promise
    }

    /// Removes the handler registered under `token`. Removing a token that
    /// is not registered succeeds without effect.
    pub fn deregister(&self, token: Token) -> Promise<()> {
        let promise = Promise::with_executor(self.clone());
        let completer = promise.clone();
        let queued = self.execute_with_reactor(move |reactor| {
            if !reactor.remove_handler(token) {
                tracing::trace!(?token, "deregister of unknown token");
            }
            let _ = completer.try_set_success(());
        });
        if let Err(error) = queued {
            let _ = promise.try_set_failure(error);
        }
        promise
    }

    /// Asks the loop to stop and returns the promise completed once it has
    /// terminated. Queued tasks still run; every handler is removed.
    /// Calling it again returns the same promise.
    pub fn shutdown(&self) -> Promise<()> {
        let state = &self.shared.state;
        let mut current = state.load(Ordering::SeqCst);
        while current < LoopState::ShuttingDown as u8 {
            match state.compare_exchange(
                current,
                LoopState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    tracing::debug!(loop_id = self.id(), "event loop shutdown requested");
                    self.wake();
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        self.shared.termination.clone()
    }

    /// The promise completed when the loop has terminated.
    pub fn termination_future(&self) -> Promise<()> {
        self.shared.termination.clone()
    }

    pub(crate) fn execute_with_reactor<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        if !self.admit() {
            return Err(Error::Shutdown);
        }
        self.push(Task::WithReactor(Box::new(task)));
        Ok(())
    }

    /// Like [`execute`](Self::execute) but hands the task back when the loop
    /// has terminated, so the caller can run it some other way.
    pub(crate) fn try_execute(
        &self,
        task: Box<dyn FnOnce() + Send>,
    ) -> std::result::Result<(), Box<dyn FnOnce() + Send>> {
        if !self.admit() {
            return Err(task);
        }
        self.push(Task::Run(task));
        Ok(())
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn pending_tasks(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn pop_task(&self) -> Option<Task> {
        self.shared.tasks.pop()
    }

    pub(crate) fn task_done(&self) {
        self.shared.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_started(&self) {
        let _ = self.shared.thread.set(thread::current().id());
        let _ = self.shared.state.compare_exchange(
            LoopState::NotStarted as u8,
            LoopState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_terminated(&self) {
        self.shared
            .state
            .store(LoopState::Terminated as u8, Ordering::SeqCst);
    }

    /// Counts the task as pending unless the loop has terminated. The count
    /// goes up before the state check, so a loop that has just terminated
    /// either rejects the task here or waits for it to show up.
    fn admit(&self) -> bool {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.is_terminated() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn push(&self, task: Task) {
        self.shared.tasks.push(task);
        if !self.in_event_loop() {
            self.wake();
        }
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            tracing::warn!(loop_id = self.id(), error = %e, "failed to wake event loop");
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
