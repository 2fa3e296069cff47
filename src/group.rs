use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, EventLoopConfig};
use crate::future::Promise;

pub const DEFAULT_GROUP_SIZE: usize = 4;

/// A fixed set of event loops handed out round-robin.
///
/// Dropping the group asks every loop to shut down without waiting for it;
/// call [`shutdown`](Self::shutdown) and wait on the promise to join them.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Starts `size` loops with the default configuration.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_config(size, &EventLoopConfig::default())
    }

    /// Starts one loop per available core.
    pub fn with_default_size() -> Result<Self> {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_GROUP_SIZE);
        Self::new(size)
    }

    pub fn with_config(size: usize, config: &EventLoopConfig) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig(
                "an event loop group needs at least one loop".into(),
            ));
        }
        let mut loops = Vec::with_capacity(size);
        for _ in 0..size {
            match EventLoop::with_config(config) {
                Ok(event_loop) => loops.push(event_loop),
                Err(e) => {
                    for started in &loops {
                        started.shutdown();
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!(size, "event loop group started");
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// The next loop in round-robin order.
    pub fn next(&self) -> &EventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[index]
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventLoop> {
        self.loops.iter()
    }

    /// Shuts every loop down. The promise completes once all of them have
    /// terminated, failing with the first error any of them reported.
    pub fn shutdown(&self) -> Promise<()> {
        let all_done = Promise::new();
        let remaining = Arc::new(AtomicUsize::new(self.loops.len()));
        let first_error = Arc::new(Mutex::new(None::<Error>));

        for event_loop in &self.loops {
            let all_done = all_done.clone();
            let remaining = Arc::clone(&remaining);
            let first_error = Arc::clone(&first_error);
            event_loop.shutdown().add_listener(move |terminated| {
                if let Some(Err(error)) = terminated.try_get() {
                    first_error.lock().get_or_insert(error);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let _ = match first_error.lock().take() {
                        Some(error) => all_done.try_set_failure(error),
                        None => all_done.try_set_success(()),
                    };
                }
            });
        }
        all_done
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.loops)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_group_creation() {
        let group = EventLoopGroup::new(3).unwrap();
        assert_eq!(group.len(), 3);
        let ids: HashSet<usize> = group.iter().map(EventLoop::id).collect();
        assert_eq!(ids.len(), 3);
        group.shutdown().get_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_empty_group_is_rejected() {
        assert!(matches!(
            EventLoopGroup::new(0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_round_robin() {
        let group = EventLoopGroup::new(2).unwrap();
        let picks: Vec<usize> = (0..4).map(|_| group.next().id()).collect();
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
        group.shutdown().get_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_work_spreads_across_loops() {
        let group = EventLoopGroup::new(4).unwrap();
        let names: HashSet<String> = (0..8)
            .map(|_| {
                group
                    .next()
                    .submit(|| Ok(std::thread::current().name().unwrap_or("").to_owned()))
                    .get_timeout(WAIT)
                    .unwrap()
            })
            .collect();
        assert_eq!(names.len(), 4);
        group.shutdown().get_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_shutdown_terminates_every_loop() {
        let group = EventLoopGroup::new(3).unwrap();
        group.shutdown().get_timeout(WAIT).unwrap();
        assert!(group.iter().all(EventLoop::is_terminated));
        // a second request resolves immediately
        group.shutdown().get_timeout(WAIT).unwrap();
    }
}
