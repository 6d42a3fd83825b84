//! In-flight session accounting for graceful shutdown.
//!
//! Every tunnel session holds a [`SessionGuard`] from the moment its request
//! arrives until its bridge has fully stopped. On shutdown the server stops
//! handing out guards and waits, for a bounded time, for the count to drop to
//! zero. Sessions still open when the wait expires are abandoned.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Result of [`DrainCoordinator::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every session finished before the deadline.
    Drained,
    /// The deadline passed with `remaining` sessions still open.
    TimedOut { remaining: usize },
}

struct Inner {
    active: AtomicUsize,
    draining: AtomicBool,
    idle: Notify,
}

/// Counts in-flight sessions. Cheap to clone; clones share the counter.
#[derive(Clone)]
pub struct DrainCoordinator {
    inner: Arc<Inner>,
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a new session. Returns `None` once shutdown has begun.
    ///
    /// The returned guard is `Send` so it can be moved into the task that
    /// runs the session; the session stays counted until the guard drops.
    pub fn try_acquire(&self) -> Option<SessionGuard> {
        // Count first, then check: a shutdown that starts in between either
        // sees this session in `active` or is seen here.
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = SessionGuard {
            inner: Arc::clone(&self.inner),
        };
        if self.inner.draining.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    /// Number of sessions currently counted.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stop admitting new sessions.
    pub fn begin_shutdown(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
    }

    /// Wait until no session is in flight or `max_wait` elapses.
    pub async fn wait(&self, max_wait: Duration) -> DrainOutcome {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before reading the count so a release in between
            // cannot be missed.
            notified.as_mut().enable();

            if self.active() == 0 {
                return DrainOutcome::Drained;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return match self.active() {
                    0 => DrainOutcome::Drained,
                    remaining => DrainOutcome::TimedOut { remaining },
                };
            }
        }
    }
}

/// RAII guard that decrements the session count on drop.
pub struct SessionGuard {
    inner: Arc<Inner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
