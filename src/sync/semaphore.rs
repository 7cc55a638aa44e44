//! Counting semaphore that can also be "signaled".
//!
//! A signal is a manual-reset flag raised by the idle connection holder when
//! it has connections to hand out. Waiters that opt in to signals stop
//! waiting for a permit as soon as the flag is up, so they can reuse an idle
//! connection instead of opening a new one.
//!
//! Both blocking and async waits are supported against the same state.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Blocking waiters re-check cancellation at this granularity.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of a semaphore wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A permit was taken and must be released.
    Entered,
    /// The signal was raised while waiting. No permit is held.
    Signaled,
    /// The timeout elapsed. No permit is held.
    TimedOut,
}

/// Reasons a wait ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("wait was cancelled")]
    Cancelled,
    #[error("semaphore was closed")]
    Closed,
}

#[derive(Debug)]
struct Permits {
    available: usize,
    signaled: bool,
    closed: bool,
}

/// Semaphore combining a permit count with a manual-reset signal.
pub struct SignalableSemaphore {
    capacity: usize,
    permits: Mutex<Permits>,
    condvar: Condvar,
    notify: Notify,
}

impl SignalableSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Mutex::new(Permits {
                available: capacity,
                signaled: false,
                closed: false,
            }),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.lock().available
    }

    /// Permits currently held.
    pub fn entered(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn is_signaled(&self) -> bool {
        self.permits.lock().signaled
    }

    /// Take a permit without waiting.
    pub fn try_enter(&self) -> bool {
        let mut permits = self.permits.lock();
        if !permits.closed && permits.available > 0 {
            permits.available -= 1;
            true
        } else {
            false
        }
    }

    /// Return a previously entered permit.
    pub fn release(&self) {
        {
            let mut permits = self.permits.lock();
            debug_assert!(permits.available < self.capacity, "semaphore over-released");
            if permits.available < self.capacity {
                permits.available += 1;
            }
        }
        self.wake_all();
    }

    /// Raise the signal. Signal-aware waiters return [`WaitResult::Signaled`].
    pub fn signal(&self) {
        {
            let mut permits = self.permits.lock();
            if permits.signaled {
                return;
            }
            permits.signaled = true;
        }
        self.wake_all();
    }

    /// Lower the signal.
    pub fn reset(&self) {
        self.permits.lock().signaled = false;
    }

    /// Fail every current and future wait with [`WaitError::Closed`].
    pub fn close(&self) {
        self.permits.lock().closed = true;
        self.wake_all();
    }

    /// Block until a permit is available or the timeout elapses.
    ///
    /// `None` waits without a time limit.
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitResult, WaitError> {
        self.wait_blocking(timeout, cancel, false)
    }

    /// Block until a permit is available, the signal is raised, or the
    /// timeout elapses.
    pub fn wait_signaled(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitResult, WaitError> {
        self.wait_blocking(timeout, cancel, true)
    }

    pub async fn wait_async(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitResult, WaitError> {
        self.wait_suspending(timeout, cancel, false).await
    }

    pub async fn wait_signaled_async(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitResult, WaitError> {
        self.wait_suspending(timeout, cancel, true).await
    }

    fn poll(permits: &mut Permits, signalable: bool) -> Option<Result<WaitResult, WaitError>> {
        if permits.closed {
            return Some(Err(WaitError::Closed));
        }
        if permits.available > 0 {
            permits.available -= 1;
            return Some(Ok(WaitResult::Entered));
        }
        if signalable && permits.signaled {
            return Some(Ok(WaitResult::Signaled));
        }
        None
    }

    fn wait_blocking(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        signalable: bool,
    ) -> Result<WaitResult, WaitError> {
        // A timeout too large to represent as an instant means no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut permits = self.permits.lock();
        loop {
            if let Some(result) = Self::poll(&mut permits, signalable) {
                return result;
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            let mut slice = CANCELLATION_POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(WaitResult::TimedOut);
                }
                slice = slice.min(deadline - now);
            }
            self.condvar.wait_for(&mut permits, slice);
        }
    }

    async fn wait_suspending(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        signalable: bool,
    ) -> Result<WaitResult, WaitError> {
        let deadline = timeout.and_then(|t| tokio::time::Instant::now().checked_add(t));
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not lost.
            notified.as_mut().enable();

            {
                let mut permits = self.permits.lock();
                if let Some(result) = Self::poll(&mut permits, signalable) {
                    return result;
                }
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(WaitResult::TimedOut);
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                    }
                }
            }
        }
    }

    fn wake_all(&self) {
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for SignalableSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let permits = self.permits.lock();
        f.debug_struct("SignalableSemaphore")
            .field("capacity", &self.capacity)
            .field("available", &permits.available)
            .field("signaled", &permits.signaled)
            .finish()
    }
}
