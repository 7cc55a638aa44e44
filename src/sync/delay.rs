//! Sleep that can be cut short.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why [`InterruptibleDelay::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    Elapsed,
    Woken,
    Stopped,
}

#[derive(Debug, Default)]
struct DelayState {
    woken: bool,
    stopped: bool,
}

/// A periodic sleep for background loops.
///
/// `wake` ends the current (or next) wait early once. `stop` ends every
/// wait from now on.
#[derive(Debug, Default)]
pub struct InterruptibleDelay {
    state: Mutex<DelayState>,
    condvar: Condvar,
}

impl InterruptibleDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self, period: Duration) -> DelayOutcome {
        let deadline = Instant::now().checked_add(period);
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return DelayOutcome::Stopped;
            }
            if state.woken {
                state.woken = false;
                return DelayOutcome::Woken;
            }
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut state, deadline).timed_out() {
                        return if state.stopped {
                            DelayOutcome::Stopped
                        } else {
                            DelayOutcome::Elapsed
                        };
                    }
                }
                // Past the end of the clock: only wake or stop end the wait.
                None => self.condvar.wait(&mut state),
            }
        }
    }

    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.condvar.notify_all();
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}
