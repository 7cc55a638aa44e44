//! Per-operation deadline and cancellation.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::DriverError;

/// Deadline plus cancellation carried through every blocking call.
///
/// A context without a deadline never times out on its own; callers then fall
/// back to their configured timeouts via [`OperationContext::remaining_timeout_or`].
#[derive(Debug, Clone)]
pub struct OperationContext {
    started_at: Instant,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl OperationContext {
    pub fn new(timeout: Option<Duration>, cancellation: CancellationToken) -> Self {
        let started_at = Instant::now();
        Self {
            started_at,
            deadline: timeout.and_then(|t| started_at.checked_add(t)),
            cancellation,
        }
    }

    /// No deadline and a token nobody else holds.
    pub fn infinite() -> Self {
        Self::new(None, CancellationToken::new())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Some(timeout), CancellationToken::new())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Time left before the deadline, or `default` when there is none.
    pub fn remaining_timeout_or(&self, default: Option<Duration>) -> Option<Duration> {
        match self.deadline {
            Some(_) => self.remaining_timeout(),
            None => default,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn throw_if_timed_out_or_cancelled(&self) -> Result<(), DriverError> {
        if self.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        if self.is_timed_out() {
            return Err(DriverError::timeout(
                self.elapsed(),
                "The operation exceeded its deadline.",
            ));
        }
        Ok(())
    }

    /// Child context sharing the deadline with its own linked token.
    pub fn fork(&self) -> Self {
        Self {
            started_at: self.started_at,
            deadline: self.deadline,
            cancellation: self.cancellation.child_token(),
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::infinite()
    }
}

/// Budget left of `timeout` after the time spent since `started_at`.
///
/// `None` is an unlimited budget and stays unlimited.
pub fn calculate_remaining_timeout(
    timeout: Option<Duration>,
    started_at: Instant,
) -> Result<Option<Duration>, DriverError> {
    let Some(timeout) = timeout else {
        return Ok(None);
    };

    let elapsed = started_at.elapsed();
    match timeout.checked_sub(elapsed) {
        Some(remaining) => Ok(Some(remaining)),
        None => Err(DriverError::timeout(
            elapsed,
            format!("Timed out after {} ms.", elapsed.as_millis()),
        )),
    }
}
