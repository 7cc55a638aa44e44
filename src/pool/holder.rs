//! Idle and in-use connection bookkeeping.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::events::{EventLogger, PoolEvent};
use super::pooled::PooledConnection;
use crate::error::DriverError;
use crate::sync::SignalableSemaphore;

/// Holds idle connections (LIFO) and tracks checked-out ones.
///
/// The connecting semaphore is signaled whenever idle connections exist so
/// that callers waiting to create a connection can reuse one instead.
pub(crate) struct ListConnectionHolder {
    idle: Mutex<Vec<Arc<PooledConnection>>>,
    in_use: Mutex<Vec<Arc<PooledConnection>>>,
    signal: Arc<SignalableSemaphore>,
    events: EventLogger,
}

impl ListConnectionHolder {
    pub(crate) fn new(signal: Arc<SignalableSemaphore>, events: EventLogger) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            in_use: Mutex::new(Vec::new()),
            signal,
            events,
        }
    }

    /// Idle connections.
    pub(crate) fn count(&self) -> usize {
        self.idle.lock().len()
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }

    /// Pop the most recently returned usable connection.
    ///
    /// Expired connections met on the way are removed.
    pub(crate) fn acquire(&self) -> Option<Arc<PooledConnection>> {
        let mut result = None;
        let mut expired = Vec::new();
        {
            let mut idle = self.idle.lock();
            while result.is_none() {
                let Some(connection) = idle.pop() else { break };
                if connection.is_expired() {
                    expired.push(connection);
                } else {
                    result = Some(connection);
                }
            }
            self.signal_or_reset(&idle);
        }
        // Closing talks to the transport, so it happens outside the lock.
        for connection in &expired {
            self.remove_connection(connection);
        }

        let connection = result?;
        self.track_in_use(&connection);
        // Could have expired after the check above.
        if connection.is_expired() {
            self.remove_connection(&connection);
            return None;
        }
        Some(connection)
    }

    pub(crate) fn return_connection(&self, connection: Arc<PooledConnection>) {
        self.untrack_in_use(&connection);
        let mut idle = self.idle.lock();
        idle.push(connection);
        self.signal_or_reset(&idle);
    }

    /// Remove every expired idle connection, and in-use connections that are
    /// expired with a generation at or below `max_expired_generation_in_use`.
    pub(crate) fn prune(
        &self,
        max_expired_generation_in_use: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.remove_expired(&self.idle, None, true, cancel)?;
        if let Some(generation) = max_expired_generation_in_use {
            self.remove_expired(&self.in_use, Some(generation), false, cancel)?;
        }
        Ok(())
    }

    /// Close every idle connection.
    pub(crate) fn clear(&self) {
        let drained: Vec<_> = {
            let mut idle = self.idle.lock();
            let drained = idle.drain(..).collect();
            self.signal_or_reset(&idle);
            drained
        };
        for connection in &drained {
            self.remove_connection(connection);
        }
    }

    /// Dispose a connection and forget it. Events fire only for the first
    /// removal of a given connection.
    pub(crate) fn remove_connection(&self, connection: &Arc<PooledConnection>) {
        self.untrack_in_use(connection);
        if connection.is_disposed() {
            return;
        }

        let connection_id = connection.connection_id().clone();
        self.events.publish(PoolEvent::Removing {
            connection_id: connection_id.clone(),
        });
        let started = Instant::now();
        if connection.dispose() {
            self.events.publish(PoolEvent::ConnectionClosed {
                connection_id: connection_id.clone(),
            });
        }
        self.events.publish(PoolEvent::Removed {
            connection_id,
            duration: started.elapsed(),
        });
    }

    pub(crate) fn track_in_use(&self, connection: &Arc<PooledConnection>) {
        self.in_use.lock().push(Arc::clone(connection));
    }

    pub(crate) fn untrack_in_use(&self, connection: &Arc<PooledConnection>) {
        let mut in_use = self.in_use.lock();
        if let Some(index) = in_use.iter().position(|c| Arc::ptr_eq(c, connection)) {
            in_use.swap_remove(index);
        }
    }

    fn remove_expired(
        &self,
        list: &Mutex<Vec<Arc<PooledConnection>>>,
        max_generation: Option<u64>,
        signal: bool,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let expired: Vec<Arc<PooledConnection>> = list
            .lock()
            .iter()
            .filter(|c| c.is_expired() && max_generation.map_or(true, |g| c.generation() <= g))
            .cloned()
            .collect();

        for connection in expired {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }

            let mut guard = list.lock();
            if connection.is_disposed() {
                continue;
            }
            // Someone else took it since the scan.
            let Some(index) = guard.iter().position(|c| Arc::ptr_eq(c, &connection)) else {
                continue;
            };
            guard.remove(index);
            if signal {
                self.signal_or_reset(&guard);
            }
            drop(guard);
            self.remove_connection(&connection);
        }
        Ok(())
    }

    // Called with the idle lock held.
    fn signal_or_reset(&self, idle: &[Arc<PooledConnection>]) {
        if idle.is_empty() {
            self.signal.reset();
        } else {
            self.signal.signal();
        }
    }
}
