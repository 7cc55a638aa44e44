//! Reuse-or-create under the connecting bound.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::events::PoolEvent;
use super::exclusive::PoolShared;
use super::pooled::PooledConnection;
use crate::error::DriverError;
use crate::sync::{OperationContext, WaitResult};

/// Obtains an open connection for a caller that already holds a pool slot.
///
/// Dropping the creator releases its connecting slot and disposes a
/// connection that never finished opening.
pub(crate) struct ConnectionCreator<'a> {
    pool: &'a PoolShared,
    connecting_entered: bool,
    connection: Option<Arc<PooledConnection>>,
    keep_connection: bool,
}

impl<'a> ConnectionCreator<'a> {
    pub(crate) fn new(pool: &'a PoolShared) -> Self {
        Self {
            pool,
            connecting_entered: false,
            connection: None,
            keep_connection: false,
        }
    }

    /// Reuse an idle connection, or open a new one once a connecting slot
    /// frees up. A connection returned to the pool while waiting is reused
    /// instead.
    pub(crate) fn create_opened_or_reuse(
        &mut self,
        ctx: &OperationContext,
        wait_queue_timeout: Option<Duration>,
    ) -> Result<Arc<PooledConnection>, DriverError> {
        if let Some(connection) = self.pool.holder.acquire() {
            return Ok(connection);
        }

        let started = Instant::now();
        loop {
            self.pool.throw_if_not_open()?;
            let wait_timeout = self.pool.remaining_timeout(wait_queue_timeout, started)?;

            match self
                .pool
                .max_connecting_queue
                .wait_signaled(wait_timeout, ctx.cancellation())?
            {
                WaitResult::Signaled => {
                    if let Some(connection) = self.pool.holder.acquire() {
                        return Ok(connection);
                    }
                }
                WaitResult::Entered => {
                    self.connecting_entered = true;
                    let connection = self.start_creating(ctx)?;
                    let opening = Instant::now();
                    connection.open(ctx.cancellation())?;
                    if connection.is_expired() {
                        self.discard_stale(&connection);
                        continue;
                    }
                    return Ok(self.finish_creating(connection, opening));
                }
                WaitResult::TimedOut => return Err(self.connecting_timeout(started.elapsed())),
            }
        }
    }

    pub(crate) async fn create_opened_or_reuse_async(
        &mut self,
        ctx: &OperationContext,
        wait_queue_timeout: Option<Duration>,
    ) -> Result<Arc<PooledConnection>, DriverError> {
        if let Some(connection) = self.pool.holder.acquire() {
            return Ok(connection);
        }

        let started = Instant::now();
        loop {
            self.pool.throw_if_not_open()?;
            let wait_timeout = self.pool.remaining_timeout(wait_queue_timeout, started)?;

            match self
                .pool
                .max_connecting_queue
                .wait_signaled_async(wait_timeout, ctx.cancellation())
                .await?
            {
                WaitResult::Signaled => {
                    if let Some(connection) = self.pool.holder.acquire() {
                        return Ok(connection);
                    }
                }
                WaitResult::Entered => {
                    self.connecting_entered = true;
                    let connection = self.start_creating(ctx)?;
                    let opening = Instant::now();
                    connection.open_async(ctx.cancellation()).await?;
                    if connection.is_expired() {
                        self.discard_stale(&connection);
                        continue;
                    }
                    return Ok(self.finish_creating(connection, opening));
                }
                WaitResult::TimedOut => return Err(self.connecting_timeout(started.elapsed())),
            }
        }
    }

    /// Open a fresh connection for the maintenance thread.
    ///
    /// Returns `None` if no connecting slot frees up within the budget.
    pub(crate) fn create_opened(
        &mut self,
        connecting_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<PooledConnection>>, DriverError> {
        match self.pool.max_connecting_queue.wait(connecting_timeout, cancel)? {
            WaitResult::Entered => self.connecting_entered = true,
            _ => return Ok(None),
        }
        self.pool.throw_if_not_open()?;

        let ctx = OperationContext::new(None, cancel.clone());
        let connection = self.start_creating(&ctx)?;
        let opening = Instant::now();
        connection.open(cancel)?;
        if connection.is_expired() {
            self.discard_stale(&connection);
            return Ok(None);
        }
        Ok(Some(self.finish_creating(connection, opening)))
    }

    fn start_creating(&mut self, ctx: &OperationContext) -> Result<Arc<PooledConnection>, DriverError> {
        self.pool.events.publish(PoolEvent::Adding {
            server_id: self.pool.server_id.clone(),
        });
        ctx.throw_if_timed_out_or_cancelled()?;

        let connection = self.pool.create_pooled_connection();
        self.pool.holder.track_in_use(&connection);
        self.pool.events.publish(PoolEvent::ConnectionOpening {
            connection_id: connection.connection_id().clone(),
        });
        self.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn finish_creating(&mut self, connection: Arc<PooledConnection>, opening: Instant) -> Arc<PooledConnection> {
        let duration = opening.elapsed();
        let connection_id = connection.connection_id().clone();
        self.pool.events.publish(PoolEvent::ConnectionOpened {
            connection_id: connection_id.clone(),
            duration,
        });
        self.pool.events.publish(PoolEvent::Added {
            connection_id,
            duration,
        });

        self.keep_connection = true;
        connection.register_with_service();
        connection
    }

    /// Close a connection the pool was cleared under while it was opening,
    /// and give back the connecting slot.
    fn discard_stale(&mut self, connection: &Arc<PooledConnection>) {
        debug!(
            connection_id = %connection.connection_id(),
            generation = connection.generation(),
            "Discarding connection cleared while opening"
        );
        self.connection = None;
        self.pool.holder.remove_connection(connection);
        if self.connecting_entered {
            self.connecting_entered = false;
            self.pool.max_connecting_queue.release();
        }
    }

    fn connecting_timeout(&self, elapsed: Duration) -> DriverError {
        self.pool.timeout_error(
            elapsed,
            format!("Timed out waiting in connecting queue after {}ms.", elapsed.as_millis()),
        )
    }
}

impl Drop for ConnectionCreator<'_> {
    fn drop(&mut self) {
        if self.connecting_entered {
            self.pool.max_connecting_queue.release();
        }
        if !self.keep_connection {
            if let Some(connection) = self.connection.take() {
                self.pool.holder.untrack_in_use(&connection);
                connection.dispose();
            }
        }
    }
}
