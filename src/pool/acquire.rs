//! Checkout path of the pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::creator::ConnectionCreator;
use super::events::{CheckOutFailedReason, PoolEvent};
use super::exclusive::PoolShared;
use super::handle::ConnectionHandle;
use super::pooled::PooledConnection;
use crate::error::DriverError;
use crate::sync::{OperationContext, WaitResult};

/// One checkout attempt.
///
/// Holds the wait-queue slot for the duration of the attempt and the pool
/// slot until it is handed to the connection handle. Dropping the helper
/// gives back whatever it still holds.
pub(crate) struct AcquireConnectionHelper<'a> {
    pool: &'a Arc<PoolShared>,
    entered_wait_queue: bool,
    entered_pool: bool,
}

impl<'a> AcquireConnectionHelper<'a> {
    pub(crate) fn new(pool: &'a Arc<PoolShared>) -> Self {
        Self {
            pool,
            entered_wait_queue: false,
            entered_pool: false,
        }
    }

    pub(crate) fn acquire_connection(mut self, ctx: &OperationContext) -> Result<ConnectionHandle, DriverError> {
        let started = Instant::now();
        let result = self.try_acquire(ctx, started);
        self.finish(result, started)
    }

    pub(crate) async fn acquire_connection_async(
        mut self,
        ctx: &OperationContext,
    ) -> Result<ConnectionHandle, DriverError> {
        let started = Instant::now();
        let result = self.try_acquire_async(ctx, started).await;
        self.finish(result, started)
    }

    fn try_acquire(&mut self, ctx: &OperationContext, started: Instant) -> Result<Arc<PooledConnection>, DriverError> {
        self.start_checking_out()?;
        let wait_queue_timeout = self.wait_queue_timeout(ctx);

        let wait = self
            .pool
            .max_connections_queue
            .wait(wait_queue_timeout, ctx.cancellation())?;
        self.enter_pool(wait, started)?;
        self.throw_if_timed_out(ctx, started)?;

        let mut creator = ConnectionCreator::new(self.pool);
        let remaining = self.pool.remaining_timeout(wait_queue_timeout, started)?;
        creator.create_opened_or_reuse(ctx, remaining)
    }

    async fn try_acquire_async(
        &mut self,
        ctx: &OperationContext,
        started: Instant,
    ) -> Result<Arc<PooledConnection>, DriverError> {
        self.start_checking_out()?;
        let wait_queue_timeout = self.wait_queue_timeout(ctx);

        let wait = self
            .pool
            .max_connections_queue
            .wait_async(wait_queue_timeout, ctx.cancellation())
            .await?;
        self.enter_pool(wait, started)?;
        self.throw_if_timed_out(ctx, started)?;

        let mut creator = ConnectionCreator::new(self.pool);
        let remaining = self.pool.remaining_timeout(wait_queue_timeout, started)?;
        creator.create_opened_or_reuse_async(ctx, remaining).await
    }

    fn start_checking_out(&mut self) -> Result<(), DriverError> {
        self.pool.events.publish(PoolEvent::CheckingOut {
            server_id: self.pool.server_id.clone(),
        });
        self.pool.throw_if_not_open()?;
        self.pool.enter_wait_queue()?;
        self.entered_wait_queue = true;
        Ok(())
    }

    fn wait_queue_timeout(&self, ctx: &OperationContext) -> Option<Duration> {
        ctx.remaining_timeout_or(Some(self.pool.settings.wait_queue_timeout))
    }

    fn enter_pool(&mut self, wait: WaitResult, started: Instant) -> Result<(), DriverError> {
        match wait {
            WaitResult::Entered => {
                self.entered_pool = true;
                Ok(())
            }
            _ => {
                let elapsed = started.elapsed();
                Err(self.pool.timeout_error(
                    elapsed,
                    format!("Timed out waiting for a connection after {}ms.", elapsed.as_millis()),
                ))
            }
        }
    }

    fn throw_if_timed_out(&self, ctx: &OperationContext, started: Instant) -> Result<(), DriverError> {
        if ctx.is_timed_out() {
            let elapsed = started.elapsed();
            return Err(self.pool.timeout_error(
                elapsed,
                format!("Timed out waiting for a connection after {}ms.", elapsed.as_millis()),
            ));
        }
        Ok(())
    }

    fn finish(
        &mut self,
        result: Result<Arc<PooledConnection>, DriverError>,
        started: Instant,
    ) -> Result<ConnectionHandle, DriverError> {
        match result {
            Ok(connection) => {
                let connection_id = connection.connection_id().clone();
                let handle = ConnectionHandle::new(Arc::clone(self.pool), connection);
                // The handle now owns the pool slot.
                self.entered_pool = false;
                self.pool.events.publish(PoolEvent::CheckedOut {
                    connection_id,
                    duration: started.elapsed(),
                });
                Ok(handle)
            }
            Err(err) => {
                self.pool.events.publish(PoolEvent::CheckOutFailed {
                    server_id: self.pool.server_id.clone(),
                    reason: failure_reason(&err),
                    duration: started.elapsed(),
                });
                Err(err)
            }
        }
    }
}

impl Drop for AcquireConnectionHelper<'_> {
    fn drop(&mut self) {
        if self.entered_wait_queue {
            self.pool.leave_wait_queue();
        }
        if self.entered_pool {
            self.pool.max_connections_queue.release();
        }
    }
}

fn failure_reason(err: &DriverError) -> CheckOutFailedReason {
    match err {
        DriverError::ObjectDisposed(_) | DriverError::NotInitialized => CheckOutFailedReason::PoolClosed,
        DriverError::Timeout { .. } => CheckOutFailedReason::Timeout,
        DriverError::WaitQueueFull { .. } => CheckOutFailedReason::WaitQueueFull,
        DriverError::Cancelled => CheckOutFailedReason::Cancelled,
        _ => CheckOutFailedReason::ConnectionError,
    }
}
