//! Per-server connection pool handing out exclusive connections.
//!
//! Checkout passes three gates, each with its own bound:
//!
//! 1. the wait queue, a fail-fast counter of callers currently checking out;
//! 2. a pool slot, one of `max_connections`;
//! 3. either an idle connection or a connecting slot, one of `max_connecting`.
//!
//! All three share the caller's timeout budget. Every gate is released on
//! every exit path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::acquire::AcquireConnectionHelper;
use super::checkout::{timeout_message, CheckOutReasonCounter};
use super::creator::ConnectionCreator;
use super::events::{EventLogger, PoolEvent, PoolEventListener};
use super::handle::ConnectionHandle;
use super::holder::ListConnectionHolder;
use super::maintenance::MaintenanceHelper;
use super::pooled::PooledConnection;
use super::service_states::PoolGenerations;
use super::settings::ConnectionPoolSettings;
use crate::connection::{ConnectionFactory, EndPoint, ServerId, ServiceId};
use crate::error::DriverError;
use crate::sync::{
    calculate_remaining_timeout, AtomicState, OperationContext, SignalableSemaphore, StateValue,
    WaitResult,
};
use crate::telemetry::{CheckoutSpan, SpanExt};

/// Pool slot budget for one maintenance step.
pub(crate) const MAINTENANCE_SLOT_TIMEOUT: Duration = Duration::from_millis(20);

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Initial,
    Open,
    Disposed,
}

impl StateValue for PoolState {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PoolState::Initial,
            1 => PoolState::Open,
            _ => PoolState::Disposed,
        }
    }
}

/// Releases one pool slot on drop.
pub(crate) struct PoolSlot<'a> {
    queue: &'a SignalableSemaphore,
}

impl<'a> PoolSlot<'a> {
    pub(crate) fn entered(queue: &'a SignalableSemaphore) -> Self {
        Self { queue }
    }
}

impl Drop for PoolSlot<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// State shared by the pool, its handles and its maintenance thread.
pub(crate) struct PoolShared {
    pub(crate) server_id: ServerId,
    pub(crate) endpoint: EndPoint,
    pub(crate) settings: ConnectionPoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    pub(crate) state: AtomicState<PoolState>,
    pub(crate) generations: Arc<PoolGenerations>,
    pub(crate) reasons: Arc<CheckOutReasonCounter>,
    pub(crate) holder: ListConnectionHolder,
    pub(crate) max_connections_queue: SignalableSemaphore,
    pub(crate) max_connecting_queue: Arc<SignalableSemaphore>,
    wait_queue_free_slots: AtomicUsize,
    pub(crate) events: EventLogger,
}

impl PoolShared {
    pub(crate) fn throw_if_disposed(&self) -> Result<(), DriverError> {
        if self.state.is(PoolState::Disposed) {
            Err(DriverError::ObjectDisposed("ExclusiveConnectionPool"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn throw_if_not_open(&self) -> Result<(), DriverError> {
        match self.state.get() {
            PoolState::Open => Ok(()),
            PoolState::Initial => Err(DriverError::NotInitialized),
            PoolState::Disposed => Err(DriverError::ObjectDisposed("ExclusiveConnectionPool")),
        }
    }

    /// Take a wait-queue slot without waiting.
    pub(crate) fn enter_wait_queue(&self) -> Result<(), DriverError> {
        self.wait_queue_free_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| free.checked_sub(1))
            .map(|_| ())
            .map_err(|_| DriverError::WaitQueueFull {
                endpoint: self.endpoint.to_string(),
            })
    }

    pub(crate) fn leave_wait_queue(&self) {
        self.wait_queue_free_slots.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.settings
            .wait_queue_size
            .saturating_sub(self.wait_queue_free_slots.load(Ordering::Acquire))
    }

    pub(crate) fn available_count(&self) -> usize {
        self.max_connections_queue.available()
    }

    pub(crate) fn used_count(&self) -> usize {
        self.settings.max_connections - self.available_count()
    }

    pub(crate) fn created_count(&self) -> usize {
        self.used_count() + self.holder.count()
    }

    pub(crate) fn create_pooled_connection(&self) -> Arc<PooledConnection> {
        let connection = self.factory.create_connection(&self.server_id, &self.endpoint);
        Arc::new(PooledConnection::new(
            connection,
            Arc::clone(&self.generations),
            Arc::clone(&self.reasons),
        ))
    }

    /// Timeout error, expanded with checkout reasons when any are tagged.
    pub(crate) fn timeout_error(&self, elapsed: Duration, message: String) -> DriverError {
        let message = timeout_message(
            message,
            elapsed.as_millis(),
            &self.reasons,
            self.settings.max_connections,
            self.available_count(),
        );
        DriverError::timeout(elapsed, message)
    }

    pub(crate) fn remaining_timeout(
        &self,
        timeout: Option<Duration>,
        started_at: Instant,
    ) -> Result<Option<Duration>, DriverError> {
        calculate_remaining_timeout(timeout, started_at).map_err(|err| match err {
            DriverError::Timeout { elapsed, .. } => self.timeout_error(
                elapsed,
                format!("Timed out waiting for a connection after {}ms.", elapsed.as_millis()),
            ),
            other => other,
        })
    }

    /// Check a connection back in. Runs when the last handle goes away.
    pub(crate) fn release_connection(&self, connection: &Arc<PooledConnection>) {
        connection.clear_checkout_reason();

        if self.state.is(PoolState::Disposed) {
            self.holder.remove_connection(connection);
            self.max_connections_queue.release();
            return;
        }

        let connection_id = connection.connection_id().clone();
        self.events.publish(PoolEvent::CheckingIn {
            connection_id: connection_id.clone(),
        });
        let started = Instant::now();

        if !connection.is_expired() && !self.state.is(PoolState::Disposed) {
            self.holder.return_connection(Arc::clone(connection));
        } else {
            self.holder.remove_connection(connection);
        }
        self.max_connections_queue.release();

        self.events.publish(PoolEvent::CheckedIn {
            connection_id,
            duration: started.elapsed(),
        });
    }

    /// Drop expired idle connections. Skipped when no slot frees up quickly.
    pub(crate) fn prune(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        match self
            .max_connections_queue
            .wait(Some(MAINTENANCE_SLOT_TIMEOUT), cancel)?
        {
            WaitResult::Entered => {}
            _ => return Ok(()),
        }
        let _slot = PoolSlot::entered(&self.max_connections_queue);
        self.holder.prune(None, cancel)
    }

    /// Open connections until `min_connections` exist.
    pub(crate) fn ensure_min_size(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        while self.created_count() < self.settings.min_connections {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            match self
                .max_connections_queue
                .wait(Some(MAINTENANCE_SLOT_TIMEOUT), cancel)?
            {
                WaitResult::Entered => {}
                _ => return Ok(()),
            }
            let _slot = PoolSlot::entered(&self.max_connections_queue);

            let mut creator = ConnectionCreator::new(self);
            match creator.create_opened(Some(MAINTENANCE_SLOT_TIMEOUT), cancel)? {
                Some(connection) => self.holder.return_connection(connection),
                None => return Ok(()),
            }
        }
        Ok(())
    }
}

/// Connection pool for a single server.
pub struct ExclusiveConnectionPool {
    shared: Arc<PoolShared>,
    maintenance: Mutex<Option<MaintenanceHelper>>,
}

impl ExclusiveConnectionPool {
    pub fn new(
        server_id: ServerId,
        endpoint: EndPoint,
        settings: ConnectionPoolSettings,
        factory: Arc<dyn ConnectionFactory>,
        listener: Option<Arc<dyn PoolEventListener>>,
    ) -> Result<Self, DriverError> {
        settings.validate()?;

        let events = EventLogger::new(listener);
        let max_connecting_queue = Arc::new(SignalableSemaphore::new(settings.max_connecting));
        let holder = ListConnectionHolder::new(Arc::clone(&max_connecting_queue), events.clone());

        let shared = PoolShared {
            server_id,
            endpoint,
            factory,
            state: AtomicState::new(PoolState::Initial),
            generations: Arc::new(PoolGenerations::new()),
            reasons: Arc::new(CheckOutReasonCounter::new()),
            holder,
            max_connections_queue: SignalableSemaphore::new(settings.max_connections),
            max_connecting_queue,
            wait_queue_free_slots: AtomicUsize::new(settings.wait_queue_size),
            events,
            settings,
        };

        Ok(Self {
            shared: Arc::new(shared),
            maintenance: Mutex::new(None),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.shared.server_id
    }

    pub fn endpoint(&self) -> &EndPoint {
        &self.shared.endpoint
    }

    pub fn settings(&self) -> &ConnectionPoolSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> PoolState {
        self.shared.state.get()
    }

    /// Open the pool and start maintenance. No-op unless the pool is new.
    pub fn initialize(&self) -> Result<(), DriverError> {
        self.shared.throw_if_disposed()?;
        if !self.shared.state.try_change(PoolState::Initial, PoolState::Open) {
            return Ok(());
        }

        let server_id = self.shared.server_id.clone();
        self.shared.events.publish(PoolEvent::Opening {
            server_id: server_id.clone(),
        });

        if let Some(interval) = self.shared.settings.maintenance_interval {
            let helper = MaintenanceHelper::start(Arc::clone(&self.shared), interval).map_err(|e| {
                DriverError::InvalidOperation(format!("failed to start pool maintenance: {e}"))
            })?;
            *self.maintenance.lock() = Some(helper);
        }

        self.shared.events.publish(PoolEvent::Opened { server_id });
        Ok(())
    }

    /// Check out a connection, blocking the current thread.
    pub fn acquire_connection(&self, ctx: &OperationContext) -> Result<ConnectionHandle, DriverError> {
        let span = CheckoutSpan::new(&self.shared.server_id);
        let result = span.in_scope(|| AcquireConnectionHelper::new(&self.shared).acquire_connection(ctx));
        span.record_result(&result);
        result
    }

    /// Check out a connection without blocking the runtime.
    pub async fn acquire_connection_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ConnectionHandle, DriverError> {
        let span = CheckoutSpan::new(&self.shared.server_id);
        let result = AcquireConnectionHelper::new(&self.shared)
            .acquire_connection_async(ctx)
            .instrument(span.clone())
            .await;
        span.record_result(&result);
        result
    }

    /// Invalidate every existing connection.
    ///
    /// Checked-out connections keep working and are closed on check-in.
    pub fn clear(&self) -> Result<(), DriverError> {
        self.shared.throw_if_not_open()?;
        let server_id = self.shared.server_id.clone();
        self.shared.events.publish(PoolEvent::Clearing {
            server_id: server_id.clone(),
            service_id: None,
        });

        let generation = self.shared.generations.increment_all();
        debug!(server = %server_id, generation, "Pool generation incremented");
        self.request_maintenance();

        self.shared.events.publish(PoolEvent::Cleared {
            server_id,
            service_id: None,
        });
        Ok(())
    }

    /// Invalidate the connections of one load-balanced service.
    ///
    /// With `close_in_use`, checked-out connections of that service are
    /// closed immediately instead of on check-in.
    pub fn clear_service(&self, service_id: &ServiceId, close_in_use: bool) -> Result<(), DriverError> {
        self.shared.throw_if_not_open()?;
        let server_id = self.shared.server_id.clone();
        self.shared.events.publish(PoolEvent::Clearing {
            server_id: server_id.clone(),
            service_id: Some(service_id.clone()),
        });

        let services = self.shared.generations.services();
        if let Some(generation) = services.increment_generation(service_id) {
            debug!(server = %server_id, service = %service_id, generation, "Service generation incremented");
            let max_expired_in_use = close_in_use.then(|| generation - 1);
            self.shared
                .holder
                .prune(max_expired_in_use, &CancellationToken::new())?;
        }
        services.remove_if_unused(service_id);

        self.shared.events.publish(PoolEvent::Cleared {
            server_id,
            service_id: Some(service_id.clone()),
        });
        Ok(())
    }

    /// Close the pool. Idempotent.
    pub fn dispose(&self) {
        if !self.shared.state.try_change_to(PoolState::Disposed) {
            return;
        }
        let server_id = self.shared.server_id.clone();
        self.shared.events.publish(PoolEvent::Closing {
            server_id: server_id.clone(),
        });

        if let Some(mut maintenance) = self.maintenance.lock().take() {
            maintenance.stop();
        }
        self.shared.holder.clear();
        self.shared.max_connecting_queue.close();
        self.shared.max_connections_queue.close();

        self.shared.events.publish(PoolEvent::Closed { server_id });
    }

    /// Wake the maintenance thread early.
    pub fn request_maintenance(&self) {
        if let Some(maintenance) = self.maintenance.lock().as_ref() {
            maintenance.request_maintenance();
        }
    }

    /// Free pool slots.
    pub fn available_count(&self) -> Result<usize, DriverError> {
        self.shared.throw_if_disposed()?;
        Ok(self.shared.available_count())
    }

    /// Connections checked out plus idle.
    pub fn created_count(&self) -> Result<usize, DriverError> {
        self.shared.throw_if_disposed()?;
        Ok(self.shared.created_count())
    }

    /// Idle connections.
    pub fn dormant_count(&self) -> Result<usize, DriverError> {
        self.shared.throw_if_disposed()?;
        Ok(self.shared.holder.count())
    }

    /// Pool slots in use.
    pub fn used_count(&self) -> Result<usize, DriverError> {
        self.shared.throw_if_disposed()?;
        Ok(self.shared.used_count())
    }

    /// Callers currently in the wait queue.
    pub fn pending_count(&self) -> Result<usize, DriverError> {
        self.shared.throw_if_disposed()?;
        Ok(self.shared.pending_count())
    }

    /// Connections currently being established.
    pub fn connecting_count(&self) -> Result<usize, DriverError> {
        self.shared.throw_if_disposed()?;
        Ok(self.shared.max_connecting_queue.entered())
    }

    /// Checked-out connections tracked by the pool.
    pub fn in_use_count(&self) -> Result<usize, DriverError> {
        self.shared.throw_if_disposed()?;
        Ok(self.shared.holder.in_use_count())
    }

    pub fn generation(&self) -> u64 {
        self.shared.generations.pool_generation()
    }

    /// Current generation of a service, if it has connections.
    pub fn service_generation(&self, service_id: &ServiceId) -> Option<u64> {
        self.shared.generations.services().try_get_generation(service_id)
    }

    /// Open connections counted against a service.
    pub fn service_connection_count(&self, service_id: &ServiceId) -> usize {
        self.shared.generations.services().connection_count(service_id)
    }
}

impl Drop for ExclusiveConnectionPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ExclusiveConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveConnectionPool")
            .field("server_id", &self.shared.server_id)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
