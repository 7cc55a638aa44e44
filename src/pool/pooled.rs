//! A physical connection owned by a pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::checkout::{CheckOutReason, CheckOutReasonCounter};
use super::service_states::PoolGenerations;
use crate::connection::{
    Connection, ConnectionDescription, ConnectionId, EndPoint, RequestMessage, ResponseMessage,
    ServiceId,
};
use crate::error::DriverError;

/// Wraps a raw connection with the pool generation it belongs to.
pub struct PooledConnection {
    connection: Box<dyn Connection>,
    connection_id: ConnectionId,
    generation: AtomicU64,
    generations: Arc<PoolGenerations>,
    reasons: Arc<CheckOutReasonCounter>,
    checkout_reason: Mutex<Option<CheckOutReason>>,
    counted_service: Mutex<Option<ServiceId>>,
    disposed: AtomicBool,
}

impl PooledConnection {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        generations: Arc<PoolGenerations>,
        reasons: Arc<CheckOutReasonCounter>,
    ) -> Self {
        let connection_id = connection.connection_id();
        let generation = generations.pool_generation();
        Self {
            connection,
            connection_id,
            generation: AtomicU64::new(generation),
            generations,
            reasons,
            checkout_reason: Mutex::new(None),
            counted_service: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn endpoint(&self) -> &EndPoint {
        self.connection.endpoint()
    }

    pub fn description(&self) -> Option<ConnectionDescription> {
        self.connection.description()
    }

    pub fn service_id(&self) -> Option<ServiceId> {
        self.connection.description().and_then(|d| d.service_id)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Disposed, older than the pool (or service) generation, or stale.
    pub fn is_expired(&self) -> bool {
        self.is_disposed()
            || self.generation() < self.generations.generation_for(self.service_id().as_ref())
            || self.connection.is_expired()
    }

    pub fn checkout_reason(&self) -> Option<CheckOutReason> {
        *self.checkout_reason.lock()
    }

    /// Tag the checkout. Only the first reason sticks.
    pub fn set_checkout_reason_if_not_set(&self, reason: CheckOutReason) {
        let mut current = self.checkout_reason.lock();
        if current.is_none() {
            *current = Some(reason);
            self.reasons.increment(reason);
        }
    }

    pub fn open(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        let result = self.connection.open(cancel);
        self.set_effective_generation();
        result.map_err(|e| self.enrich(e))
    }

    pub async fn open_async(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        let result = self.connection.open_async(cancel).await;
        self.set_effective_generation();
        result.map_err(|e| self.enrich(e))
    }

    pub fn send_message(&self, message: &RequestMessage, cancel: &CancellationToken) -> Result<(), DriverError> {
        self.connection
            .send_message(message, cancel)
            .map_err(|e| self.enrich(e))
    }

    pub async fn send_message_async(
        &self,
        message: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.connection
            .send_message_async(message, cancel)
            .await
            .map_err(|e| self.enrich(e))
    }

    pub fn receive_message(
        &self,
        response_to: i32,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.connection
            .receive_message(response_to, cancel)
            .map_err(|e| self.enrich(e))
    }

    pub async fn receive_message_async(
        &self,
        response_to: i32,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.connection
            .receive_message_async(response_to, cancel)
            .await
            .map_err(|e| self.enrich(e))
    }

    /// Count this connection against its service once it is fully open.
    pub(crate) fn register_with_service(&self) {
        if let Some(service_id) = self.service_id() {
            self.generations.services().increment_connection_count(&service_id);
            *self.counted_service.lock() = Some(service_id);
        }
    }

    /// Close the transport. Returns false if already disposed.
    pub(crate) fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.connection.close();
        if let Some(service_id) = self.counted_service.lock().take() {
            self.generations.services().decrement_connection_count(&service_id);
        }
        true
    }

    /// Release the checkout tag when the connection returns to the pool.
    pub(crate) fn clear_checkout_reason(&self) {
        if let Some(reason) = self.checkout_reason.lock().take() {
            self.reasons.decrement(reason);
        }
    }

    fn set_effective_generation(&self) {
        if let Some(service_id) = self.service_id() {
            let generation = self
                .generations
                .services()
                .get_or_register(&service_id, self.generation());
            self.generation.store(generation, Ordering::Release);
        }
    }

    fn enrich(&self, error: DriverError) -> DriverError {
        error.with_connection_details(self.generation(), self.service_id())
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_id", &self.connection_id)
            .field("generation", &self.generation())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
