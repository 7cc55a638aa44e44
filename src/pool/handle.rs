//! Reference-counted handle to a checked-out connection.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::checkout::CheckOutReason;
use super::exclusive::{PoolShared, PoolState};
use super::pooled::PooledConnection;
use crate::connection::{ConnectionDescription, ConnectionId, EndPoint, RequestMessage, ResponseMessage};
use crate::error::DriverError;
use crate::sync::SharedHandle;

/// A checked-out connection.
///
/// Forks share the connection; it goes back to the pool once every fork is
/// disposed or dropped.
pub struct ConnectionHandle {
    inner: SharedHandle<PooledConnection>,
    pool: Arc<PoolShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(pool: Arc<PoolShared>, connection: Arc<PooledConnection>) -> Self {
        let release_pool = Arc::clone(&pool);
        let inner = SharedHandle::new(connection, move |connection| {
            release_pool.release_connection(connection)
        });
        Self { inner, pool }
    }

    pub fn fork(&self) -> Result<Self, DriverError> {
        Ok(Self {
            inner: self.inner.fork().map_err(|_| DriverError::ObjectDisposed("ConnectionHandle"))?,
            pool: Arc::clone(&self.pool),
        })
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.inner.peek().connection_id()
    }

    pub fn endpoint(&self) -> &EndPoint {
        self.inner.peek().endpoint()
    }

    pub fn description(&self) -> Option<ConnectionDescription> {
        self.inner.peek().description()
    }

    pub fn generation(&self) -> u64 {
        self.inner.peek().generation()
    }

    /// True once the pool is disposed or the connection was invalidated.
    pub fn is_expired(&self) -> bool {
        self.pool.state.is(PoolState::Disposed) || self.inner.peek().is_expired()
    }

    pub fn checkout_reason(&self) -> Option<CheckOutReason> {
        self.inner.peek().checkout_reason()
    }

    pub fn set_checkout_reason_if_not_set(&self, reason: CheckOutReason) -> Result<(), DriverError> {
        self.connection()?.set_checkout_reason_if_not_set(reason);
        Ok(())
    }

    pub fn send_message(&self, message: &RequestMessage, cancel: &CancellationToken) -> Result<(), DriverError> {
        self.connection()?.send_message(message, cancel)
    }

    pub async fn send_message_async(
        &self,
        message: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.connection()?.send_message_async(message, cancel).await
    }

    pub fn receive_message(
        &self,
        response_to: i32,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.connection()?.receive_message(response_to, cancel)
    }

    pub async fn receive_message_async(
        &self,
        response_to: i32,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.connection()?.receive_message_async(response_to, cancel).await
    }

    /// Give up this handle's share. The connection is checked in when the
    /// last share goes.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn reference_count(&self) -> usize {
        self.inner.reference_count()
    }

    fn connection(&self) -> Result<&Arc<PooledConnection>, DriverError> {
        self.inner
            .get()
            .map_err(|_| DriverError::ObjectDisposed("ConnectionHandle"))
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", self.connection_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
