//! Seams to the transport layer.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{ConnectionDescription, ConnectionId, EndPoint, RequestMessage, ResponseMessage, ServerId};
use crate::error::DriverError;

/// A physical connection to one server.
///
/// Implementations use interior mutability: a connection is shared between
/// every handle forked from the same checkout.
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    fn endpoint(&self) -> &EndPoint;

    /// `None` until the handshake has completed.
    fn description(&self) -> Option<ConnectionDescription>;

    /// True when the transport considers itself stale (idle or too old).
    fn is_expired(&self) -> bool;

    fn open(&self, cancel: &CancellationToken) -> Result<(), DriverError>;

    async fn open_async(&self, cancel: &CancellationToken) -> Result<(), DriverError>;

    fn send_message(&self, message: &RequestMessage, cancel: &CancellationToken) -> Result<(), DriverError>;

    async fn send_message_async(
        &self,
        message: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError>;

    fn receive_message(&self, response_to: i32, cancel: &CancellationToken) -> Result<ResponseMessage, DriverError>;

    async fn receive_message_async(
        &self,
        response_to: i32,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError>;

    /// Close the socket. Must be idempotent.
    fn close(&self);
}

/// Produces unopened connections for a pool.
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(&self, server_id: &ServerId, endpoint: &EndPoint) -> Box<dyn Connection>;
}
