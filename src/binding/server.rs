//! Servers hand out channels from their connection pool.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::channel::{Channel, ChannelHandle};
use super::cluster::ServerDescription;
use crate::connection::{ServerId, ServiceId};
use crate::error::DriverError;
use crate::pool::ExclusiveConnectionPool;
use crate::sync::OperationContext;

#[async_trait]
pub trait Server: Send + Sync {
    fn server_id(&self) -> &ServerId;

    fn description(&self) -> ServerDescription;

    fn get_channel(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError>;

    async fn get_channel_async(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError>;
}

/// A server backed by an [`ExclusiveConnectionPool`].
pub struct PooledServer {
    description: RwLock<ServerDescription>,
    pool: ExclusiveConnectionPool,
}

impl PooledServer {
    pub fn new(description: ServerDescription, pool: ExclusiveConnectionPool) -> Self {
        Self {
            description: RwLock::new(description),
            pool,
        }
    }

    pub fn pool(&self) -> &ExclusiveConnectionPool {
        &self.pool
    }

    pub fn update_description(&self, description: ServerDescription) {
        *self.description.write() = description;
    }

    /// Invalidate pooled connections after a state change on the server.
    ///
    /// With a service id only that backend is cleared, and connections
    /// pinned to it are closed as well.
    pub fn invalidate(&self, service_id: Option<&ServiceId>) -> Result<(), DriverError> {
        info!(server = %self.pool.server_id(), service = ?service_id, "Invalidating server");
        match service_id {
            Some(service_id) => self.pool.clear_service(service_id, true),
            None => self.pool.clear(),
        }
    }

    /// Clear the pool when a channel fails at the network level.
    fn handle_channel_error(&self, err: &DriverError) {
        if err.is_network_error() {
            if let Err(clear_err) = self.pool.clear() {
                debug!(server = %self.pool.server_id(), error = %clear_err, "Pool clear after network error failed");
            }
        }
    }
}

#[async_trait]
impl Server for PooledServer {
    fn server_id(&self) -> &ServerId {
        self.pool.server_id()
    }

    fn description(&self) -> ServerDescription {
        self.description.read().clone()
    }

    fn get_channel(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        let connection = self
            .pool
            .acquire_connection(ctx)
            .inspect_err(|err| self.handle_channel_error(err))?;
        Ok(ChannelHandle::new(Channel::new(connection)))
    }

    async fn get_channel_async(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        let connection = self
            .pool
            .acquire_connection_async(ctx)
            .await
            .inspect_err(|err| self.handle_channel_error(err))?;
        Ok(ChannelHandle::new(Channel::new(connection)))
    }
}

impl std::fmt::Debug for PooledServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledServer")
            .field("server_id", self.pool.server_id())
            .finish()
    }
}
