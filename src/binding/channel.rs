//! Channels: a checked-out connection seen as a command pipe.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionDescription, ConnectionId, RequestMessage, ResponseMessage, ServerType};
use crate::error::DriverError;
use crate::pool::ConnectionHandle;
use crate::sync::SharedHandle;

/// One checked-out connection used to run commands.
#[derive(Debug)]
pub struct Channel {
    connection: ConnectionHandle,
}

impl Channel {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.connection_id()
    }

    pub fn connection_description(&self) -> Option<ConnectionDescription> {
        self.connection.description()
    }

    pub fn is_load_balanced(&self) -> bool {
        self.connection_description()
            .is_some_and(|d| d.server_type == ServerType::LoadBalanced || d.service_id.is_some())
    }

    /// Send `request` and wait for its reply.
    pub fn command(
        &self,
        request: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.connection.send_message(request, cancel)?;
        self.connection.receive_message(request.request_id, cancel)
    }

    pub async fn command_async(
        &self,
        request: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.connection.send_message_async(request, cancel).await?;
        self.connection
            .receive_message_async(request.request_id, cancel)
            .await
    }

    fn dispose(&self) {
        self.connection.dispose();
    }
}

/// Reference-counted [`Channel`]. The connection is checked in when the
/// last fork is disposed.
pub struct ChannelHandle {
    inner: SharedHandle<Channel>,
}

impl ChannelHandle {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: SharedHandle::new(Arc::new(channel), |channel| channel.dispose()),
        }
    }

    pub fn fork(&self) -> Result<Self, DriverError> {
        Ok(Self {
            inner: self
                .inner
                .fork()
                .map_err(|_| DriverError::ObjectDisposed("ChannelHandle"))?,
        })
    }

    pub fn channel(&self) -> Result<&Arc<Channel>, DriverError> {
        self.inner
            .get()
            .map_err(|_| DriverError::ObjectDisposed("ChannelHandle"))
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.inner.peek().connection_id()
    }

    pub fn connection_description(&self) -> Option<ConnectionDescription> {
        self.inner.peek().connection_description()
    }

    pub fn is_load_balanced(&self) -> bool {
        self.inner.peek().is_load_balanced()
    }

    pub fn command(
        &self,
        request: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.channel()?.command(request, cancel)
    }

    pub async fn command_async(
        &self,
        request: &RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.channel()?.command_async(request, cancel).await
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn reference_count(&self) -> usize {
        self.inner.reference_count()
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("connection_id", self.connection_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
