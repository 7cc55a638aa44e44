//! Channel sources: where a binding gets channels for one server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::channel::ChannelHandle;
use super::cluster::ServerDescription;
use super::server::Server;
use crate::error::DriverError;
use crate::session::SessionHandle;
use crate::sync::{OperationContext, SharedHandle};

#[async_trait]
pub trait ChannelSource: Send + Sync {
    fn server(&self) -> &Arc<dyn Server>;

    fn server_description(&self) -> ServerDescription {
        self.server().description()
    }

    fn session(&self) -> &dyn SessionHandle;

    fn get_channel(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError>;

    async fn get_channel_async(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError>;

    /// Release what the source holds. Repeated calls are no-ops.
    fn dispose(&self);
}

/// Checks a fresh channel out of the server for every request.
pub struct ServerChannelSource {
    server: Arc<dyn Server>,
    session: Box<dyn SessionHandle>,
    disposed: AtomicBool,
}

impl ServerChannelSource {
    pub fn new(server: Arc<dyn Server>, session: Box<dyn SessionHandle>) -> Self {
        Self {
            server,
            session,
            disposed: AtomicBool::new(false),
        }
    }

    fn throw_if_disposed(&self) -> Result<(), DriverError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(DriverError::ObjectDisposed("ServerChannelSource"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelSource for ServerChannelSource {
    fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    fn session(&self) -> &dyn SessionHandle {
        self.session.as_ref()
    }

    fn get_channel(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        self.throw_if_disposed()?;
        self.server.get_channel(ctx)
    }

    async fn get_channel_async(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        self.throw_if_disposed()?;
        self.server.get_channel_async(ctx).await
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.session.dispose();
        }
    }
}

/// Always hands out forks of one pinned channel.
pub struct ChannelChannelSource {
    server: Arc<dyn Server>,
    channel: ChannelHandle,
    session: Box<dyn SessionHandle>,
    disposed: AtomicBool,
}

impl ChannelChannelSource {
    pub fn new(server: Arc<dyn Server>, channel: ChannelHandle, session: Box<dyn SessionHandle>) -> Self {
        Self {
            server,
            channel,
            session,
            disposed: AtomicBool::new(false),
        }
    }

    fn fork_channel(&self) -> Result<ChannelHandle, DriverError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DriverError::ObjectDisposed("ChannelChannelSource"));
        }
        self.channel.fork()
    }
}

#[async_trait]
impl ChannelSource for ChannelChannelSource {
    fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    fn session(&self) -> &dyn SessionHandle {
        self.session.as_ref()
    }

    fn get_channel(&self, _ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        self.fork_channel()
    }

    async fn get_channel_async(&self, _ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        self.fork_channel()
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.channel.dispose();
            self.session.dispose();
        }
    }
}

/// Reference-counted channel source.
pub struct ChannelSourceHandle {
    inner: SharedHandle<dyn ChannelSource>,
}

impl ChannelSourceHandle {
    pub fn new(source: Arc<dyn ChannelSource>) -> Self {
        Self {
            inner: SharedHandle::new(source, |source| source.dispose()),
        }
    }

    pub fn fork(&self) -> Result<Self, DriverError> {
        Ok(Self {
            inner: self
                .inner
                .fork()
                .map_err(|_| DriverError::ObjectDisposed("ChannelSourceHandle"))?,
        })
    }

    pub fn source(&self) -> Result<&Arc<dyn ChannelSource>, DriverError> {
        self.inner
            .get()
            .map_err(|_| DriverError::ObjectDisposed("ChannelSourceHandle"))
    }

    pub fn server(&self) -> &Arc<dyn Server> {
        self.inner.peek().server()
    }

    pub fn server_description(&self) -> ServerDescription {
        self.inner.peek().server_description()
    }

    pub fn session(&self) -> Result<&dyn SessionHandle, DriverError> {
        Ok(self.source()?.session())
    }

    pub fn get_channel(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        self.source()?.get_channel(ctx)
    }

    pub async fn get_channel_async(&self, ctx: &OperationContext) -> Result<ChannelHandle, DriverError> {
        self.source()?.get_channel_async(ctx).await
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

impl std::fmt::Debug for ChannelSourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSourceHandle")
            .field("server_id", self.server().server_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
