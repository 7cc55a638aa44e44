//! Read and read-write bindings.
//!
//! A binding ties an operation to a session and decides which server (or
//! pinned channel) its channel sources come from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::channel::ChannelHandle;
use super::channel_source::{ChannelChannelSource, ChannelSourceHandle, ServerChannelSource};
use super::cluster::{Cluster, ClusterType, ServerSelector};
use super::server::Server;
use crate::error::DriverError;
use crate::session::{ReadPreference, SessionHandle};
use crate::sync::OperationContext;

#[async_trait]
pub trait ReadBinding: Send + Sync {
    fn read_preference(&self) -> ReadPreference;

    fn session(&self) -> &dyn SessionHandle;

    fn get_read_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError>;

    async fn get_read_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError>;

    /// Release the binding's session and channels. Repeated calls are no-ops.
    fn dispose(&self);
}

#[async_trait]
pub trait ReadWriteBinding: ReadBinding {
    fn get_write_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError>;

    async fn get_write_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError>;
}

/// Shared disposal flag for the concrete bindings.
#[derive(Debug)]
struct DisposeGuard {
    disposed: AtomicBool,
    name: &'static str,
}

impl DisposeGuard {
    fn new(name: &'static str) -> Self {
        Self {
            disposed: AtomicBool::new(false),
            name,
        }
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(DriverError::ObjectDisposed(self.name))
        } else {
            Ok(())
        }
    }

    /// True the first time only.
    fn begin_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }
}

fn server_source(
    server: &Arc<dyn Server>,
    session: &dyn SessionHandle,
) -> Result<ChannelSourceHandle, DriverError> {
    let source = ServerChannelSource::new(Arc::clone(server), session.fork()?);
    Ok(ChannelSourceHandle::new(Arc::new(source)))
}

/// Every channel source comes from one server.
pub struct SingleServerReadWriteBinding {
    server: Arc<dyn Server>,
    session: Box<dyn SessionHandle>,
    guard: DisposeGuard,
}

impl SingleServerReadWriteBinding {
    pub fn new(server: Arc<dyn Server>, session: Box<dyn SessionHandle>) -> Self {
        Self {
            server,
            session,
            guard: DisposeGuard::new("SingleServerReadWriteBinding"),
        }
    }

    fn source(&self) -> Result<ChannelSourceHandle, DriverError> {
        self.guard.check()?;
        server_source(&self.server, self.session.as_ref())
    }
}

#[async_trait]
impl ReadBinding for SingleServerReadWriteBinding {
    fn read_preference(&self) -> ReadPreference {
        ReadPreference::Primary
    }

    fn session(&self) -> &dyn SessionHandle {
        self.session.as_ref()
    }

    fn get_read_channel_source(&self, _ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    async fn get_read_channel_source_async(
        &self,
        _ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    fn dispose(&self) {
        if self.guard.begin_dispose() {
            self.session.dispose();
        }
    }
}

#[async_trait]
impl ReadWriteBinding for SingleServerReadWriteBinding {
    fn get_write_channel_source(&self, _ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    async fn get_write_channel_source_async(
        &self,
        _ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }
}

/// Every channel source hands out forks of one channel.
pub struct ChannelReadWriteBinding {
    server: Arc<dyn Server>,
    channel: ChannelHandle,
    session: Box<dyn SessionHandle>,
    guard: DisposeGuard,
}

impl ChannelReadWriteBinding {
    pub fn new(server: Arc<dyn Server>, channel: ChannelHandle, session: Box<dyn SessionHandle>) -> Self {
        Self {
            server,
            channel,
            session,
            guard: DisposeGuard::new("ChannelReadWriteBinding"),
        }
    }

    fn source(&self) -> Result<ChannelSourceHandle, DriverError> {
        self.guard.check()?;
        let source = ChannelChannelSource::new(
            Arc::clone(&self.server),
            self.channel.fork()?,
            self.session.fork()?,
        );
        Ok(ChannelSourceHandle::new(Arc::new(source)))
    }
}

#[async_trait]
impl ReadBinding for ChannelReadWriteBinding {
    fn read_preference(&self) -> ReadPreference {
        ReadPreference::Primary
    }

    fn session(&self) -> &dyn SessionHandle {
        self.session.as_ref()
    }

    fn get_read_channel_source(&self, _ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    async fn get_read_channel_source_async(
        &self,
        _ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    fn dispose(&self) {
        if self.guard.begin_dispose() {
            self.channel.dispose();
            self.session.dispose();
        }
    }
}

#[async_trait]
impl ReadWriteBinding for ChannelReadWriteBinding {
    fn get_write_channel_source(&self, _ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    async fn get_write_channel_source_async(
        &self,
        _ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }
}

/// Every request gets a fork of one channel source.
pub struct ChannelSourceReadWriteBinding {
    channel_source: ChannelSourceHandle,
    read_preference: ReadPreference,
    session: Box<dyn SessionHandle>,
    guard: DisposeGuard,
}

impl ChannelSourceReadWriteBinding {
    pub fn new(
        channel_source: ChannelSourceHandle,
        read_preference: ReadPreference,
        session: Box<dyn SessionHandle>,
    ) -> Self {
        Self {
            channel_source,
            read_preference,
            session,
            guard: DisposeGuard::new("ChannelSourceReadWriteBinding"),
        }
    }

    fn source(&self) -> Result<ChannelSourceHandle, DriverError> {
        self.guard.check()?;
        self.channel_source.fork()
    }
}

#[async_trait]
impl ReadBinding for ChannelSourceReadWriteBinding {
    fn read_preference(&self) -> ReadPreference {
        self.read_preference
    }

    fn session(&self) -> &dyn SessionHandle {
        self.session.as_ref()
    }

    fn get_read_channel_source(&self, _ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    async fn get_read_channel_source_async(
        &self,
        _ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    fn dispose(&self) {
        if self.guard.begin_dispose() {
            self.channel_source.dispose();
            self.session.dispose();
        }
    }
}

#[async_trait]
impl ReadWriteBinding for ChannelSourceReadWriteBinding {
    fn get_write_channel_source(&self, _ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }

    async fn get_write_channel_source_async(
        &self,
        _ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.source()
    }
}

/// Selects a server from the cluster for every request.
///
/// Inside a sharded transaction the first selected server is pinned and
/// reused until the transaction unpins it.
pub struct WritableServerBinding {
    cluster: Arc<dyn Cluster>,
    session: Box<dyn SessionHandle>,
    guard: DisposeGuard,
}

impl WritableServerBinding {
    pub fn new(cluster: Arc<dyn Cluster>, session: Box<dyn SessionHandle>) -> Self {
        Self {
            cluster,
            session,
            guard: DisposeGuard::new("WritableServerBinding"),
        }
    }

    fn source_for(&self, server: Arc<dyn Server>) -> Result<ChannelSourceHandle, DriverError> {
        pin_server_if_needed(self.cluster.as_ref(), self.session.as_ref(), &server)?;
        server_source(&server, self.session.as_ref())
    }

    fn write_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.guard.check()?;
        if let Some(server) = pinned_server(self.session.as_ref())? {
            return server_source(&server, self.session.as_ref());
        }
        let server = self.cluster.select_server(&ServerSelector::Writable, ctx)?;
        self.source_for(server)
    }

    async fn write_source_async(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.guard.check()?;
        if let Some(server) = pinned_server(self.session.as_ref())? {
            return server_source(&server, self.session.as_ref());
        }
        let server = self
            .cluster
            .select_server_async(&ServerSelector::Writable, ctx)
            .await?;
        self.source_for(server)
    }
}

#[async_trait]
impl ReadBinding for WritableServerBinding {
    fn read_preference(&self) -> ReadPreference {
        ReadPreference::Primary
    }

    fn session(&self) -> &dyn SessionHandle {
        self.session.as_ref()
    }

    fn get_read_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.write_source(ctx)
    }

    async fn get_read_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.write_source_async(ctx).await
    }

    fn dispose(&self) {
        if self.guard.begin_dispose() {
            self.session.dispose();
        }
    }
}

#[async_trait]
impl ReadWriteBinding for WritableServerBinding {
    fn get_write_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.write_source(ctx)
    }

    async fn get_write_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.write_source_async(ctx).await
    }
}

/// Selects a server matching a read preference for every request.
pub struct ReadPreferenceBinding {
    cluster: Arc<dyn Cluster>,
    read_preference: ReadPreference,
    session: Box<dyn SessionHandle>,
    guard: DisposeGuard,
}

impl ReadPreferenceBinding {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        read_preference: ReadPreference,
        session: Box<dyn SessionHandle>,
    ) -> Self {
        Self {
            cluster,
            read_preference,
            session,
            guard: DisposeGuard::new("ReadPreferenceBinding"),
        }
    }

    fn selector(&self) -> ServerSelector {
        ServerSelector::Read(self.read_preference)
    }
}

#[async_trait]
impl ReadBinding for ReadPreferenceBinding {
    fn read_preference(&self) -> ReadPreference {
        self.read_preference
    }

    fn session(&self) -> &dyn SessionHandle {
        self.session.as_ref()
    }

    fn get_read_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.guard.check()?;
        if let Some(server) = pinned_server(self.session.as_ref())? {
            return server_source(&server, self.session.as_ref());
        }
        let server = self.cluster.select_server(&self.selector(), ctx)?;
        pin_server_if_needed(self.cluster.as_ref(), self.session.as_ref(), &server)?;
        server_source(&server, self.session.as_ref())
    }

    async fn get_read_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.guard.check()?;
        if let Some(server) = pinned_server(self.session.as_ref())? {
            return server_source(&server, self.session.as_ref());
        }
        let server = self.cluster.select_server_async(&self.selector(), ctx).await?;
        pin_server_if_needed(self.cluster.as_ref(), self.session.as_ref(), &server)?;
        server_source(&server, self.session.as_ref())
    }

    fn dispose(&self) {
        if self.guard.begin_dispose() {
            self.session.dispose();
        }
    }
}

/// The server the session's transaction is pinned to, if any.
fn pinned_server(session: &dyn SessionHandle) -> Result<Option<Arc<dyn Server>>, DriverError> {
    Ok(session
        .session()?
        .current_transaction()
        .and_then(|t| t.pinned_server()))
}

/// Sharded transactions stay on the first server they touch.
fn pin_server_if_needed(
    cluster: &dyn Cluster,
    session: &dyn SessionHandle,
    server: &Arc<dyn Server>,
) -> Result<(), DriverError> {
    let session = session.session()?;
    if cluster.description().cluster_type == ClusterType::Sharded && session.is_in_transaction() {
        if let Some(transaction) = session.current_transaction() {
            transaction.pin_server(Arc::clone(server));
        }
    }
    Ok(())
}
