//! Reference-counted binding handles.

use std::sync::Arc;

use async_trait::async_trait;

use super::bindings::{ReadBinding, ReadWriteBinding};
use super::channel_source::ChannelSourceHandle;
use crate::error::DriverError;
use crate::session::{ReadPreference, SessionHandle};
use crate::sync::{OperationContext, SharedHandle};

/// Forkable read-write binding. The binding is disposed with its last fork.
pub struct ReadWriteBindingHandle {
    inner: SharedHandle<dyn ReadWriteBinding>,
}

impl ReadWriteBindingHandle {
    pub fn new(binding: Arc<dyn ReadWriteBinding>) -> Self {
        Self {
            inner: SharedHandle::new(binding, |binding| binding.dispose()),
        }
    }

    pub fn fork(&self) -> Result<Self, DriverError> {
        Ok(Self {
            inner: self
                .inner
                .fork()
                .map_err(|_| DriverError::ObjectDisposed("ReadWriteBindingHandle"))?,
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn reference_count(&self) -> usize {
        self.inner.reference_count()
    }

    fn binding(&self) -> Result<&Arc<dyn ReadWriteBinding>, DriverError> {
        self.inner
            .get()
            .map_err(|_| DriverError::ObjectDisposed("ReadWriteBindingHandle"))
    }
}

#[async_trait]
impl ReadBinding for ReadWriteBindingHandle {
    fn read_preference(&self) -> ReadPreference {
        self.inner.peek().read_preference()
    }

    fn session(&self) -> &dyn SessionHandle {
        self.inner.peek().session()
    }

    fn get_read_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.binding()?.get_read_channel_source(ctx)
    }

    async fn get_read_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.binding()?.get_read_channel_source_async(ctx).await
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

#[async_trait]
impl ReadWriteBinding for ReadWriteBindingHandle {
    fn get_write_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.binding()?.get_write_channel_source(ctx)
    }

    async fn get_write_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.binding()?.get_write_channel_source_async(ctx).await
    }
}

impl std::fmt::Debug for ReadWriteBindingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteBindingHandle")
            .field("disposed", &self.is_disposed())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}

/// Forkable read binding.
pub struct ReadBindingHandle {
    inner: SharedHandle<dyn ReadBinding>,
}

impl ReadBindingHandle {
    pub fn new(binding: Arc<dyn ReadBinding>) -> Self {
        Self {
            inner: SharedHandle::new(binding, |binding| binding.dispose()),
        }
    }

    pub fn fork(&self) -> Result<Self, DriverError> {
        Ok(Self {
            inner: self
                .inner
                .fork()
                .map_err(|_| DriverError::ObjectDisposed("ReadBindingHandle"))?,
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn reference_count(&self) -> usize {
        self.inner.reference_count()
    }

    fn binding(&self) -> Result<&Arc<dyn ReadBinding>, DriverError> {
        self.inner
            .get()
            .map_err(|_| DriverError::ObjectDisposed("ReadBindingHandle"))
    }
}

#[async_trait]
impl ReadBinding for ReadBindingHandle {
    fn read_preference(&self) -> ReadPreference {
        self.inner.peek().read_preference()
    }

    fn session(&self) -> &dyn SessionHandle {
        self.inner.peek().session()
    }

    fn get_read_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSourceHandle, DriverError> {
        self.binding()?.get_read_channel_source(ctx)
    }

    async fn get_read_channel_source_async(
        &self,
        ctx: &OperationContext,
    ) -> Result<ChannelSourceHandle, DriverError> {
        self.binding()?.get_read_channel_source_async(ctx).await
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

impl std::fmt::Debug for ReadBindingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBindingHandle")
            .field("disposed", &self.is_disposed())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}
