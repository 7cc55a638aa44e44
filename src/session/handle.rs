//! Handles through which operations and bindings share a session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::core_session::CoreSession;
use crate::error::DriverError;
use crate::sync::SharedHandle;

/// A forkable view of a [`CoreSession`].
pub trait SessionHandle: Send + Sync {
    /// The session, or `ObjectDisposed` once this handle is disposed.
    fn session(&self) -> Result<&Arc<CoreSession>, DriverError>;

    fn fork(&self) -> Result<Box<dyn SessionHandle>, DriverError>;

    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Reference-counted session handle. The session is disposed when the last
/// fork goes.
pub struct CoreSessionHandle {
    inner: SharedHandle<CoreSession>,
}

impl CoreSessionHandle {
    pub fn new(session: Arc<CoreSession>) -> Self {
        Self {
            inner: SharedHandle::new(session, |session| session.dispose()),
        }
    }

    pub fn fork_handle(&self) -> Result<Self, DriverError> {
        Ok(Self {
            inner: self
                .inner
                .fork()
                .map_err(|_| DriverError::ObjectDisposed("CoreSessionHandle"))?,
        })
    }

    pub fn reference_count(&self) -> usize {
        self.inner.reference_count()
    }
}

impl SessionHandle for CoreSessionHandle {
    fn session(&self) -> Result<&Arc<CoreSession>, DriverError> {
        self.inner
            .get()
            .map_err(|_| DriverError::ObjectDisposed("CoreSessionHandle"))
    }

    fn fork(&self) -> Result<Box<dyn SessionHandle>, DriverError> {
        Ok(Box::new(self.fork_handle()?))
    }

    fn dispose(&self) {
        self.inner.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl std::fmt::Debug for CoreSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreSessionHandle")
            .field("session_id", &self.inner.peek().id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Session handle whose disposal never reaches the session.
///
/// Used when a session runs commands on its own behalf.
pub struct NonDisposingCoreSessionHandle {
    session: Arc<CoreSession>,
    disposed: AtomicBool,
}

impl NonDisposingCoreSessionHandle {
    pub fn new(session: Arc<CoreSession>) -> Self {
        Self {
            session,
            disposed: AtomicBool::new(false),
        }
    }
}

impl SessionHandle for NonDisposingCoreSessionHandle {
    fn session(&self) -> Result<&Arc<CoreSession>, DriverError> {
        if self.is_disposed() {
            return Err(DriverError::ObjectDisposed("NonDisposingCoreSessionHandle"));
        }
        Ok(&self.session)
    }

    fn fork(&self) -> Result<Box<dyn SessionHandle>, DriverError> {
        let session = self.session()?;
        Ok(Box::new(Self::new(Arc::clone(session))))
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
