//! Shared ownership with an explicit release hook.
//!
//! [`ReferenceCounted`] holds the count and the release callback.
//! [`SharedHandle`] is one owner's view of it: forking a handle adds an owner,
//! disposing (or dropping) a handle removes one, and the release callback runs
//! exactly once when the last owner goes away.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DriverError;

type ReleaseFn<T> = Box<dyn FnOnce(&Arc<T>) + Send>;

/// Counted wrapper around a shared instance.
pub struct ReferenceCounted<T: ?Sized> {
    instance: Arc<T>,
    count: AtomicUsize,
    release: Mutex<Option<ReleaseFn<T>>>,
}

impl<T: ?Sized> ReferenceCounted<T> {
    /// Create with a count of one.
    pub fn new(instance: Arc<T>, release: impl FnOnce(&Arc<T>) + Send + 'static) -> Self {
        Self {
            instance,
            count: AtomicUsize::new(1),
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn instance(&self) -> &Arc<T> {
        &self.instance
    }

    pub fn reference_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Add an owner. Fails once the count has reached zero.
    pub fn increment(&self) -> Result<(), DriverError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(DriverError::ObjectDisposed("ReferenceCounted"));
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Remove an owner, running the release hook when the count hits zero.
    ///
    /// The count never drops below zero.
    pub fn decrement(&self) {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            let release = self.release.lock().take();
            if let Some(release) = release {
                release(&self.instance);
            }
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ReferenceCounted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCounted")
            .field("count", &self.reference_count())
            .finish()
    }
}

/// One owner of a [`ReferenceCounted`] instance.
///
/// Dropping a handle disposes it.
pub struct SharedHandle<T: ?Sized> {
    reference: Arc<ReferenceCounted<T>>,
    disposed: AtomicBool,
}

impl<T: ?Sized> SharedHandle<T> {
    pub fn new(instance: Arc<T>, release: impl FnOnce(&Arc<T>) + Send + 'static) -> Self {
        Self::from_reference(Arc::new(ReferenceCounted::new(instance, release)))
    }

    /// Wrap an already-incremented reference.
    pub fn from_reference(reference: Arc<ReferenceCounted<T>>) -> Self {
        Self {
            reference,
            disposed: AtomicBool::new(false),
        }
    }

    /// New handle sharing the same instance.
    pub fn fork(&self) -> Result<Self, DriverError> {
        self.throw_if_disposed()?;
        self.reference.increment()?;
        Ok(Self::from_reference(Arc::clone(&self.reference)))
    }

    pub fn get(&self) -> Result<&Arc<T>, DriverError> {
        self.throw_if_disposed()?;
        Ok(self.reference.instance())
    }

    /// The instance without the disposal check, for identity and diagnostics.
    pub fn peek(&self) -> &Arc<T> {
        self.reference.instance()
    }

    /// Release this owner. Repeated calls are no-ops.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.reference.decrement();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn reference_count(&self) -> usize {
        self.reference.reference_count()
    }

    fn throw_if_disposed(&self) -> Result<(), DriverError> {
        if self.is_disposed() {
            Err(DriverError::ObjectDisposed("SharedHandle"))
        } else {
            Ok(())
        }
    }
}

impl<T: ?Sized> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: ?Sized> std::fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHandle")
            .field("disposed", &self.is_disposed())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}
