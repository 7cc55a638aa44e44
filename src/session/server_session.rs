//! Server sessions and the pool that recycles them.
//!
//! A server session is the server-side identity behind a logical session. The
//! pool hands out the most recently used one first and drops any that are
//! dirty or close to the server's logical session timeout.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::options::SessionPoolSettings;
use crate::binding::Cluster;

/// Sessions this close to their server-side timeout are not reused.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Server-side session state.
#[derive(Debug)]
pub struct ServerSession {
    id: Uuid,
    last_used_at: Mutex<Option<Instant>>,
    transaction_number: AtomicI64,
    dirty: AtomicBool,
}

impl ServerSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            last_used_at: Mutex::new(None),
            transaction_number: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        *self.last_used_at.lock()
    }

    pub fn transaction_number(&self) -> i64 {
        self.transaction_number.load(Ordering::Acquire)
    }

    /// Bump and return the transaction number.
    pub fn advance_transaction_number(&self) -> i64 {
        self.transaction_number.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// A network error hit this session; it must not be reused.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn was_used(&self) {
        *self.last_used_at.lock() = Some(Instant::now());
    }
}

impl Default for ServerSession {
    fn default() -> Self {
        Self::new()
    }
}

/// LIFO pool of server sessions.
pub struct ServerSessionPool {
    cluster: Arc<dyn Cluster>,
    settings: SessionPoolSettings,
    sessions: Mutex<Vec<Arc<ServerSession>>>,
}

impl ServerSessionPool {
    pub fn new(cluster: Arc<dyn Cluster>, settings: SessionPoolSettings) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            settings,
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Reuse the most recently released session, or start a new one.
    pub fn acquire_session(self: &Arc<Self>) -> ServerSessionLease {
        let reused = {
            let mut sessions = self.sessions.lock();
            let mut found = None;
            while let Some(session) = sessions.pop() {
                if self.is_about_to_expire(&session) {
                    debug!(session_id = %session.id(), "Discarding expiring server session");
                    continue;
                }
                found = Some(session);
                break;
            }
            found
        };

        let session = reused.unwrap_or_else(|| Arc::new(ServerSession::new()));
        ServerSessionLease {
            session,
            pool: Arc::clone(self),
            released: AtomicBool::new(false),
        }
    }

    /// Return a session. Stale sessions at the oldest end are dropped first.
    pub fn release_session(&self, session: Arc<ServerSession>) {
        let mut sessions = self.sessions.lock();
        let stale = sessions
            .iter()
            .take_while(|s| self.is_about_to_expire(s))
            .count();
        sessions.drain(..stale);

        if session.is_dirty() || self.is_about_to_expire(&session) {
            debug!(
                session_id = %session.id(),
                dirty = session.is_dirty(),
                "Not returning server session to pool"
            );
            return;
        }
        sessions.push(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn logical_session_timeout(&self) -> Option<Duration> {
        self.cluster
            .description()
            .logical_session_timeout()
            .or(self.settings.logical_session_timeout)
    }

    fn is_about_to_expire(&self, session: &ServerSession) -> bool {
        let (Some(timeout), Some(last_used_at)) =
            (self.logical_session_timeout(), session.last_used_at())
        else {
            return true;
        };
        match last_used_at.checked_add(timeout) {
            Some(expires_at) => expires_at.saturating_duration_since(Instant::now()) < EXPIRY_MARGIN,
            None => false,
        }
    }
}

impl std::fmt::Debug for ServerSessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSessionPool")
            .field("pooled", &self.len())
            .finish()
    }
}

/// A server session checked out of a [`ServerSessionPool`].
///
/// Goes back to the pool on `release` or drop.
pub struct ServerSessionLease {
    session: Arc<ServerSession>,
    pool: Arc<ServerSessionPool>,
    released: AtomicBool,
}

impl ServerSessionLease {
    pub fn session(&self) -> &Arc<ServerSession> {
        &self.session
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.pool.release_session(Arc::clone(&self.session));
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ServerSessionLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ServerSessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSessionLease")
            .field("session_id", &self.session.id())
            .field("released", &self.is_released())
            .finish()
    }
}
