//! Pool lifecycle events.
//!
//! Every event is logged through `tracing` and, when a listener is attached,
//! forwarded to it synchronously on the thread that raised it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::{ConnectionId, ServerId, ServiceId};

/// Why a checkout failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutFailedReason {
    PoolClosed,
    Timeout,
    WaitQueueFull,
    Cancelled,
    ConnectionError,
}

impl CheckOutFailedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolClosed => "pool_closed",
            Self::Timeout => "timeout",
            Self::WaitQueueFull => "wait_queue_full",
            Self::Cancelled => "cancelled",
            Self::ConnectionError => "connection_error",
        }
    }
}

/// A pool lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    Opening { server_id: ServerId },
    Opened { server_id: ServerId },
    Closing { server_id: ServerId },
    Closed { server_id: ServerId },
    Clearing { server_id: ServerId, service_id: Option<ServiceId> },
    Cleared { server_id: ServerId, service_id: Option<ServiceId> },
    CheckingOut { server_id: ServerId },
    CheckedOut { connection_id: ConnectionId, duration: Duration },
    CheckOutFailed { server_id: ServerId, reason: CheckOutFailedReason, duration: Duration },
    CheckingIn { connection_id: ConnectionId },
    CheckedIn { connection_id: ConnectionId, duration: Duration },
    Adding { server_id: ServerId },
    Added { connection_id: ConnectionId, duration: Duration },
    Removing { connection_id: ConnectionId },
    Removed { connection_id: ConnectionId, duration: Duration },
    ConnectionOpening { connection_id: ConnectionId },
    ConnectionOpened { connection_id: ConnectionId, duration: Duration },
    ConnectionClosed { connection_id: ConnectionId },
}

impl PoolEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening { .. } => "pool_opening",
            Self::Opened { .. } => "pool_opened",
            Self::Closing { .. } => "pool_closing",
            Self::Closed { .. } => "pool_closed",
            Self::Clearing { .. } => "pool_clearing",
            Self::Cleared { .. } => "pool_cleared",
            Self::CheckingOut { .. } => "checking_out",
            Self::CheckedOut { .. } => "checked_out",
            Self::CheckOutFailed { .. } => "check_out_failed",
            Self::CheckingIn { .. } => "checking_in",
            Self::CheckedIn { .. } => "checked_in",
            Self::Adding { .. } => "adding_connection",
            Self::Added { .. } => "added_connection",
            Self::Removing { .. } => "removing_connection",
            Self::Removed { .. } => "removed_connection",
            Self::ConnectionOpening { .. } => "connection_opening",
            Self::ConnectionOpened { .. } => "connection_opened",
            Self::ConnectionClosed { .. } => "connection_closed",
        }
    }

    /// Time the event's step took, for events that measure one.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::CheckedOut { duration, .. }
            | Self::CheckOutFailed { duration, .. }
            | Self::CheckedIn { duration, .. }
            | Self::Added { duration, .. }
            | Self::Removed { duration, .. }
            | Self::ConnectionOpened { duration, .. } => Some(*duration),
            _ => None,
        }
    }
}

/// Receives pool events.
pub trait PoolEventListener: Send + Sync {
    fn on_event(&self, event: &PoolEvent);
}

/// Logs events and forwards them to an optional listener.
#[derive(Clone, Default)]
pub struct EventLogger {
    listener: Option<Arc<dyn PoolEventListener>>,
}

impl EventLogger {
    pub fn new(listener: Option<Arc<dyn PoolEventListener>>) -> Self {
        Self { listener }
    }

    pub fn publish(&self, event: PoolEvent) {
        log_event(&event);
        if let Some(listener) = &self.listener {
            listener.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

fn log_event(event: &PoolEvent) {
    let name = event.as_str();
    match event {
        PoolEvent::Opening { server_id }
        | PoolEvent::Opened { server_id }
        | PoolEvent::Closing { server_id }
        | PoolEvent::Closed { server_id } => {
            info!(event = name, server = %server_id, "Connection pool state change");
        }
        PoolEvent::Clearing { server_id, service_id }
        | PoolEvent::Cleared { server_id, service_id } => {
            info!(
                event = name,
                server = %server_id,
                service_id = service_id.as_ref().map(ServiceId::as_str),
                "Connection pool clear"
            );
        }
        PoolEvent::CheckOutFailed {
            server_id,
            reason,
            duration,
        } => {
            warn!(
                event = name,
                server = %server_id,
                reason = reason.as_str(),
                duration_ms = duration.as_millis() as u64,
                "Connection checkout failed"
            );
        }
        PoolEvent::CheckingOut { server_id } | PoolEvent::Adding { server_id } => {
            debug!(event = name, server = %server_id);
        }
        PoolEvent::CheckedOut { connection_id, duration }
        | PoolEvent::CheckedIn { connection_id, duration }
        | PoolEvent::Added { connection_id, duration }
        | PoolEvent::Removed { connection_id, duration }
        | PoolEvent::ConnectionOpened { connection_id, duration } => {
            debug!(
                event = name,
                connection = %connection_id,
                duration_ms = duration.as_millis() as u64
            );
        }
        PoolEvent::CheckingIn { connection_id }
        | PoolEvent::Removing { connection_id }
        | PoolEvent::ConnectionOpening { connection_id }
        | PoolEvent::ConnectionClosed { connection_id } => {
            debug!(event = name, connection = %connection_id);
        }
    }
}
