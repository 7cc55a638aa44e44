//! Error types for the driver core.
//!
//! Acquisition errors always leave semaphores and slots released before they
//! reach the caller.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ServiceId;
use crate::sync::WaitError;

/// Label attached by servers to errors that are safe to retry as writes.
pub const RETRYABLE_WRITE_ERROR_LABEL: &str = "RetryableWriteError";
/// Label attached when the outcome of a commit is unknown.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL: &str = "UnknownTransactionCommitResult";
/// Label attached to errors raised by a transient transaction failure.
pub const TRANSIENT_TRANSACTION_ERROR_LABEL: &str = "TransientTransactionError";

/// Server error codes that classify a failed write as retryable.
const RETRYABLE_WRITE_CODES: &[i32] = &[
    6,     // HostUnreachable
    7,     // HostNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    262,   // ExceededTimeLimit
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// Errors raised by the pool, binding and session layers.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("{message}")]
    Timeout { elapsed: Duration, message: String },

    #[error("The wait queue for acquiring a connection to server {endpoint} is full.")]
    WaitQueueFull { endpoint: String },

    #[error("Cannot access a disposed object: {0}")]
    ObjectDisposed(&'static str),

    #[error("Connection pool must be initialized")]
    NotInitialized,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Connection error: {message}")]
    Connection {
        message: String,
        generation: Option<u64>,
        service_id: Option<ServiceId>,
    },

    #[error("Command failed with code {code}: {message}")]
    Command {
        code: i32,
        message: String,
        labels: Vec<String>,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl DriverError {
    /// Build a transport-level error with no pool context yet.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            generation: None,
            service_id: None,
        }
    }

    /// Build a timeout error for the given elapsed wait.
    pub fn timeout(elapsed: Duration, message: impl Into<String>) -> Self {
        Self::Timeout {
            elapsed,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::ObjectDisposed(_))
    }

    /// Returns true if the server attached the given label.
    pub fn has_error_label(&self, label: &str) -> bool {
        match self {
            Self::Command { labels, .. } => labels.iter().any(|l| l == label),
            _ => false,
        }
    }

    /// Classifies errors for the single retry of commit/abort.
    pub fn is_retryable_end_transaction_error(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Command { code, labels, .. } => {
                RETRYABLE_WRITE_CODES.contains(code)
                    || labels.iter().any(|l| l == RETRYABLE_WRITE_ERROR_LABEL)
            }
            _ => false,
        }
    }

    /// Attach pool generation and service id to a transport error.
    ///
    /// Other variants are returned unchanged.
    pub fn with_connection_details(self, generation: u64, service: Option<ServiceId>) -> Self {
        match self {
            Self::Connection { message, .. } => Self::Connection {
                message,
                generation: Some(generation),
                service_id: service,
            },
            other => other,
        }
    }

    /// Generation of the connection that raised this error, if known.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Connection { generation, .. } => *generation,
            _ => None,
        }
    }

    /// Add a label to a command error. No-op on other variants.
    pub fn add_label(&mut self, label: &str) {
        if let Self::Command { labels, .. } = self {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
    }
}

impl From<WaitError> for DriverError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Cancelled => Self::Cancelled,
            WaitError::Closed => Self::ObjectDisposed("ExclusiveConnectionPool"),
        }
    }
}
