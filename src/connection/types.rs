//! Identities and descriptions shared by the transport, pool and binding layers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Identifies one client-side view of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

/// Network address of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndPoint {
    pub host: String,
    pub port: u16,
}

impl EndPoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of a server within a cluster. One pool exists per server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    pub cluster_id: ClusterId,
    pub endpoint: EndPoint,
}

impl ServerId {
    pub fn new(cluster_id: ClusterId, endpoint: EndPoint) -> Self {
        Self {
            cluster_id,
            endpoint,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@cluster-{}", self.endpoint, self.cluster_id.0)
    }
}

static NEXT_CONNECTION_VALUE: AtomicU64 = AtomicU64::new(1);

/// Client-assigned connection identity, unique within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    pub server_id: ServerId,
    pub local_value: u64,
}

impl ConnectionId {
    /// Allocate the next local id for `server_id`.
    pub fn next(server_id: ServerId) -> Self {
        Self {
            server_id,
            local_value: NEXT_CONNECTION_VALUE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.server_id.endpoint, self.local_value)
    }
}

/// Opaque identity of a backend behind a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of server reported by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ShardRouter,
    LoadBalanced,
    Unknown,
}

impl ServerType {
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::ReplicaSetPrimary
                | ServerType::ShardRouter
                | ServerType::LoadBalanced
        )
    }
}

/// Handshake results for an open connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    pub connection_id: ConnectionId,
    pub server_type: ServerType,
    pub max_wire_version: i32,
    pub service_id: Option<ServiceId>,
    pub logical_session_timeout: Option<Duration>,
}

impl ConnectionDescription {
    pub fn new(connection_id: ConnectionId, server_type: ServerType, max_wire_version: i32) -> Self {
        Self {
            connection_id,
            server_type,
            max_wire_version,
            service_id: None,
            logical_session_timeout: None,
        }
    }

    pub fn with_service_id(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_logical_session_timeout(mut self, timeout: Duration) -> Self {
        self.logical_session_timeout = Some(timeout);
        self
    }
}

/// An already-encoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub request_id: i32,
    pub payload: Vec<u8>,
}

/// A raw reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub response_to: i32,
    pub payload: Vec<u8>,
}

/// Transport-level expiry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Idle longer than this and the connection is stale. `None` disables.
    pub max_idle_time: Option<Duration>,
    /// Older than this and the connection is stale. `None` disables.
    pub max_life_time: Option<Duration>,
}

impl ConnectionSettings {
    pub fn is_expired(&self, created_at: Instant, last_used_at: Instant) -> bool {
        let now = Instant::now();
        if let Some(max_life_time) = self.max_life_time {
            if now.saturating_duration_since(created_at) > max_life_time {
                return true;
            }
        }
        if let Some(max_idle_time) = self.max_idle_time {
            if now.saturating_duration_since(last_used_at) > max_idle_time {
                return true;
            }
        }
        false
    }
}
