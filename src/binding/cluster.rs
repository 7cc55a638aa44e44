//! The view of the topology that bindings select servers from.
//!
//! Topology monitoring lives elsewhere; this crate only needs descriptions
//! and a way to pick a server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::server::Server;
use crate::connection::{ClusterId, EndPoint, ServerId, ServerType};
use crate::error::DriverError;
use crate::session::ReadPreference;
use crate::sync::OperationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterType {
    Standalone,
    ReplicaSet,
    Sharded,
    LoadBalanced,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescription {
    pub server_id: ServerId,
    pub server_type: ServerType,
    pub state: ServerState,
    pub max_wire_version: i32,
    pub logical_session_timeout: Option<Duration>,
}

impl ServerDescription {
    pub fn new(server_id: ServerId, server_type: ServerType, max_wire_version: i32) -> Self {
        Self {
            server_id,
            server_type,
            state: ServerState::Connected,
            max_wire_version,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }

    pub fn with_state(mut self, state: ServerState) -> Self {
        self.state = state;
        self
    }

    pub fn with_logical_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.logical_session_timeout = timeout;
        self
    }

    pub fn is_data_bearing(&self) -> bool {
        !matches!(self.server_type, ServerType::Unknown)
    }

    pub fn endpoint(&self) -> &EndPoint {
        &self.server_id.endpoint
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescription {
    pub cluster_id: ClusterId,
    pub cluster_type: ClusterType,
    pub servers: Vec<ServerDescription>,
}

impl ClusterDescription {
    /// Smallest timeout among connected data-bearing servers. `None` when
    /// there are none, or when any of them does not support sessions.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        let mut result: Option<Duration> = None;
        for server in self
            .servers
            .iter()
            .filter(|s| s.state == ServerState::Connected && s.is_data_bearing())
        {
            let timeout = server.logical_session_timeout?;
            result = Some(result.map_or(timeout, |current| current.min(timeout)));
        }
        result
    }
}

/// Which servers an operation may run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSelector {
    Writable,
    Read(ReadPreference),
    EndPoint(EndPoint),
}

impl ServerSelector {
    /// Servers matching the selector, in preference order.
    pub fn select<'a>(&self, servers: &'a [ServerDescription]) -> Vec<&'a ServerDescription> {
        let connected = || servers.iter().filter(|s| s.state == ServerState::Connected);
        let writable = || connected().filter(|s| s.server_type.is_writable());
        let secondaries = || {
            connected().filter(|s| s.server_type == ServerType::ReplicaSetSecondary)
        };

        match self {
            ServerSelector::Writable | ServerSelector::Read(ReadPreference::Primary) => {
                writable().collect()
            }
            ServerSelector::Read(ReadPreference::PrimaryPreferred) => {
                writable().chain(secondaries()).collect()
            }
            ServerSelector::Read(ReadPreference::Secondary) => secondaries().collect(),
            ServerSelector::Read(ReadPreference::SecondaryPreferred) => {
                secondaries().chain(writable()).collect()
            }
            ServerSelector::Read(ReadPreference::Nearest) => {
                connected().filter(|s| s.is_data_bearing()).collect()
            }
            ServerSelector::EndPoint(endpoint) => {
                connected().filter(|s| s.endpoint() == endpoint).collect()
            }
        }
    }
}

/// Topology seen by bindings and sessions.
#[async_trait]
pub trait Cluster: Send + Sync {
    fn cluster_id(&self) -> ClusterId;

    fn description(&self) -> ClusterDescription;

    fn select_server(
        &self,
        selector: &ServerSelector,
        ctx: &OperationContext,
    ) -> Result<Arc<dyn Server>, DriverError>;

    async fn select_server_async(
        &self,
        selector: &ServerSelector,
        ctx: &OperationContext,
    ) -> Result<Arc<dyn Server>, DriverError>;
}

/// A cluster with a fixed set of servers.
pub struct StaticCluster {
    cluster_id: ClusterId,
    cluster_type: ClusterType,
    servers: Vec<Arc<dyn Server>>,
}

impl StaticCluster {
    pub fn new(cluster_id: ClusterId, cluster_type: ClusterType, servers: Vec<Arc<dyn Server>>) -> Self {
        Self {
            cluster_id,
            cluster_type,
            servers,
        }
    }

    pub fn servers(&self) -> &[Arc<dyn Server>] {
        &self.servers
    }
}

#[async_trait]
impl Cluster for StaticCluster {
    fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    fn description(&self) -> ClusterDescription {
        ClusterDescription {
            cluster_id: self.cluster_id,
            cluster_type: self.cluster_type,
            servers: self.servers.iter().map(|s| s.description()).collect(),
        }
    }

    fn select_server(
        &self,
        selector: &ServerSelector,
        ctx: &OperationContext,
    ) -> Result<Arc<dyn Server>, DriverError> {
        ctx.throw_if_timed_out_or_cancelled()?;
        let description = self.description();
        let selected = selector.select(&description.servers);
        selected
            .first()
            .and_then(|chosen| {
                self.servers
                    .iter()
                    .find(|s| s.server_id() == &chosen.server_id)
            })
            .cloned()
            .ok_or_else(|| {
                DriverError::timeout(
                    ctx.elapsed(),
                    format!("No server matching {selector:?} in cluster {}.", self.cluster_id.0),
                )
            })
    }

    async fn select_server_async(
        &self,
        selector: &ServerSelector,
        ctx: &OperationContext,
    ) -> Result<Arc<dyn Server>, DriverError> {
        self.select_server(selector, ctx)
    }
}

impl std::fmt::Debug for StaticCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCluster")
            .field("cluster_id", &self.cluster_id)
            .field("cluster_type", &self.cluster_type)
            .field("servers", &self.servers.len())
            .finish()
    }
}
