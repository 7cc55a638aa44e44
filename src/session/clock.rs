//! Cluster and operation clocks gossiped with every command.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Logical server timestamp. Ordered by seconds, then increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u32,
    pub increment: u32,
}

impl Timestamp {
    pub fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }
}

/// Cluster time as reported by a server, with its opaque signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTime {
    pub cluster_time: Timestamp,
    pub signature: Option<serde_json::Value>,
}

impl ClusterTime {
    pub fn new(cluster_time: Timestamp) -> Self {
        Self {
            cluster_time,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: serde_json::Value) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// Highest cluster time seen. Older values never replace newer ones.
#[derive(Debug, Default)]
pub struct ClusterClock {
    cluster_time: Mutex<Option<ClusterTime>>,
}

impl ClusterClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.cluster_time.lock().clone()
    }

    pub fn advance(&self, new_cluster_time: &ClusterTime) {
        let mut current = self.cluster_time.lock();
        let newer = match current.as_ref() {
            Some(existing) => new_cluster_time.cluster_time > existing.cluster_time,
            None => true,
        };
        if newer {
            *current = Some(new_cluster_time.clone());
        }
    }
}

/// Highest operation time seen.
#[derive(Debug, Default)]
pub struct OperationClock {
    operation_time: Mutex<Option<Timestamp>>,
}

impl OperationClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        *self.operation_time.lock()
    }

    pub fn advance(&self, new_operation_time: Timestamp) {
        let mut current = self.operation_time.lock();
        if current.map_or(true, |existing| new_operation_time > existing) {
            *current = Some(new_operation_time);
        }
    }
}
