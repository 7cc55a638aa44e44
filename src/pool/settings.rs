//! Connection pool settings.

use std::time::Duration;

use crate::error::DriverError;

/// Settings for one server's connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoolSettings {
    /// Pool slots: the most connections checked out or idle at once.
    pub max_connections: usize,
    /// Connections the maintenance thread keeps open.
    pub min_connections: usize,
    /// Callers allowed to wait for a slot before `WaitQueueFull`.
    pub wait_queue_size: usize,
    /// Default checkout budget when the caller has no deadline.
    pub wait_queue_timeout: Duration,
    /// Period of the maintenance thread. `None` disables maintenance.
    pub maintenance_interval: Option<Duration>,
    /// Connections allowed to be establishing at once.
    pub max_connecting: usize,
    /// Connections are to backends behind a load balancer.
    pub load_balanced: bool,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            min_connections: 0,
            wait_queue_size: 500,
            wait_queue_timeout: Duration::from_secs(120),
            maintenance_interval: Some(Duration::from_secs(60)),
            max_connecting: 2,
            load_balanced: false,
        }
    }
}

impl ConnectionPoolSettings {
    pub fn with_max_connections(mut self, value: usize) -> Self {
        self.max_connections = value;
        self
    }

    pub fn with_min_connections(mut self, value: usize) -> Self {
        self.min_connections = value;
        self
    }

    pub fn with_wait_queue_size(mut self, value: usize) -> Self {
        self.wait_queue_size = value;
        self
    }

    pub fn with_wait_queue_timeout(mut self, value: Duration) -> Self {
        self.wait_queue_timeout = value;
        self
    }

    pub fn with_maintenance_interval(mut self, value: Option<Duration>) -> Self {
        self.maintenance_interval = value;
        self
    }

    pub fn with_max_connecting(mut self, value: usize) -> Self {
        self.max_connecting = value;
        self
    }

    pub fn with_load_balanced(mut self, value: bool) -> Self {
        self.load_balanced = value;
        self
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        if self.max_connections == 0 {
            return Err(DriverError::InvalidSettings(
                "max_connections must be greater than zero".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DriverError::InvalidSettings(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_connecting == 0 {
            return Err(DriverError::InvalidSettings(
                "max_connecting must be greater than zero".into(),
            ));
        }
        if self.wait_queue_size == 0 {
            return Err(DriverError::InvalidSettings(
                "wait_queue_size must be greater than zero".into(),
            ));
        }
        if self.maintenance_interval == Some(Duration::ZERO) {
            return Err(DriverError::InvalidSettings(
                "maintenance_interval must be positive; use None to disable".into(),
            ));
        }
        Ok(())
    }
}
