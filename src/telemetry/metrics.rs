//! Pool metrics recorded through the `metrics` facade.

use std::sync::Arc;

use metrics::{counter, gauge, histogram};

use super::store::{MetricsSnapshot, MetricsStore};
use crate::pool::{PoolEvent, PoolEventListener};

pub const CHECKOUTS_TOTAL: &str = "docdb_pool_checkouts_total";
pub const CHECKOUT_FAILURES_TOTAL: &str = "docdb_pool_checkout_failures_total";
pub const CHECKOUT_DURATION_MS: &str = "docdb_pool_checkout_duration_ms";
pub const CONNECTIONS_CREATED_TOTAL: &str = "docdb_pool_connections_created_total";
pub const CONNECTIONS_CLOSED_TOTAL: &str = "docdb_pool_connections_closed_total";
pub const CONNECTIONS_CHECKED_OUT: &str = "docdb_pool_connections_checked_out";
pub const POOL_CLEARS_TOTAL: &str = "docdb_pool_clears_total";
pub const CONNECTION_OPEN_DURATION_MS: &str = "docdb_pool_connection_open_duration_ms";

/// Pool listener that records counters, gauges and latencies.
///
/// Every observation goes to the `metrics` facade and to a local
/// [`MetricsStore`] so it can be read back without a recorder.
#[derive(Default)]
pub struct MetricsListener {
    store: Arc<MetricsStore>,
}

impl MetricsListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<MetricsStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.store.snapshot()
    }

    fn count(&self, name: &'static str) {
        counter!(name).increment(1);
        self.store.increment_counter(name, 1);
    }

    fn observe_ms(&self, name: &'static str, millis: f64) {
        histogram!(name).record(millis);
        self.store.record_histogram(name, millis);
    }

    fn adjust(&self, name: &'static str, delta: f64) {
        gauge!(name).increment(delta);
        self.store.add_gauge(name, delta);
    }
}

impl PoolEventListener for MetricsListener {
    fn on_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::CheckedOut { duration, .. } => {
                self.count(CHECKOUTS_TOTAL);
                self.adjust(CONNECTIONS_CHECKED_OUT, 1.0);
                self.observe_ms(CHECKOUT_DURATION_MS, duration.as_secs_f64() * 1000.0);
            }
            PoolEvent::CheckOutFailed { reason, .. } => {
                counter!(CHECKOUT_FAILURES_TOTAL, "reason" => reason.as_str()).increment(1);
                self.store.increment_counter(CHECKOUT_FAILURES_TOTAL, 1);
            }
            PoolEvent::CheckedIn { .. } => {
                self.adjust(CONNECTIONS_CHECKED_OUT, -1.0);
            }
            PoolEvent::Added { .. } => self.count(CONNECTIONS_CREATED_TOTAL),
            PoolEvent::Removed { .. } => self.count(CONNECTIONS_CLOSED_TOTAL),
            PoolEvent::Cleared { .. } => self.count(POOL_CLEARS_TOTAL),
            PoolEvent::ConnectionOpened { duration, .. } => {
                self.observe_ms(CONNECTION_OPEN_DURATION_MS, duration.as_secs_f64() * 1000.0);
            }
            _ => {}
        }
    }
}
