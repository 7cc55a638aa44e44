//! Telemetry: structured logging, tracing spans and pool metrics.

mod logging;
mod metrics;
mod spans;
mod store;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    MetricsListener, CHECKOUTS_TOTAL, CHECKOUT_DURATION_MS, CHECKOUT_FAILURES_TOTAL,
    CONNECTIONS_CHECKED_OUT, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_CREATED_TOTAL,
    CONNECTION_OPEN_DURATION_MS, POOL_CLEARS_TOTAL,
};
pub use spans::{CheckoutSpan, SpanExt, TransactionSpan};
pub use store::{HistogramSummary, MetricsSnapshot, MetricsStore};
