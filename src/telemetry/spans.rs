//! Span helpers for checkout and transaction tracing.

use tracing::{debug_span, info_span, Span};

use crate::connection::ServerId;

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Span around one connection checkout.
pub struct CheckoutSpan;

impl CheckoutSpan {
    /// Fields:
    /// - `server`: the pool's server id
    /// - `status`: filled in by `SpanExt::record_result`
    /// - `error.message`: filled in on error
    pub fn new(server_id: &ServerId) -> Span {
        debug_span!(
            "connection_checkout",
            server = %server_id,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}

/// Span around a commit or abort.
pub struct TransactionSpan;

impl TransactionSpan {
    pub fn new(command: &'static str, session_id: &str, transaction_number: i64) -> Span {
        info_span!(
            "end_transaction",
            command = command,
            session_id = %session_id,
            txn_number = transaction_number,
            attempts = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClusterId, EndPoint};

    #[test]
    fn test_record_result_on_disabled_span_is_harmless() {
        let server_id = ServerId::new(ClusterId(1), EndPoint::new("db", 27017));
        let span = CheckoutSpan::new(&server_id);
        span.record_result::<(), String>(&Err("boom".into()));
        span.record_result::<(), String>(&Ok(()));

        let span = TransactionSpan::new("commitTransaction", "abc", 3);
        span.record("attempts", 2);
        span.record_result::<(), String>(&Ok(()));
    }
}
