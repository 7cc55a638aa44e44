//! Checkout reasons used to explain pool exhaustion.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Why a connection stays checked out beyond a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckOutReason {
    Cursor,
    Transaction,
}

impl CheckOutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cursor => "cursor",
            Self::Transaction => "transaction",
        }
    }
}

/// Live count of tagged checkouts.
#[derive(Debug, Default)]
pub struct CheckOutReasonCounter {
    cursor: AtomicUsize,
    transaction: AtomicUsize,
}

impl CheckOutReasonCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, reason: CheckOutReason) -> usize {
        self.slot(reason).load(Ordering::Acquire)
    }

    pub fn increment(&self, reason: CheckOutReason) {
        self.slot(reason).fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self, reason: CheckOutReason) {
        let _ = self
            .slot(reason)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn slot(&self, reason: CheckOutReason) -> &AtomicUsize {
        match reason {
            CheckOutReason::Cursor => &self.cursor,
            CheckOutReason::Transaction => &self.transaction,
        }
    }
}

/// Message for a checkout timeout.
///
/// When any checkout is tagged, the message breaks the used connections
/// down by reason so that leaked cursors or transactions are visible.
pub(crate) fn timeout_message(
    base: String,
    elapsed_ms: u128,
    counter: &CheckOutReasonCounter,
    max_connections: usize,
    available: usize,
) -> String {
    let cursors = counter.count(CheckOutReason::Cursor);
    let transactions = counter.count(CheckOutReason::Transaction);
    if cursors == 0 && transactions == 0 {
        return base;
    }

    let checked_out = max_connections.saturating_sub(available);
    let other = checked_out.saturating_sub(cursors + transactions);
    format!(
        "Timed out after {elapsed_ms}ms waiting for a connection from the connection pool. \
         maxPoolSize: {max_connections}, \
         connections in use by cursors: {cursors}, \
         connections in use by transactions: {transactions}, \
         connections in use by other operations: {other}."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_never_goes_negative() {
        let counter = CheckOutReasonCounter::new();
        counter.decrement(CheckOutReason::Cursor);
        assert_eq!(counter.count(CheckOutReason::Cursor), 0);

        counter.increment(CheckOutReason::Transaction);
        assert_eq!(counter.count(CheckOutReason::Transaction), 1);
        assert_eq!(counter.count(CheckOutReason::Cursor), 0);
    }

    #[test]
    fn test_plain_message_without_tagged_checkouts() {
        let counter = CheckOutReasonCounter::new();
        let message = timeout_message("plain".into(), 5, &counter, 10, 0);
        assert_eq!(message, "plain");
    }

    #[test]
    fn test_expanded_message_lists_reasons() {
        let counter = CheckOutReasonCounter::new();
        counter.increment(CheckOutReason::Cursor);
        counter.increment(CheckOutReason::Transaction);
        counter.increment(CheckOutReason::Transaction);

        let message = timeout_message("plain".into(), 12, &counter, 5, 0);
        assert!(message.starts_with("Timed out after 12ms"));
        assert!(message.contains("maxPoolSize: 5"));
        assert!(message.contains("connections in use by cursors: 1"));
        assert!(message.contains("connections in use by transactions: 2"));
        assert!(message.contains("connections in use by other operations: 2."));
    }
}
