//! Client-side transaction state.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::options::TransactionOptions;
use crate::binding::{ChannelHandle, Server};
use crate::error::DriverError;
use crate::sync::{AtomicState, StateValue};

/// Transaction lifecycle. `Starting` until the first statement goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreTransactionState {
    Starting,
    InProgress,
    Aborted,
    Committed,
}

impl StateValue for CoreTransactionState {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => CoreTransactionState::Starting,
            1 => CoreTransactionState::InProgress,
            2 => CoreTransactionState::Aborted,
            _ => CoreTransactionState::Committed,
        }
    }
}

/// One transaction on a session, with whatever it is pinned to.
pub struct CoreTransaction {
    transaction_number: i64,
    options: TransactionOptions,
    state: AtomicState<CoreTransactionState>,
    statement_id: AtomicI32,
    pinned_server: Mutex<Option<Arc<dyn Server>>>,
    pinned_channel: Mutex<Option<ChannelHandle>>,
    recovery_token: Mutex<Option<serde_json::Value>>,
}

impl CoreTransaction {
    pub fn new(transaction_number: i64, options: TransactionOptions) -> Self {
        Self {
            transaction_number,
            options,
            state: AtomicState::new(CoreTransactionState::Starting),
            statement_id: AtomicI32::new(0),
            pinned_server: Mutex::new(None),
            pinned_channel: Mutex::new(None),
            recovery_token: Mutex::new(None),
        }
    }

    pub fn transaction_number(&self) -> i64 {
        self.transaction_number
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn state(&self) -> CoreTransactionState {
        self.state.get()
    }

    pub fn set_state(&self, state: CoreTransactionState) {
        self.state.try_change_to(state);
    }

    /// True while no statement has been sent.
    pub fn is_empty(&self) -> bool {
        self.statement_id() == 0
    }

    pub fn statement_id(&self) -> i32 {
        self.statement_id.load(Ordering::Acquire)
    }

    /// Record `count` statements sent in this transaction.
    pub fn advance_statement_id(&self, count: i32) {
        self.statement_id.fetch_add(count, Ordering::AcqRel);
        self.state
            .try_change(CoreTransactionState::Starting, CoreTransactionState::InProgress);
    }

    pub fn pinned_server(&self) -> Option<Arc<dyn Server>> {
        self.pinned_server.lock().clone()
    }

    pub fn pin_server(&self, server: Arc<dyn Server>) {
        *self.pinned_server.lock() = Some(server);
    }

    pub fn is_channel_pinned(&self) -> bool {
        self.pinned_channel.lock().is_some()
    }

    /// New share of the pinned channel, if any.
    pub fn fork_pinned_channel(&self) -> Result<Option<ChannelHandle>, DriverError> {
        self.pinned_channel
            .lock()
            .as_ref()
            .map(ChannelHandle::fork)
            .transpose()
    }

    /// Pin `channel`, releasing any previously pinned one.
    pub fn pin_channel(&self, channel: ChannelHandle) {
        let previous = self.pinned_channel.lock().replace(channel);
        if let Some(previous) = previous {
            previous.dispose();
        }
    }

    pub fn recovery_token(&self) -> Option<serde_json::Value> {
        self.recovery_token.lock().clone()
    }

    pub fn set_recovery_token(&self, token: serde_json::Value) {
        *self.recovery_token.lock() = Some(token);
    }

    /// Drop the pinned server and release the pinned channel.
    pub fn unpin_all(&self) {
        let channel = self.pinned_channel.lock().take();
        if let Some(channel) = channel {
            channel.dispose();
        }
        self.pinned_server.lock().take();
    }
}

impl Drop for CoreTransaction {
    fn drop(&mut self) {
        self.unpin_all();
    }
}

impl std::fmt::Debug for CoreTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreTransaction")
            .field("transaction_number", &self.transaction_number)
            .field("state", &self.state())
            .field("statement_id", &self.statement_id())
            .field("channel_pinned", &self.is_channel_pinned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_statement_moves_to_in_progress() {
        let transaction = CoreTransaction::new(1, TransactionOptions::default());
        assert_eq!(transaction.state(), CoreTransactionState::Starting);
        assert!(transaction.is_empty());

        transaction.advance_statement_id(1);
        assert_eq!(transaction.state(), CoreTransactionState::InProgress);
        assert!(!transaction.is_empty());

        transaction.set_state(CoreTransactionState::Committed);
        transaction.advance_statement_id(1);
        assert_eq!(transaction.state(), CoreTransactionState::Committed);
    }

    #[test]
    fn test_recovery_token_round_trip() {
        let transaction = CoreTransaction::new(7, TransactionOptions::default());
        assert!(transaction.recovery_token().is_none());
        transaction.set_recovery_token(serde_json::json!({"shard": "s1"}));
        assert_eq!(transaction.recovery_token(), Some(serde_json::json!({"shard": "s1"})));
        assert!(transaction.fork_pinned_channel().unwrap().is_none());
    }
}
