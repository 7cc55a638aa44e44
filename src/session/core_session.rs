//! Logical client session: clocks, the current transaction and the
//! commit/abort retry policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn, Instrument, Span};
use uuid::Uuid;

use super::clock::{ClusterClock, ClusterTime, OperationClock, Timestamp};
use super::handle::{CoreSessionHandle, NonDisposingCoreSessionHandle};
use super::options::{Acknowledgement, CoreSessionOptions, TransactionOptions, WriteConcern};
use super::server_session::{ServerSession, ServerSessionLease, ServerSessionPool};
use super::transaction::{CoreTransaction, CoreTransactionState};
use crate::binding::{
    ChannelPinningHelper, Cluster, ClusterType, ReadBinding, ReadWriteBinding,
    ReadWriteBindingHandle, ServerState,
};
use crate::connection::ServerType;
use crate::error::{DriverError, UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL};
use crate::sync::OperationContext;
use crate::telemetry::{SpanExt, TransactionSpan};

/// Lowest wire version that supports replica set transactions.
const TRANSACTIONS_WIRE_VERSION: i32 = 7;
/// Lowest wire version that supports sharded transactions.
const SHARDED_TRANSACTIONS_WIRE_VERSION: i32 = 8;
/// `wtimeout` applied to commit retries when none is configured.
const COMMIT_RETRY_W_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndTransactionKind {
    Commit,
    Abort,
}

impl EndTransactionKind {
    pub fn command_name(&self) -> &'static str {
        match self {
            EndTransactionKind::Commit => "commitTransaction",
            EndTransactionKind::Abort => "abortTransaction",
        }
    }
}

/// A `commitTransaction` or `abortTransaction` ready to run on the primary.
#[derive(Debug, Clone, PartialEq)]
pub struct EndTransactionCommand {
    pub kind: EndTransactionKind,
    pub session_id: Uuid,
    pub transaction_number: i64,
    pub write_concern: WriteConcern,
    pub recovery_token: Option<serde_json::Value>,
    pub max_commit_time: Option<Duration>,
}

/// Runs end-transaction commands over a binding.
///
/// Implemented by the operation layer, which owns the wire encoding.
#[async_trait]
pub trait EndTransactionExecutor: Send + Sync {
    fn execute(
        &self,
        command: &EndTransactionCommand,
        binding: &dyn ReadWriteBinding,
        ctx: &OperationContext,
    ) -> Result<(), DriverError>;

    async fn execute_async(
        &self,
        command: &EndTransactionCommand,
        binding: &dyn ReadWriteBinding,
        ctx: &OperationContext,
    ) -> Result<(), DriverError>;
}

/// A logical session.
///
/// Always lives in an `Arc`; handles share it and the last one to go
/// disposes it.
pub struct CoreSession {
    me: Weak<CoreSession>,
    cluster: Arc<dyn Cluster>,
    executor: Arc<dyn EndTransactionExecutor>,
    options: CoreSessionOptions,
    server_session: ServerSessionLease,
    cluster_clock: ClusterClock,
    operation_clock: OperationClock,
    current_transaction: Mutex<Option<Arc<CoreTransaction>>>,
    commit_in_progress: AtomicBool,
    snapshot_time: Mutex<Option<Timestamp>>,
    disposed: AtomicBool,
}

impl CoreSession {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        executor: Arc<dyn EndTransactionExecutor>,
        server_session: ServerSessionLease,
        options: CoreSessionOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cluster,
            executor,
            options,
            server_session,
            cluster_clock: ClusterClock::new(),
            operation_clock: OperationClock::new(),
            current_transaction: Mutex::new(None),
            commit_in_progress: AtomicBool::new(false),
            snapshot_time: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Start a session on a pooled server session and return its first handle.
    pub fn start(
        cluster: Arc<dyn Cluster>,
        executor: Arc<dyn EndTransactionExecutor>,
        pool: &Arc<ServerSessionPool>,
        options: CoreSessionOptions,
    ) -> CoreSessionHandle {
        let session = Self::new(cluster, executor, pool.acquire_session(), options);
        debug!(session_id = %session.id(), implicit = session.is_implicit(), "Session started");
        CoreSessionHandle::new(session)
    }

    pub fn id(&self) -> Uuid {
        self.server_session.session().id()
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn options(&self) -> &CoreSessionOptions {
        &self.options
    }

    pub fn server_session(&self) -> &Arc<ServerSession> {
        self.server_session.session()
    }

    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.cluster_clock.cluster_time()
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_clock.operation_time()
    }

    pub fn snapshot_time(&self) -> Option<Timestamp> {
        *self.snapshot_time.lock()
    }

    pub fn current_transaction(&self) -> Option<Arc<CoreTransaction>> {
        self.current_transaction.lock().clone()
    }

    pub fn is_causally_consistent(&self) -> bool {
        self.options.is_causally_consistent
    }

    pub fn is_implicit(&self) -> bool {
        self.options.is_implicit
    }

    pub fn is_snapshot(&self) -> bool {
        self.options.is_snapshot
    }

    pub fn is_dirty(&self) -> bool {
        self.server_session().is_dirty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// A committed transaction counts as active again while its commit is
    /// being retried.
    pub fn is_in_transaction(&self) -> bool {
        match self.current_transaction().map(|t| t.state()) {
            Some(CoreTransactionState::Aborted) | None => false,
            Some(CoreTransactionState::Committed) => self.commit_in_progress.load(Ordering::Acquire),
            Some(_) => true,
        }
    }

    pub fn advance_cluster_time(&self, new_cluster_time: &ClusterTime) {
        self.cluster_clock.advance(new_cluster_time);
    }

    pub fn advance_operation_time(&self, new_operation_time: Timestamp) {
        self.operation_clock.advance(new_operation_time);
    }

    pub fn advance_transaction_number(&self) -> i64 {
        self.server_session().advance_transaction_number()
    }

    pub fn mark_dirty(&self) {
        self.server_session().mark_dirty();
    }

    pub fn was_used(&self) {
        self.server_session().was_used();
    }

    /// Snapshot sessions keep the first timestamp they are given.
    pub fn set_snapshot_time_if_needed(&self, snapshot_time: Timestamp) {
        if self.is_snapshot() {
            self.snapshot_time.lock().get_or_insert(snapshot_time);
        }
    }

    /// Called before every command sent on this session. Drops finished
    /// transactions so the command runs outside them.
    pub fn about_to_send_command(&self) {
        let mut current = self.current_transaction.lock();
        let Some(transaction) = current.as_ref() else {
            return;
        };
        match transaction.state() {
            CoreTransactionState::Starting | CoreTransactionState::InProgress => {}
            CoreTransactionState::Aborted => {
                *current = None;
            }
            CoreTransactionState::Committed => {
                if !self.commit_in_progress.load(Ordering::Acquire) {
                    transaction.unpin_all();
                    *current = None;
                }
            }
        }
    }

    pub fn start_transaction(&self, options: Option<TransactionOptions>) -> Result<(), DriverError> {
        self.throw_if_disposed()?;
        self.ensure_start_transaction_can_be_called()?;

        let transaction_number = self.advance_transaction_number();
        let effective = TransactionOptions::effective(
            options.as_ref(),
            self.options.default_transaction_options.as_ref(),
        );
        if !effective
            .write_concern
            .as_ref()
            .map_or(true, WriteConcern::is_acknowledged)
        {
            return Err(DriverError::InvalidOperation(
                "Transactions do not support unacknowledged write concerns.".into(),
            ));
        }

        let transaction = Arc::new(CoreTransaction::new(transaction_number, effective));
        let previous = self.current_transaction.lock().replace(transaction);
        if let Some(previous) = previous {
            previous.unpin_all();
        }
        debug!(session_id = %self.id(), transaction_number, "Transaction started");
        Ok(())
    }

    pub fn commit_transaction(&self, ctx: &OperationContext) -> Result<(), DriverError> {
        let transaction = self.ensure_commit_can_be_called("commit_transaction")?;
        let span = self.transaction_span(EndTransactionKind::Commit, &transaction);

        self.commit_in_progress.store(true, Ordering::Release);
        let result = span.in_scope(|| self.run_commit(&transaction, ctx));
        self.commit_in_progress.store(false, Ordering::Release);
        transaction.set_state(CoreTransactionState::Committed);

        span.record_result(&result);
        result
    }

    pub async fn commit_transaction_async(&self, ctx: &OperationContext) -> Result<(), DriverError> {
        let transaction = self.ensure_commit_can_be_called("commit_transaction_async")?;
        let span = self.transaction_span(EndTransactionKind::Commit, &transaction);

        self.commit_in_progress.store(true, Ordering::Release);
        let result = self
            .run_commit_async(&transaction, ctx)
            .instrument(span.clone())
            .await;
        self.commit_in_progress.store(false, Ordering::Release);
        transaction.set_state(CoreTransactionState::Committed);

        span.record_result(&result);
        result
    }

    /// Best effort: failures are logged and swallowed. The transaction ends up
    /// aborted and unpinned either way.
    pub fn abort_transaction(&self, ctx: &OperationContext) -> Result<(), DriverError> {
        let transaction = self.ensure_abort_can_be_called("abort_transaction")?;
        let span = self.transaction_span(EndTransactionKind::Abort, &transaction);

        span.in_scope(|| self.run_abort(&transaction, ctx));
        transaction.set_state(CoreTransactionState::Aborted);
        transaction.unpin_all();

        span.record("status", "ok");
        Ok(())
    }

    pub async fn abort_transaction_async(&self, ctx: &OperationContext) -> Result<(), DriverError> {
        let transaction = self.ensure_abort_can_be_called("abort_transaction_async")?;
        let span = self.transaction_span(EndTransactionKind::Abort, &transaction);

        self.run_abort_async(&transaction, ctx)
            .instrument(span.clone())
            .await;
        transaction.set_state(CoreTransactionState::Aborted);
        transaction.unpin_all();

        span.record("status", "ok");
        Ok(())
    }

    /// Abort any running transaction and give the server session back.
    /// Repeated calls are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(transaction) = self.current_transaction() {
            if matches!(
                transaction.state(),
                CoreTransactionState::Starting | CoreTransactionState::InProgress
            ) {
                let _ = self.abort_transaction(&OperationContext::infinite());
            }
            transaction.unpin_all();
        }

        self.server_session.release();
        debug!(session_id = %self.id(), "Session disposed");
    }

    fn run_commit(&self, transaction: &CoreTransaction, ctx: &OperationContext) -> Result<(), DriverError> {
        if transaction.is_empty() {
            return Ok(());
        }

        let is_retry = transaction.state() == CoreTransactionState::Committed;
        let first = self.commit_command(transaction, ctx, is_retry);
        match self.execute_end_transaction(&first, ctx) {
            Ok(()) => {
                Span::current().record("attempts", 1);
                return Ok(());
            }
            Err(err) => {
                let err = label_commit_error(err);
                if !should_retry_end_transaction(&err, ctx) {
                    return Err(err);
                }
                unpin_if_commit_result_unknown(transaction, &err);
                debug!(error = %err, "Retrying commitTransaction");
            }
        }

        Span::current().record("attempts", 2);
        let second = self.commit_command(transaction, ctx, true);
        self.execute_end_transaction(&second, ctx)
            .map_err(label_commit_error)
    }

    async fn run_commit_async(
        &self,
        transaction: &CoreTransaction,
        ctx: &OperationContext,
    ) -> Result<(), DriverError> {
        if transaction.is_empty() {
            return Ok(());
        }

        let is_retry = transaction.state() == CoreTransactionState::Committed;
        let first = self.commit_command(transaction, ctx, is_retry);
        match self.execute_end_transaction_async(&first, ctx).await {
            Ok(()) => {
                Span::current().record("attempts", 1);
                return Ok(());
            }
            Err(err) => {
                let err = label_commit_error(err);
                if !should_retry_end_transaction(&err, ctx) {
                    return Err(err);
                }
                unpin_if_commit_result_unknown(transaction, &err);
                debug!(error = %err, "Retrying commitTransaction");
            }
        }

        Span::current().record("attempts", 2);
        let second = self.commit_command(transaction, ctx, true);
        self.execute_end_transaction_async(&second, ctx)
            .await
            .map_err(label_commit_error)
    }

    fn run_abort(&self, transaction: &CoreTransaction, ctx: &OperationContext) {
        if transaction.is_empty() {
            return;
        }

        let first = self.abort_command(transaction, ctx);
        match self.execute_end_transaction(&first, ctx) {
            Ok(()) => {
                Span::current().record("attempts", 1);
                return;
            }
            Err(err) if should_retry_end_transaction(&err, ctx) => {
                transaction.unpin_all();
                debug!(error = %err, "Retrying abortTransaction");
            }
            Err(err) => {
                warn!(error = %err, "abortTransaction failed, ignoring");
                return;
            }
        }

        Span::current().record("attempts", 2);
        let second = self.abort_command(transaction, ctx);
        if let Err(err) = self.execute_end_transaction(&second, ctx) {
            warn!(error = %err, "abortTransaction retry failed, ignoring");
        }
    }

    async fn run_abort_async(&self, transaction: &CoreTransaction, ctx: &OperationContext) {
        if transaction.is_empty() {
            return;
        }

        let first = self.abort_command(transaction, ctx);
        match self.execute_end_transaction_async(&first, ctx).await {
            Ok(()) => {
                Span::current().record("attempts", 1);
                return;
            }
            Err(err) if should_retry_end_transaction(&err, ctx) => {
                transaction.unpin_all();
                debug!(error = %err, "Retrying abortTransaction");
            }
            Err(err) => {
                warn!(error = %err, "abortTransaction failed, ignoring");
                return;
            }
        }

        Span::current().record("attempts", 2);
        let second = self.abort_command(transaction, ctx);
        if let Err(err) = self.execute_end_transaction_async(&second, ctx).await {
            warn!(error = %err, "abortTransaction retry failed, ignoring");
        }
    }

    fn execute_end_transaction(
        &self,
        command: &EndTransactionCommand,
        ctx: &OperationContext,
    ) -> Result<(), DriverError> {
        let binding = self.end_transaction_binding()?;
        let result = self.executor.execute(command, &binding, ctx);
        binding.dispose();
        result
    }

    async fn execute_end_transaction_async(
        &self,
        command: &EndTransactionCommand,
        ctx: &OperationContext,
    ) -> Result<(), DriverError> {
        let binding = self.end_transaction_binding()?;
        let result = self.executor.execute_async(command, &binding, ctx).await;
        binding.dispose();
        result
    }

    /// Binding on the transaction's primary. The session handle it carries
    /// does not dispose this session.
    fn end_transaction_binding(&self) -> Result<ReadWriteBindingHandle, DriverError> {
        let session = self
            .me
            .upgrade()
            .ok_or(DriverError::ObjectDisposed("CoreSession"))?;
        let handle = NonDisposingCoreSessionHandle::new(session);
        ChannelPinningHelper::create_read_write_binding(&self.cluster, &handle)
    }

    fn commit_command(
        &self,
        transaction: &CoreTransaction,
        ctx: &OperationContext,
        is_retry: bool,
    ) -> EndTransactionCommand {
        let mut write_concern = self.transaction_write_concern(transaction, ctx);
        if is_retry {
            write_concern = write_concern.with_w(Acknowledgement::Majority);
            if write_concern.w_timeout.is_none() && ctx.deadline().is_none() {
                write_concern.w_timeout = Some(COMMIT_RETRY_W_TIMEOUT);
            }
        }
        EndTransactionCommand {
            kind: EndTransactionKind::Commit,
            session_id: self.id(),
            transaction_number: transaction.transaction_number(),
            write_concern,
            recovery_token: transaction.recovery_token(),
            max_commit_time: transaction.options().max_commit_time,
        }
    }

    fn abort_command(&self, transaction: &CoreTransaction, ctx: &OperationContext) -> EndTransactionCommand {
        EndTransactionCommand {
            kind: EndTransactionKind::Abort,
            session_id: self.id(),
            transaction_number: transaction.transaction_number(),
            write_concern: self.transaction_write_concern(transaction, ctx),
            recovery_token: transaction.recovery_token(),
            max_commit_time: None,
        }
    }

    /// A context deadline replaces any `wtimeout`.
    fn transaction_write_concern(&self, transaction: &CoreTransaction, ctx: &OperationContext) -> WriteConcern {
        let write_concern = transaction
            .options()
            .write_concern
            .clone()
            .or_else(|| {
                self.options
                    .default_transaction_options
                    .as_ref()
                    .and_then(|o| o.write_concern.clone())
            })
            .unwrap_or_else(WriteConcern::majority);
        if ctx.deadline().is_some() {
            write_concern.with_w_timeout(None)
        } else {
            write_concern
        }
    }

    fn transaction_span(&self, kind: EndTransactionKind, transaction: &CoreTransaction) -> Span {
        TransactionSpan::new(
            kind.command_name(),
            &self.id().to_string(),
            transaction.transaction_number(),
        )
    }

    fn ensure_abort_can_be_called(&self, method: &str) -> Result<Arc<CoreTransaction>, DriverError> {
        let transaction = self.current_transaction().ok_or_else(|| {
            DriverError::InvalidOperation(format!("{method} cannot be called when no transaction started."))
        })?;
        match transaction.state() {
            CoreTransactionState::Starting | CoreTransactionState::InProgress => Ok(transaction),
            CoreTransactionState::Aborted => Err(DriverError::InvalidOperation(format!(
                "Cannot call {method} twice."
            ))),
            CoreTransactionState::Committed => Err(DriverError::InvalidOperation(format!(
                "Cannot call {method} after calling commit_transaction."
            ))),
        }
    }

    fn ensure_commit_can_be_called(&self, method: &str) -> Result<Arc<CoreTransaction>, DriverError> {
        let transaction = self.current_transaction().ok_or_else(|| {
            DriverError::InvalidOperation(format!("{method} cannot be called when no transaction started."))
        })?;
        match transaction.state() {
            CoreTransactionState::Aborted => Err(DriverError::InvalidOperation(format!(
                "Cannot call {method} after calling abort_transaction."
            ))),
            _ => Ok(transaction),
        }
    }

    fn ensure_start_transaction_can_be_called(&self) -> Result<(), DriverError> {
        if self.is_snapshot() {
            return Err(DriverError::NotSupported(
                "Transactions are not supported in snapshot sessions.".into(),
            ));
        }
        match self.current_transaction().map(|t| t.state()) {
            None => self.ensure_transactions_are_supported(),
            Some(CoreTransactionState::Aborted | CoreTransactionState::Committed) => Ok(()),
            Some(_) => Err(DriverError::InvalidOperation("Transaction already in progress.".into())),
        }
    }

    fn ensure_transactions_are_supported(&self) -> Result<(), DriverError> {
        let description = self.cluster.description();
        if description.cluster_type == ClusterType::LoadBalanced {
            return Ok(());
        }

        let connected = description
            .servers
            .iter()
            .filter(|s| s.state == ServerState::Connected && s.is_data_bearing());
        for server in connected {
            match server.server_type {
                ServerType::Standalone => {
                    return Err(DriverError::NotSupported(
                        "Standalone servers do not support transactions.".into(),
                    ));
                }
                ServerType::LoadBalanced => {}
                ServerType::ShardRouter if server.max_wire_version < SHARDED_TRANSACTIONS_WIRE_VERSION => {
                    return Err(DriverError::NotSupported(format!(
                        "Server at {} does not support sharded transactions (max wire version {}).",
                        server.server_id.endpoint, server.max_wire_version
                    )));
                }
                ServerType::ShardRouter => {}
                _ if server.max_wire_version < TRANSACTIONS_WIRE_VERSION => {
                    return Err(DriverError::NotSupported(format!(
                        "Server at {} does not support transactions (max wire version {}).",
                        server.server_id.endpoint, server.max_wire_version
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn throw_if_disposed(&self) -> Result<(), DriverError> {
        if self.is_disposed() {
            Err(DriverError::ObjectDisposed("CoreSession"))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CoreSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreSession")
            .field("id", &self.id())
            .field("implicit", &self.is_implicit())
            .field("in_transaction", &self.is_in_transaction())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Retry once, unless the context has already run out.
fn should_retry_end_transaction(err: &DriverError, ctx: &OperationContext) -> bool {
    err.is_retryable_end_transaction_error() && !(ctx.deadline().is_some() && ctx.is_timed_out())
}

/// Commit failures whose outcome is unknown carry the matching label.
fn label_commit_error(mut err: DriverError) -> DriverError {
    if err.is_retryable_end_transaction_error() || err.is_timeout() {
        err.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL);
    }
    err
}

fn unpin_if_commit_result_unknown(transaction: &CoreTransaction, err: &DriverError) {
    if err.is_network_error() || err.has_error_label(UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL) {
        transaction.unpin_all();
    }
}
