//! Sessions, transactions and the server session pool.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cluster_of, command_error, pooled_server, quiet_settings, server_id, RecordingExecutor};
use docdb_core::binding::{Cluster, ClusterType, PooledServer, ServerDescription, StaticCluster};
use docdb_core::connection::ServerType;
use docdb_core::error::{DriverError, UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL};
use docdb_core::session::{
    Acknowledgement, ClusterTime, CoreSession, CoreSessionHandle, CoreSessionOptions,
    CoreTransactionState, EndTransactionExecutor, EndTransactionKind, ServerSessionPool,
    SessionHandle, SessionPoolSettings, Timestamp, TransactionOptions, WriteConcern,
};
use docdb_core::sync::OperationContext;

struct Fixture {
    cluster: Arc<StaticCluster>,
    server: Arc<PooledServer>,
    executor: Arc<RecordingExecutor>,
    sessions: Arc<ServerSessionPool>,
}

impl Fixture {
    fn new(cluster_type: ClusterType, server_type: ServerType) -> Self {
        let (server, _factory) = pooled_server(27017, server_type, quiet_settings());
        let cluster = cluster_of(cluster_type, vec![Arc::clone(&server)]);
        let sessions = ServerSessionPool::new(
            Arc::clone(&cluster) as Arc<dyn Cluster>,
            SessionPoolSettings::default(),
        );
        Self {
            cluster,
            server,
            executor: Arc::new(RecordingExecutor::new()),
            sessions,
        }
    }

    fn replica_set() -> Self {
        Self::new(ClusterType::ReplicaSet, ServerType::ReplicaSetPrimary)
    }

    fn start(&self, options: CoreSessionOptions) -> CoreSessionHandle {
        CoreSession::start(
            Arc::clone(&self.cluster) as Arc<dyn Cluster>,
            Arc::clone(&self.executor) as Arc<dyn EndTransactionExecutor>,
            &self.sessions,
            options,
        )
    }
}

fn session_of(handle: &CoreSessionHandle) -> Arc<CoreSession> {
    Arc::clone(handle.session().unwrap())
}

/// Start a transaction and pretend one statement ran in it.
fn start_used_transaction(session: &CoreSession, options: Option<TransactionOptions>) {
    session.start_transaction(options).unwrap();
    session.current_transaction().unwrap().advance_statement_id(1);
}

fn ctx() -> OperationContext {
    OperationContext::infinite()
}

#[test]
fn test_abort_of_unused_transaction_sends_nothing() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    session.start_transaction(None).unwrap();
    let transaction = session.current_transaction().unwrap();
    assert_eq!(transaction.state(), CoreTransactionState::Starting);

    session.abort_transaction(&ctx()).unwrap();
    assert_eq!(fixture.executor.count(), 0);
    assert_eq!(transaction.state(), CoreTransactionState::Aborted);
    assert!(!session.is_in_transaction());
}

#[test]
fn test_commit_of_unused_transaction_sends_nothing() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    session.start_transaction(None).unwrap();
    session.commit_transaction(&ctx()).unwrap();
    assert_eq!(fixture.executor.count(), 0);
    assert_eq!(
        session.current_transaction().unwrap().state(),
        CoreTransactionState::Committed
    );
}

#[test]
fn test_first_statement_moves_transaction_in_progress() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    let transaction = session.current_transaction().unwrap();
    assert_eq!(transaction.state(), CoreTransactionState::InProgress);
    assert!(!transaction.is_empty());
    assert!(session.is_in_transaction());
}

#[test]
fn test_commit_sends_command_with_transaction_details() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    let options = TransactionOptions::default().with_max_commit_time(Duration::from_secs(2));
    start_used_transaction(&session, Some(options));
    session
        .current_transaction()
        .unwrap()
        .set_recovery_token(serde_json::json!({"shard": "rs1"}));
    session.commit_transaction(&ctx()).unwrap();

    let commands = fixture.executor.commands();
    assert_eq!(commands.len(), 1);
    let command = &commands[0];
    assert_eq!(command.kind, EndTransactionKind::Commit);
    assert_eq!(command.session_id, session.id());
    assert_eq!(command.transaction_number, 1);
    assert_eq!(command.max_commit_time, Some(Duration::from_secs(2)));
    assert_eq!(command.recovery_token, Some(serde_json::json!({"shard": "rs1"})));
    assert_eq!(command.write_concern, WriteConcern::majority());
}

#[test]
fn test_commit_retries_once_with_majority_write_concern() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);
    let options = TransactionOptions::default().with_write_concern(WriteConcern::default().with_w(Acknowledgement::Nodes(1)));

    start_used_transaction(&session, Some(options));
    fixture.executor.fail_with([command_error(91, &[])]);
    session.commit_transaction(&ctx()).unwrap();

    let commands = fixture.executor.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].write_concern.w, Some(Acknowledgement::Nodes(1)));
    assert_eq!(commands[1].write_concern.w, Some(Acknowledgement::Majority));
    assert_eq!(commands[1].write_concern.w_timeout, Some(Duration::from_secs(10)));
}

#[test]
fn test_commit_propagates_second_failure_with_unknown_result_label() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    fixture
        .executor
        .fail_with([command_error(189, &[]), command_error(189, &[])]);
    let err = session.commit_transaction(&ctx()).unwrap_err();

    assert_eq!(fixture.executor.count(), 2);
    assert!(err.has_error_label(UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL));
    assert!(!session.is_in_transaction());
}

#[test]
fn test_commit_does_not_retry_non_retryable_errors() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    fixture.executor.fail_with([command_error(11000, &[])]);
    let err = session.commit_transaction(&ctx()).unwrap_err();

    assert_eq!(fixture.executor.count(), 1);
    assert!(matches!(err, DriverError::Command { code: 11000, .. }));
    assert!(!err.has_error_label(UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL));
}

#[test]
fn test_commit_retries_on_retryable_write_label() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    fixture
        .executor
        .fail_with([command_error(50, &["RetryableWriteError"])]);
    session.commit_transaction(&ctx()).unwrap();
    assert_eq!(fixture.executor.count(), 2);
}

#[test]
fn test_commit_after_commit_is_a_retry() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    session.commit_transaction(&ctx()).unwrap();
    session.commit_transaction(&ctx()).unwrap();

    let commands = fixture.executor.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].write_concern.w_timeout, None);
    assert_eq!(commands[1].write_concern.w, Some(Acknowledgement::Majority));
    assert_eq!(commands[1].write_concern.w_timeout, Some(Duration::from_secs(10)));
    assert_eq!(commands[1].transaction_number, commands[0].transaction_number);
}

#[test]
fn test_deadline_replaces_w_timeout() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);
    let write_concern = WriteConcern::majority().with_w_timeout(Some(Duration::from_secs(3)));

    start_used_transaction(&session, Some(TransactionOptions::default().with_write_concern(write_concern)));
    fixture.executor.fail_with([command_error(91, &[])]);
    session
        .commit_transaction(&OperationContext::with_timeout(Duration::from_secs(30)))
        .unwrap();

    let commands = fixture.executor.commands();
    assert_eq!(commands[0].write_concern.w_timeout, None);
    assert_eq!(commands[1].write_concern.w_timeout, None);
}

#[test]
fn test_abort_swallows_errors() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    fixture.executor.fail_with([command_error(11000, &[])]);
    session.abort_transaction(&ctx()).unwrap();

    assert_eq!(fixture.executor.count(), 1);
    assert_eq!(
        session.current_transaction().unwrap().state(),
        CoreTransactionState::Aborted
    );
}

#[test]
fn test_abort_retries_once_on_retryable_error() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    fixture.executor.fail_with([
        DriverError::connection("reset"),
        DriverError::connection("reset"),
        DriverError::connection("reset"),
    ]);
    session.abort_transaction(&ctx()).unwrap();

    let commands = fixture.executor.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands.iter().all(|c| c.kind == EndTransactionKind::Abort));
}

#[test]
fn test_end_transaction_call_order_is_enforced() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    assert!(matches!(
        session.commit_transaction(&ctx()),
        Err(DriverError::InvalidOperation(_))
    ));
    assert!(matches!(
        session.abort_transaction(&ctx()),
        Err(DriverError::InvalidOperation(_))
    ));

    start_used_transaction(&session, None);
    session.abort_transaction(&ctx()).unwrap();
    assert!(session.abort_transaction(&ctx()).is_err());
    assert!(session.commit_transaction(&ctx()).is_err());

    start_used_transaction(&session, None);
    session.commit_transaction(&ctx()).unwrap();
    assert!(session.abort_transaction(&ctx()).is_err());
}

#[test]
fn test_start_transaction_twice_fails() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    session.start_transaction(None).unwrap();
    let err = session.start_transaction(None).unwrap_err();
    assert!(matches!(err, DriverError::InvalidOperation(_)));
}

#[test]
fn test_transaction_numbers_increase() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    session.commit_transaction(&ctx()).unwrap();
    start_used_transaction(&session, None);
    session.abort_transaction(&ctx()).unwrap();
    session.start_transaction(None).unwrap();

    assert_eq!(session.current_transaction().unwrap().transaction_number(), 3);
    let numbers: Vec<_> = fixture
        .executor
        .commands()
        .iter()
        .map(|c| c.transaction_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[test]
fn test_snapshot_sessions_reject_transactions() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::snapshot());
    let session = session_of(&handle);

    assert!(matches!(
        session.start_transaction(None),
        Err(DriverError::NotSupported(_))
    ));
}

#[test]
fn test_unacknowledged_write_concern_is_rejected() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    let options = TransactionOptions::default().with_write_concern(WriteConcern::unacknowledged());
    assert!(matches!(
        session.start_transaction(Some(options)),
        Err(DriverError::InvalidOperation(_))
    ));
    assert!(session.current_transaction().is_none());
}

#[test]
fn test_standalone_servers_do_not_support_transactions() {
    let fixture = Fixture::new(ClusterType::Standalone, ServerType::Standalone);
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    assert!(matches!(
        session.start_transaction(None),
        Err(DriverError::NotSupported(_))
    ));
}

#[test]
fn test_old_routers_do_not_support_sharded_transactions() {
    let fixture = Fixture::new(ClusterType::Sharded, ServerType::ShardRouter);
    fixture
        .server
        .update_description(ServerDescription::new(server_id(27017), ServerType::ShardRouter, 7));
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    assert!(matches!(
        session.start_transaction(None),
        Err(DriverError::NotSupported(_))
    ));

    fixture
        .server
        .update_description(ServerDescription::new(server_id(27017), ServerType::ShardRouter, 8));
    session.start_transaction(None).unwrap();
}

#[test]
fn test_session_default_transaction_options_apply() {
    let fixture = Fixture::replica_set();
    let defaults = TransactionOptions::default()
        .with_write_concern(WriteConcern::default().with_w(Acknowledgement::Nodes(2)));
    let handle = fixture.start(CoreSessionOptions::default().with_default_transaction_options(defaults));
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    session.commit_transaction(&ctx()).unwrap();
    assert_eq!(
        fixture.executor.commands()[0].write_concern.w,
        Some(Acknowledgement::Nodes(2))
    );
}

#[test]
fn test_about_to_send_command_drops_finished_transactions() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    session.about_to_send_command();
    assert!(session.current_transaction().is_some());

    session.commit_transaction(&ctx()).unwrap();
    assert!(!session.is_in_transaction());
    session.about_to_send_command();
    assert!(session.current_transaction().is_none());

    start_used_transaction(&session, None);
    session.abort_transaction(&ctx()).unwrap();
    session.about_to_send_command();
    assert!(session.current_transaction().is_none());
}

#[test]
fn test_disposing_last_handle_aborts_running_transaction() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);
    let fork = handle.fork_handle().unwrap();

    start_used_transaction(&session, None);
    handle.dispose();
    assert!(!session.is_disposed());
    assert_eq!(fixture.executor.count(), 0);

    fork.dispose();
    assert!(session.is_disposed());
    let commands = fixture.executor.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].kind, EndTransactionKind::Abort);
    assert!(session.start_transaction(None).unwrap_err().is_disposed());
}

#[test]
fn test_clocks_only_move_forward() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::causally_consistent());
    let session = session_of(&handle);
    assert!(session.is_causally_consistent());

    session.advance_cluster_time(&ClusterTime::new(Timestamp::new(10, 2)));
    session.advance_cluster_time(&ClusterTime::new(Timestamp::new(9, 5)));
    assert_eq!(session.cluster_time().unwrap().cluster_time, Timestamp::new(10, 2));

    session.advance_operation_time(Timestamp::new(5, 1));
    session.advance_operation_time(Timestamp::new(5, 0));
    assert_eq!(session.operation_time(), Some(Timestamp::new(5, 1)));
}

#[test]
fn test_snapshot_time_is_set_once() {
    let fixture = Fixture::replica_set();
    let snapshot = fixture.start(CoreSessionOptions::snapshot());
    let snapshot = session_of(&snapshot);
    snapshot.set_snapshot_time_if_needed(Timestamp::new(3, 0));
    snapshot.set_snapshot_time_if_needed(Timestamp::new(4, 0));
    assert_eq!(snapshot.snapshot_time(), Some(Timestamp::new(3, 0)));

    let plain = fixture.start(CoreSessionOptions::implicit());
    let plain = session_of(&plain);
    assert!(plain.is_implicit());
    plain.set_snapshot_time_if_needed(Timestamp::new(3, 0));
    assert_eq!(plain.snapshot_time(), None);
}

#[test]
fn test_used_server_session_is_reused() {
    let fixture = Fixture::replica_set();

    let first = fixture.start(CoreSessionOptions::implicit());
    let first_id = session_of(&first).id();
    session_of(&first).was_used();
    first.dispose();
    assert_eq!(fixture.sessions.len(), 1);

    let second = fixture.start(CoreSessionOptions::implicit());
    assert_eq!(session_of(&second).id(), first_id);
    assert!(fixture.sessions.is_empty());
}

#[test]
fn test_dirty_or_unused_server_sessions_are_discarded() {
    let fixture = Fixture::replica_set();

    let dirty = fixture.start(CoreSessionOptions::default());
    session_of(&dirty).was_used();
    session_of(&dirty).mark_dirty();
    assert!(session_of(&dirty).is_dirty());
    dirty.dispose();
    assert!(fixture.sessions.is_empty());

    let unused = fixture.start(CoreSessionOptions::default());
    unused.dispose();
    assert!(fixture.sessions.is_empty());
}

#[test]
fn test_short_logical_session_timeout_discards_sessions() {
    let (server, _factory) = pooled_server(27017, ServerType::ReplicaSetPrimary, quiet_settings());
    server.update_description(
        ServerDescription::new(server_id(27017), ServerType::ReplicaSetPrimary, 21)
            .with_logical_session_timeout(Some(Duration::from_secs(30))),
    );
    let cluster = cluster_of(ClusterType::ReplicaSet, vec![server]);
    let pool = ServerSessionPool::new(cluster as Arc<dyn Cluster>, SessionPoolSettings::default());

    let lease = pool.acquire_session();
    lease.session().was_used();
    lease.release();
    lease.release();
    assert!(lease.is_released());
    // Thirty seconds is inside the one minute expiry margin.
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_async_commit_retry_and_abort() {
    let fixture = Fixture::replica_set();
    let handle = fixture.start(CoreSessionOptions::default());
    let session = session_of(&handle);

    start_used_transaction(&session, None);
    fixture.executor.fail_with([DriverError::connection("reset")]);
    session.commit_transaction_async(&ctx()).await.unwrap();
    assert_eq!(fixture.executor.count(), 2);

    start_used_transaction(&session, None);
    fixture.executor.fail_with([command_error(11000, &[])]);
    session.abort_transaction_async(&ctx()).await.unwrap();
    assert_eq!(fixture.executor.count(), 3);
    assert!(!session.is_in_transaction());
}
