//! Bindings, channel sources and transaction pinning.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{cluster_of, pooled_server, quiet_settings, server_id, RecordingExecutor};
use docdb_core::binding::{
    ChannelPinningHelper, ChannelSourceReadWriteBinding, Cluster, ClusterType, PooledServer,
    ReadBinding, ReadWriteBinding, Server, SingleServerReadWriteBinding,
};
use docdb_core::connection::{ConnectionId, ServerType, ServiceId};
use docdb_core::error::DriverError;
use docdb_core::pool::CheckOutReason;
use docdb_core::session::{
    CoreSession, CoreSessionHandle, CoreSessionOptions, EndTransactionExecutor, EndTransactionKind,
    ReadPreference, ServerSessionPool, SessionHandle, SessionPoolSettings,
};
use docdb_core::sync::OperationContext;

fn ctx() -> OperationContext {
    OperationContext::with_timeout(Duration::from_secs(5))
}

fn start_session(cluster: &Arc<dyn Cluster>, executor: &Arc<RecordingExecutor>) -> CoreSessionHandle {
    let sessions = ServerSessionPool::new(Arc::clone(cluster), SessionPoolSettings::default());
    CoreSession::start(
        Arc::clone(cluster),
        Arc::clone(executor) as Arc<dyn EndTransactionExecutor>,
        &sessions,
        CoreSessionOptions::default(),
    )
}

/// Run one write the way an operation would and report the connection used.
fn run_write(cluster: &Arc<dyn Cluster>, session: &CoreSessionHandle) -> ConnectionId {
    let ctx = ctx();
    let binding = ChannelPinningHelper::create_read_write_binding(cluster, session).unwrap();
    let source = binding.get_write_channel_source(&ctx).unwrap();
    let channel = source.get_channel(&ctx).unwrap();
    ChannelPinningHelper::pin_channel_if_required(&source, &channel, session).unwrap();
    if let Some(transaction) = session.session().unwrap().current_transaction() {
        transaction.advance_statement_id(1);
    }

    let connection_id = channel.connection_id().clone();
    channel.dispose();
    source.dispose();
    binding.dispose();
    connection_id
}

struct LoadBalanced {
    server: Arc<PooledServer>,
    factory: Arc<common::MockConnectionFactory>,
    cluster: Arc<dyn Cluster>,
}

fn load_balanced() -> LoadBalanced {
    let settings = quiet_settings().with_load_balanced(true);
    let (server, factory) = pooled_server(27017, ServerType::LoadBalanced, settings);
    factory.set_service_id(Some(ServiceId::new("svc-a")));
    let cluster = cluster_of(ClusterType::LoadBalanced, vec![Arc::clone(&server)]) as Arc<dyn Cluster>;
    LoadBalanced {
        server,
        factory,
        cluster,
    }
}

#[test]
fn test_load_balanced_transaction_stays_on_one_connection() {
    let lb = load_balanced();
    let executor = Arc::new(RecordingExecutor::with_channel());
    let handle = start_session(&lb.cluster, &executor);
    let session = Arc::clone(handle.session().unwrap());

    session.start_transaction(None).unwrap();
    let first = run_write(&lb.cluster, &handle);
    let second = run_write(&lb.cluster, &handle);
    assert_eq!(first, second);
    assert_eq!(lb.factory.created(), 1);

    let transaction = session.current_transaction().unwrap();
    assert!(transaction.is_channel_pinned());
    assert_eq!(lb.server.pool().used_count().unwrap(), 1);

    let pinned = transaction.fork_pinned_channel().unwrap().unwrap();
    assert_eq!(
        pinned.channel().unwrap().connection().checkout_reason(),
        Some(CheckOutReason::Transaction)
    );
    pinned.dispose();

    session.commit_transaction(&ctx()).unwrap();
    let state = lb.factory.state_of(&first).unwrap();
    assert_eq!(state.sent.load(Ordering::Acquire), 1);
    // Kept for a possible commit retry until the next command.
    assert_eq!(lb.server.pool().used_count().unwrap(), 1);

    session.about_to_send_command();
    assert_eq!(lb.server.pool().used_count().unwrap(), 0);
    assert_eq!(lb.server.pool().dormant_count().unwrap(), 1);
}

#[test]
fn test_load_balanced_abort_unpins_immediately() {
    let lb = load_balanced();
    let executor = Arc::new(RecordingExecutor::with_channel());
    let handle = start_session(&lb.cluster, &executor);
    let session = Arc::clone(handle.session().unwrap());

    session.start_transaction(None).unwrap();
    run_write(&lb.cluster, &handle);
    session.abort_transaction(&ctx()).unwrap();

    assert_eq!(executor.commands()[0].kind, EndTransactionKind::Abort);
    assert!(!session.current_transaction().unwrap().is_channel_pinned());
    assert_eq!(lb.server.pool().used_count().unwrap(), 0);
}

#[test]
fn test_load_balanced_writes_outside_transactions_are_not_pinned() {
    let lb = load_balanced();
    let executor = Arc::new(RecordingExecutor::new());
    let handle = start_session(&lb.cluster, &executor);

    run_write(&lb.cluster, &handle);
    assert_eq!(lb.server.pool().used_count().unwrap(), 0);
    assert!(handle.session().unwrap().current_transaction().is_none());
}

#[test]
fn test_sharded_transaction_pins_first_router() {
    let (a, _) = pooled_server(27017, ServerType::ShardRouter, quiet_settings());
    let (b, _) = pooled_server(27018, ServerType::ShardRouter, quiet_settings());
    let cluster = cluster_of(ClusterType::Sharded, vec![a, b]) as Arc<dyn Cluster>;
    let executor = Arc::new(RecordingExecutor::new());
    let handle = start_session(&cluster, &executor);
    let session = Arc::clone(handle.session().unwrap());

    session.start_transaction(None).unwrap();
    run_write(&cluster, &handle);
    let transaction = session.current_transaction().unwrap();
    let pinned = transaction.pinned_server().unwrap();
    assert_eq!(pinned.server_id(), &server_id(27017));

    let second = run_write(&cluster, &handle);
    assert_eq!(second.server_id, server_id(27017));

    // A network error leaves the commit outcome unknown; the retry may go anywhere.
    executor.fail_with([DriverError::connection("reset")]);
    session.commit_transaction(&ctx()).unwrap();
    assert_eq!(executor.count(), 2);
    assert!(transaction.pinned_server().is_none());
}

#[test]
fn test_non_primary_read_in_transaction_is_rejected() {
    let (primary, _) = pooled_server(27017, ServerType::ReplicaSetPrimary, quiet_settings());
    let (secondary, _) = pooled_server(27018, ServerType::ReplicaSetSecondary, quiet_settings());
    let cluster = cluster_of(ClusterType::ReplicaSet, vec![primary, secondary]) as Arc<dyn Cluster>;
    let executor = Arc::new(RecordingExecutor::new());
    let handle = start_session(&cluster, &executor);

    let binding = ChannelPinningHelper::create_read_binding(&cluster, &handle, ReadPreference::Secondary).unwrap();
    let source = binding.get_read_channel_source(&ctx()).unwrap();
    assert_eq!(source.server().server_id(), &server_id(27018));
    assert_eq!(binding.read_preference(), ReadPreference::Secondary);
    source.dispose();
    binding.dispose();

    handle.session().unwrap().start_transaction(None).unwrap();
    let result = ChannelPinningHelper::create_read_binding(&cluster, &handle, ReadPreference::Secondary);
    assert!(matches!(result, Err(DriverError::InvalidOperation(_))));

    let primary_read = ChannelPinningHelper::create_read_binding(&cluster, &handle, ReadPreference::Primary).unwrap();
    let source = primary_read.get_read_channel_source(&ctx()).unwrap();
    assert_eq!(source.server().server_id(), &server_id(27017));
}

#[test]
fn test_cursor_source_keeps_load_balanced_channel() {
    let lb = load_balanced();
    let executor = Arc::new(RecordingExecutor::new());
    let handle = start_session(&lb.cluster, &executor);

    let binding = ChannelPinningHelper::create_read_write_binding(&lb.cluster, &handle).unwrap();
    let source = binding.get_read_channel_source(&ctx()).unwrap();
    let channel = source.get_channel(&ctx()).unwrap();
    let cursor_source = ChannelPinningHelper::create_cursor_channel_source(&source, &channel).unwrap();
    assert_eq!(
        channel.channel().unwrap().connection().checkout_reason(),
        Some(CheckOutReason::Cursor)
    );

    let connection_id = channel.connection_id().clone();
    channel.dispose();
    source.dispose();
    binding.dispose();
    assert_eq!(lb.server.pool().used_count().unwrap(), 1);

    let get_more = cursor_source.get_channel(&ctx()).unwrap();
    assert_eq!(get_more.connection_id(), &connection_id);
    get_more.dispose();
    cursor_source.dispose();
    assert_eq!(lb.server.pool().used_count().unwrap(), 0);
}

#[test]
fn test_cursor_source_outside_load_balancer_checks_out_fresh_channels() {
    let (server, _) = pooled_server(27017, ServerType::ReplicaSetPrimary, quiet_settings());
    let cluster = cluster_of(ClusterType::ReplicaSet, vec![Arc::clone(&server)]) as Arc<dyn Cluster>;
    let executor = Arc::new(RecordingExecutor::new());
    let handle = start_session(&cluster, &executor);

    let binding = ChannelPinningHelper::create_read_write_binding(&cluster, &handle).unwrap();
    let source = binding.get_read_channel_source(&ctx()).unwrap();
    let channel = source.get_channel(&ctx()).unwrap();
    let cursor_source = ChannelPinningHelper::create_cursor_channel_source(&source, &channel).unwrap();
    assert_eq!(channel.channel().unwrap().connection().checkout_reason(), None);

    let get_more = cursor_source.get_channel(&ctx()).unwrap();
    assert_ne!(get_more.connection_id(), channel.connection_id());
    assert_eq!(server.pool().used_count().unwrap(), 2);
}

#[test]
fn test_binding_handles_hold_the_session_until_last_fork() {
    let (server, _) = pooled_server(27017, ServerType::ReplicaSetPrimary, quiet_settings());
    let cluster = cluster_of(ClusterType::ReplicaSet, vec![server]) as Arc<dyn Cluster>;
    let executor = Arc::new(RecordingExecutor::new());
    let handle = start_session(&cluster, &executor);
    assert_eq!(handle.reference_count(), 1);

    let binding = ChannelPinningHelper::create_read_write_binding(&cluster, &handle).unwrap();
    let fork = binding.fork().unwrap();
    assert_eq!(binding.reference_count(), 2);
    assert_eq!(handle.reference_count(), 2);

    binding.dispose();
    assert!(binding.get_write_channel_source(&ctx()).unwrap_err().is_disposed());
    assert_eq!(handle.reference_count(), 2);

    let source = fork.get_write_channel_source(&ctx()).unwrap();
    assert_eq!(handle.reference_count(), 3);
    source.dispose();
    fork.dispose();
    assert_eq!(handle.reference_count(), 1);
}

#[test]
fn test_single_server_and_channel_source_bindings() {
    let (a, _) = pooled_server(27017, ServerType::ReplicaSetPrimary, quiet_settings());
    let (b, _) = pooled_server(27018, ServerType::ReplicaSetSecondary, quiet_settings());
    let cluster = cluster_of(ClusterType::ReplicaSet, vec![a, Arc::clone(&b)]) as Arc<dyn Cluster>;
    let executor = Arc::new(RecordingExecutor::new());
    let handle = start_session(&cluster, &executor);

    let single = SingleServerReadWriteBinding::new(b as Arc<dyn Server>, handle.fork().unwrap());
    let source = single.get_write_channel_source(&ctx()).unwrap();
    assert_eq!(source.server().server_id(), &server_id(27018));

    let pinned_source = ChannelSourceReadWriteBinding::new(
        source.fork().unwrap(),
        ReadPreference::SecondaryPreferred,
        handle.fork().unwrap(),
    );
    let again = pinned_source.get_read_channel_source(&ctx()).unwrap();
    assert_eq!(again.server().server_id(), &server_id(27018));
    assert_eq!(pinned_source.read_preference(), ReadPreference::SecondaryPreferred);
    again.dispose();

    pinned_source.dispose();
    pinned_source.dispose();
    assert!(pinned_source.get_read_channel_source(&ctx()).unwrap_err().is_disposed());

    source.dispose();
    single.dispose();
    assert!(single.get_read_channel_source(&ctx()).unwrap_err().is_disposed());
    assert_eq!(handle.reference_count(), 1);
}

#[test]
fn test_server_invalidation_clears_pool() {
    let (server, factory) = pooled_server(
        27017,
        ServerType::LoadBalanced,
        quiet_settings().with_load_balanced(true),
    );
    let service = ServiceId::new("svc-a");
    factory.set_service_id(Some(service.clone()));

    let channel = server.get_channel(&ctx()).unwrap();
    let state = factory.state_of(channel.connection_id()).unwrap();
    server.invalidate(Some(&service)).unwrap();
    assert!(state.closed.load(Ordering::Acquire));
    assert_eq!(server.pool().generation(), 0);
    channel.dispose();

    server.invalidate(None).unwrap();
    assert_eq!(server.pool().generation(), 1);
}

#[test]
fn test_network_error_on_checkout_clears_pool() {
    let (server, factory) = pooled_server(27017, ServerType::ReplicaSetPrimary, quiet_settings());

    factory.fail_next_opens(1);
    let err = server.get_channel(&ctx()).unwrap_err();
    assert!(err.is_network_error());
    assert_eq!(server.pool().generation(), 1);

    let channel = server.get_channel(&ctx()).unwrap();
    assert_eq!(channel.channel().unwrap().connection().generation(), 1);
}
