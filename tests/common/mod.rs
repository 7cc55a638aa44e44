//! Shared mocks for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use docdb_core::binding::{
    ChannelPinningHelper, ClusterType, PooledServer, ReadBinding, ReadWriteBinding, Server,
    ServerDescription, StaticCluster,
};
use docdb_core::connection::{
    ClusterId, Connection, ConnectionDescription, ConnectionFactory, ConnectionId, ConnectionSettings,
    EndPoint, RequestMessage, ResponseMessage, ServerId, ServerType, ServiceId,
};
use docdb_core::error::DriverError;
use docdb_core::pool::{ConnectionPoolSettings, ExclusiveConnectionPool, PoolEvent, PoolEventListener};
use docdb_core::session::{EndTransactionCommand, EndTransactionExecutor};
use docdb_core::sync::OperationContext;

pub fn server_id(port: u16) -> ServerId {
    ServerId::new(ClusterId(1), EndPoint::new("localhost", port))
}

/// Settings with maintenance off so tests control every connection.
pub fn quiet_settings() -> ConnectionPoolSettings {
    ConnectionPoolSettings::default()
        .with_maintenance_interval(None)
        .with_wait_queue_timeout(Duration::from_secs(5))
}

/// Observable state of one mock connection.
#[derive(Debug)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    pub opened: AtomicBool,
    pub closed: AtomicBool,
    pub stale: AtomicBool,
    pub fail_io: AtomicBool,
    pub sent: AtomicUsize,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }
}

pub struct MockConnection {
    endpoint: EndPoint,
    server_type: ServerType,
    service_id: Option<ServiceId>,
    settings: ConnectionSettings,
    open_delay: Duration,
    close_delay: Duration,
    fail_open: bool,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    description: Mutex<Option<ConnectionDescription>>,
    pending: Mutex<HashMap<i32, Vec<u8>>>,
    state: Arc<ConnectionState>,
}

impl MockConnection {
    fn finish_open(&self) -> Result<(), DriverError> {
        if self.fail_open {
            return Err(DriverError::connection("handshake failed"));
        }
        let mut description =
            ConnectionDescription::new(self.state.connection_id.clone(), self.server_type, 21)
                .with_logical_session_timeout(Duration::from_secs(30 * 60));
        if let Some(service_id) = &self.service_id {
            description = description.with_service_id(service_id.clone());
        }
        *self.description.lock() = Some(description);
        *self.last_used_at.lock() = Instant::now();
        self.state.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn record_send(&self, message: &RequestMessage) -> Result<(), DriverError> {
        if self.state.fail_io.load(Ordering::Acquire) {
            return Err(DriverError::connection("connection reset by peer"));
        }
        self.pending.lock().insert(message.request_id, message.payload.clone());
        self.state.sent.fetch_add(1, Ordering::AcqRel);
        *self.last_used_at.lock() = Instant::now();
        Ok(())
    }

    fn reply(&self, response_to: i32) -> Result<ResponseMessage, DriverError> {
        if self.state.fail_io.load(Ordering::Acquire) {
            return Err(DriverError::connection("connection reset by peer"));
        }
        let payload = self
            .pending
            .lock()
            .remove(&response_to)
            .ok_or_else(|| DriverError::connection(format!("no reply for request {response_to}")))?;
        Ok(ResponseMessage { response_to, payload })
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn connection_id(&self) -> ConnectionId {
        self.state.connection_id.clone()
    }

    fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    fn description(&self) -> Option<ConnectionDescription> {
        self.description.lock().clone()
    }

    fn is_expired(&self) -> bool {
        self.state.stale.load(Ordering::Acquire)
            || self.settings.is_expired(self.created_at, *self.last_used_at.lock())
    }

    fn open(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        self.finish_open()
    }

    async fn open_async(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        self.finish_open()
    }

    fn send_message(&self, message: &RequestMessage, _cancel: &CancellationToken) -> Result<(), DriverError> {
        self.record_send(message)
    }

    async fn send_message_async(
        &self,
        message: &RequestMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.record_send(message)
    }

    fn receive_message(&self, response_to: i32, _cancel: &CancellationToken) -> Result<ResponseMessage, DriverError> {
        self.reply(response_to)
    }

    async fn receive_message_async(
        &self,
        response_to: i32,
        _cancel: &CancellationToken,
    ) -> Result<ResponseMessage, DriverError> {
        self.reply(response_to)
    }

    fn close(&self) {
        if !self.close_delay.is_zero() {
            std::thread::sleep(self.close_delay);
        }
        self.state.closed.store(true, Ordering::Release);
    }
}

/// Factory producing [`MockConnection`]s and remembering each one.
pub struct MockConnectionFactory {
    settings: ConnectionSettings,
    server_type: ServerType,
    open_delay: Duration,
    close_delay: Duration,
    service_id: Mutex<Option<ServiceId>>,
    failures_remaining: AtomicUsize,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self {
            settings: ConnectionSettings::default(),
            server_type: ServerType::ReplicaSetPrimary,
            open_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            service_id: Mutex::new(None),
            failures_remaining: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Connections created from now on report this service id.
    pub fn set_service_id(&self, service_id: Option<ServiceId>) {
        *self.service_id.lock() = service_id;
    }

    /// The next `count` connections fail their handshake.
    pub fn fail_next_opens(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::Release);
    }

    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn open_count(&self) -> usize {
        self.connections.lock().iter().filter(|c| c.is_open()).count()
    }

    pub fn closed_count(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.closed.load(Ordering::Acquire))
            .count()
    }

    pub fn state_of(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections
            .lock()
            .iter()
            .find(|c| &c.connection_id == connection_id)
            .cloned()
    }

    pub fn states(&self) -> Vec<Arc<ConnectionState>> {
        self.connections.lock().clone()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create_connection(&self, server_id: &ServerId, endpoint: &EndPoint) -> Box<dyn Connection> {
        let state = Arc::new(ConnectionState {
            connection_id: ConnectionId::next(server_id.clone()),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            fail_io: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
        });
        self.connections.lock().push(Arc::clone(&state));

        let fail_open = self
            .failures_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let now = Instant::now();
        Box::new(MockConnection {
            endpoint: endpoint.clone(),
            server_type: self.server_type,
            service_id: self.service_id.lock().clone(),
            settings: self.settings.clone(),
            open_delay: self.open_delay,
            close_delay: self.close_delay,
            fail_open,
            created_at: now,
            last_used_at: Mutex::new(now),
            description: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            state,
        })
    }
}

/// Records every pool event it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<PoolEvent>>,
}

impl RecordingListener {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.as_str()).collect()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl PoolEventListener for RecordingListener {
    fn on_event(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }
}

pub fn open_pool(
    port: u16,
    settings: ConnectionPoolSettings,
    factory: Arc<MockConnectionFactory>,
) -> ExclusiveConnectionPool {
    let pool = ExclusiveConnectionPool::new(
        server_id(port),
        EndPoint::new("localhost", port),
        settings,
        factory,
        None,
    )
    .unwrap();
    pool.initialize().unwrap();
    pool
}

pub fn open_pool_with_listener(
    port: u16,
    settings: ConnectionPoolSettings,
    factory: Arc<MockConnectionFactory>,
    listener: Arc<RecordingListener>,
) -> ExclusiveConnectionPool {
    let pool = ExclusiveConnectionPool::new(
        server_id(port),
        EndPoint::new("localhost", port),
        settings,
        factory,
        Some(listener as Arc<dyn PoolEventListener>),
    )
    .unwrap();
    pool.initialize().unwrap();
    pool
}

/// A pooled server of the given type plus the factory behind it.
pub fn pooled_server(
    port: u16,
    server_type: ServerType,
    settings: ConnectionPoolSettings,
) -> (Arc<PooledServer>, Arc<MockConnectionFactory>) {
    let factory = Arc::new(MockConnectionFactory::new().with_server_type(server_type));
    let pool = open_pool(port, settings, Arc::clone(&factory));
    let description = ServerDescription::new(server_id(port), server_type, 21);
    (Arc::new(PooledServer::new(description, pool)), factory)
}

pub fn cluster_of(cluster_type: ClusterType, servers: Vec<Arc<PooledServer>>) -> Arc<StaticCluster> {
    let servers = servers.into_iter().map(|s| s as Arc<dyn Server>).collect();
    Arc::new(StaticCluster::new(ClusterId(1), cluster_type, servers))
}

/// Records end-transaction commands and fails them from a script.
pub struct RecordingExecutor {
    commands: Mutex<Vec<EndTransactionCommand>>,
    errors: Mutex<VecDeque<DriverError>>,
    use_channel: bool,
    next_request_id: AtomicUsize,
}

impl RecordingExecutor {
    /// Records commands without touching a connection.
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            errors: Mutex::new(VecDeque::new()),
            use_channel: false,
            next_request_id: AtomicUsize::new(1),
        }
    }

    /// Also checks out a channel from the binding and runs a request on it.
    pub fn with_channel() -> Self {
        Self {
            use_channel: true,
            ..Self::new()
        }
    }

    /// The next executions fail with these errors, in order.
    pub fn fail_with(&self, errors: impl IntoIterator<Item = DriverError>) {
        self.errors.lock().extend(errors);
    }

    pub fn commands(&self) -> Vec<EndTransactionCommand> {
        self.commands.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.commands.lock().len()
    }

    fn run_on_channel(&self, binding: &dyn ReadWriteBinding, ctx: &OperationContext) -> Result<(), DriverError> {
        let source = binding.get_write_channel_source(ctx)?;
        let channel = source.get_channel(ctx)?;
        ChannelPinningHelper::pin_channel_if_required(&source, &channel, binding.session())?;
        let request = RequestMessage {
            request_id: self.next_request_id.fetch_add(1, Ordering::AcqRel) as i32,
            payload: b"endTransaction".to_vec(),
        };
        let result = channel.command(&request, ctx.cancellation()).map(|_| ());
        channel.dispose();
        source.dispose();
        result
    }

    fn record(&self, command: &EndTransactionCommand) -> Result<(), DriverError> {
        self.commands.lock().push(command.clone());
        match self.errors.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EndTransactionExecutor for RecordingExecutor {
    fn execute(
        &self,
        command: &EndTransactionCommand,
        binding: &dyn ReadWriteBinding,
        ctx: &OperationContext,
    ) -> Result<(), DriverError> {
        if self.use_channel {
            self.run_on_channel(binding, ctx)?;
        }
        self.record(command)
    }

    async fn execute_async(
        &self,
        command: &EndTransactionCommand,
        binding: &dyn ReadWriteBinding,
        ctx: &OperationContext,
    ) -> Result<(), DriverError> {
        if self.use_channel {
            let source = binding.get_write_channel_source_async(ctx).await?;
            let channel = source.get_channel_async(ctx).await?;
            ChannelPinningHelper::pin_channel_if_required(&source, &channel, binding.session())?;
            channel.dispose();
            source.dispose();
        }
        self.record(command)
    }
}

/// Command error carrying the given labels.
pub fn command_error(code: i32, labels: &[&str]) -> DriverError {
    DriverError::Command {
        code,
        message: format!("command failed with {code}"),
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}
