//! DocDB driver core
//!
//! Connection pooling, channel bindings and logical sessions for a document
//! database driver. Wire encoding, authentication and topology monitoring are
//! collaborators: the pool consumes a [`ConnectionFactory`] and hands out
//! [`ConnectionHandle`]s that the protocol layer sends messages through.
//!
//! # Layers
//!
//! - **sync**: reference-counted handles, semaphores, one-way state machines
//!   and the per-operation timeout/cancellation context
//! - **pool**: [`ExclusiveConnectionPool`], one per server, with generation
//!   based invalidation and background maintenance
//! - **session**: [`CoreSession`], server session pooling and transactions
//!   with commit/abort retry
//! - **binding**: bindings, channel sources and channels that keep a
//!   transaction or cursor on the connection it started on
//! - **telemetry**: structured logging, pool event metrics and spans

pub mod binding;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod session;
pub mod sync;
pub mod telemetry;

pub use binding::{
    ChannelHandle, ChannelPinningHelper, ChannelSourceHandle, Cluster, PooledServer,
    ReadBindingHandle, ReadWriteBindingHandle, Server, StaticCluster,
};
pub use config::{EffectiveConfig, EnvConfig};
pub use connection::{Connection, ConnectionFactory, ConnectionSettings, EndPoint, ServerId, ServiceId};
pub use error::DriverError;
pub use pool::{ConnectionHandle, ConnectionPoolSettings, ExclusiveConnectionPool, PoolEvent, PoolEventListener};
pub use session::{
    CoreSession, CoreSessionHandle, CoreSessionOptions, CoreTransaction, CoreTransactionState,
    EndTransactionExecutor, ServerSessionPool, SessionHandle, TransactionOptions,
};
pub use sync::OperationContext;
