//! Logical sessions, server session pooling and transactions.

mod clock;
mod core_session;
mod handle;
mod options;
mod server_session;
mod transaction;

pub use clock::{ClusterClock, ClusterTime, OperationClock, Timestamp};
pub use core_session::{
    CoreSession, EndTransactionCommand, EndTransactionExecutor, EndTransactionKind,
};
pub use handle::{CoreSessionHandle, NonDisposingCoreSessionHandle, SessionHandle};
pub use options::{
    Acknowledgement, CoreSessionOptions, ReadConcern, ReadConcernLevel, ReadPreference,
    SessionPoolSettings, TransactionOptions, WriteConcern,
};
pub use server_session::{ServerSession, ServerSessionLease, ServerSessionPool};
pub use transaction::{CoreTransaction, CoreTransactionState};
