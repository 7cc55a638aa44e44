//! Connection pooling.
//!
//! [`ExclusiveConnectionPool`] owns the connections to one server and hands
//! them out through [`ConnectionHandle`]s. Pool clears invalidate connections
//! by generation rather than closing them in place.

mod acquire;
mod checkout;
mod creator;
mod events;
mod exclusive;
mod handle;
mod holder;
mod maintenance;
mod pooled;
mod service_states;
mod settings;

pub use checkout::{CheckOutReason, CheckOutReasonCounter};
pub use events::{CheckOutFailedReason, EventLogger, PoolEvent, PoolEventListener};
pub use exclusive::{ExclusiveConnectionPool, PoolState};
pub use handle::ConnectionHandle;
pub use pooled::PooledConnection;
pub use service_states::{PoolGenerations, ServiceStates};
pub use settings::ConnectionPoolSettings;
