//! Connection identities and the transport seam consumed by the pool.

mod traits;
mod types;

pub use traits::{Connection, ConnectionFactory};
pub use types::{
    ClusterId, ConnectionDescription, ConnectionId, ConnectionSettings, EndPoint, RequestMessage,
    ResponseMessage, ServerId, ServerType, ServiceId,
};
