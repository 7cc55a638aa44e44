//! Bindings, channel sources and channels.
//!
//! An operation asks a binding for a channel source, the source hands out
//! channels, and every layer is reference counted so a cursor and its
//! transaction can share one connection.

mod bindings;
mod channel;
mod channel_source;
mod cluster;
mod handles;
mod pinning;
mod server;

pub use bindings::{
    ChannelReadWriteBinding, ChannelSourceReadWriteBinding, ReadBinding, ReadPreferenceBinding,
    ReadWriteBinding, SingleServerReadWriteBinding, WritableServerBinding,
};
pub use channel::{Channel, ChannelHandle};
pub use channel_source::{ChannelChannelSource, ChannelSource, ChannelSourceHandle, ServerChannelSource};
pub use cluster::{
    Cluster, ClusterDescription, ClusterType, ServerDescription, ServerSelector, ServerState,
    StaticCluster,
};
pub use handles::{ReadBindingHandle, ReadWriteBindingHandle};
pub use pinning::ChannelPinningHelper;
pub use server::{PooledServer, Server};
