//! Keeps transactions and cursors on the connection they started on.
//!
//! Behind a load balancer every server is the same address, so a transaction
//! or cursor has to stay on one physical connection. Against a sharded
//! cluster a transaction stays on one router.

use std::sync::Arc;

use tracing::debug;

use super::bindings::{
    ChannelReadWriteBinding, ReadPreferenceBinding, SingleServerReadWriteBinding,
    WritableServerBinding,
};
use super::channel::ChannelHandle;
use super::channel_source::{ChannelChannelSource, ChannelSourceHandle};
use super::cluster::{Cluster, ClusterType};
use super::handles::{ReadBindingHandle, ReadWriteBindingHandle};
use crate::error::DriverError;
use crate::pool::CheckOutReason;
use crate::session::{CoreTransaction, ReadPreference, SessionHandle};

pub struct ChannelPinningHelper;

impl ChannelPinningHelper {
    /// Read binding that honours whatever the session's transaction is
    /// pinned to.
    pub fn create_read_binding(
        cluster: &Arc<dyn Cluster>,
        session: &dyn SessionHandle,
        read_preference: ReadPreference,
    ) -> Result<ReadBindingHandle, DriverError> {
        let core = session.session()?;
        let transaction = core.current_transaction();

        if is_load_balanced(cluster.as_ref()) {
            if let Some(binding) = pinned_channel_binding(transaction.as_deref(), session)? {
                return Ok(ReadBindingHandle::new(Arc::new(binding)));
            }
        }

        if core.is_in_transaction() && read_preference != ReadPreference::Primary {
            return Err(DriverError::InvalidOperation(
                "Read preference in a transaction must be primary.".into(),
            ));
        }

        if let Some(server) = transaction.as_ref().and_then(|t| t.pinned_server()) {
            let binding = SingleServerReadWriteBinding::new(server, session.fork()?);
            return Ok(ReadBindingHandle::new(Arc::new(binding)));
        }

        let binding = ReadPreferenceBinding::new(Arc::clone(cluster), read_preference, session.fork()?);
        Ok(ReadBindingHandle::new(Arc::new(binding)))
    }

    /// Read-write binding that honours whatever the session's transaction is
    /// pinned to.
    pub fn create_read_write_binding(
        cluster: &Arc<dyn Cluster>,
        session: &dyn SessionHandle,
    ) -> Result<ReadWriteBindingHandle, DriverError> {
        let transaction = session.session()?.current_transaction();

        if is_load_balanced(cluster.as_ref()) {
            if let Some(binding) = pinned_channel_binding(transaction.as_deref(), session)? {
                return Ok(ReadWriteBindingHandle::new(Arc::new(binding)));
            }
        }

        if let Some(server) = transaction.as_ref().and_then(|t| t.pinned_server()) {
            let binding = SingleServerReadWriteBinding::new(server, session.fork()?);
            return Ok(ReadWriteBindingHandle::new(Arc::new(binding)));
        }

        let binding = WritableServerBinding::new(Arc::clone(cluster), session.fork()?);
        Ok(ReadWriteBindingHandle::new(Arc::new(binding)))
    }

    /// Pin `channel` to the session's transaction the first time the
    /// transaction runs on a load-balanced connection.
    pub fn pin_channel_if_required(
        channel_source: &ChannelSourceHandle,
        channel: &ChannelHandle,
        session: &dyn SessionHandle,
    ) -> Result<(), DriverError> {
        if !channel.is_load_balanced() {
            return Ok(());
        }
        let core = session.session()?;
        if !core.is_in_transaction() {
            return Ok(());
        }
        let Some(transaction) = core.current_transaction() else {
            return Ok(());
        };
        if transaction.is_channel_pinned() {
            return Ok(());
        }

        channel
            .channel()?
            .connection()
            .set_checkout_reason_if_not_set(CheckOutReason::Transaction)?;
        transaction.pin_channel(channel.fork()?);
        transaction.pin_server(Arc::clone(channel_source.server()));
        debug!(
            connection_id = %channel.connection_id(),
            transaction_number = transaction.transaction_number(),
            "Pinned transaction to connection"
        );
        Ok(())
    }

    /// Channel source for a cursor's follow-up requests. On a load-balanced
    /// connection the cursor keeps the channel it was opened on.
    pub fn create_cursor_channel_source(
        channel_source: &ChannelSourceHandle,
        channel: &ChannelHandle,
    ) -> Result<ChannelSourceHandle, DriverError> {
        if !channel.is_load_balanced() {
            return channel_source.fork();
        }

        channel
            .channel()?
            .connection()
            .set_checkout_reason_if_not_set(CheckOutReason::Cursor)?;
        let source = ChannelChannelSource::new(
            Arc::clone(channel_source.server()),
            channel.fork()?,
            channel_source.session()?.fork()?,
        );
        Ok(ChannelSourceHandle::new(Arc::new(source)))
    }
}

fn is_load_balanced(cluster: &dyn Cluster) -> bool {
    cluster.description().cluster_type == ClusterType::LoadBalanced
}

fn pinned_channel_binding(
    transaction: Option<&CoreTransaction>,
    session: &dyn SessionHandle,
) -> Result<Option<ChannelReadWriteBinding>, DriverError> {
    let Some(transaction) = transaction else {
        return Ok(None);
    };
    let (Some(server), Some(channel)) = (transaction.pinned_server(), transaction.fork_pinned_channel()?)
    else {
        return Ok(None);
    };
    Ok(Some(ChannelReadWriteBinding::new(server, channel, session.fork()?)))
}
