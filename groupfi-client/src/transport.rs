//! The group channel collaborator interface.
//!
//! Transport-level encryption and group-membership cryptography belong to
//! the messaging transport; this module only defines the seam the consumer
//! and coordinator talk through. Implementations deliver messages in
//! arrival order with no exactly-once guarantee — downstream dedups.

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::{Future, Stream};
use groupfi_core::{Envelope, EnvelopeId, GroupId, MemberAddr};

use crate::error::{ConnectError, PublishError};

/// One message as received from the group channel: the envelope plus the
/// transport metadata the consumer needs (sender for echo suppression,
/// message id for deduplication).
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Transport-assigned message id, unique within the channel.
    pub envelope_id: EnvelopeId,
    pub group_id: GroupId,
    pub sender: MemberAddr,
    pub sent_at: DateTime<Utc>,
    pub envelope: Envelope,
}

/// A handle to the encrypted group-messaging transport.
///
/// `subscribe` yields messages in delivery order as they arrive; the stream
/// ending signals a disconnect. Messages authored by the local session are
/// delivered like any other and filtered by the consumer.
pub trait GroupChannel: Clone + Send + Sync + 'static {
    type Messages: Stream<Item = ChannelMessage> + Send + Unpin;

    /// Publish an envelope to a group, returning the transport-assigned
    /// message id.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when the channel is unavailable. A failed
    /// publish must not be assumed to have happened.
    fn publish(
        &self,
        group_id: &GroupId,
        envelope: Envelope,
    ) -> impl Future<Output = Result<EnvelopeId, Report<PublishError>>> + Send;

    /// Open a message stream for one group, or for every group the session
    /// participates in when `group_id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when the channel handshake fails.
    fn subscribe(
        &self,
        group_id: Option<&GroupId>,
    ) -> impl Future<Output = Result<Self::Messages, Report<ConnectError>>> + Send;
}
