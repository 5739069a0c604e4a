//! Collaborator seam for the hosted realtime transport
//!
//! The backend SDK that actually speaks the wire lives behind
//! [`RealtimeTransport`]. The multiplexer only ever sees typed events and
//! typed errors; envelope framing and serialization are the collaborator's
//! job.

use crate::error::TransportError;
use crate::protocol::{ChannelEvent, PresenceMeta, SignalMessage};
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Opaque reference to one live transport subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    pub id: Uuid,
    pub channel: String,
}

impl TransportHandle {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
        }
    }
}

/// The external realtime transport contract.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Subscribe to `channel`. Events for the channel (presence sync/join/
    /// leave, broadcasts, status changes) are delivered on `events`.
    async fn subscribe(
        &self,
        channel: &str,
        events: UnboundedSender<ChannelEvent>,
    ) -> Result<TransportHandle, TransportError>;

    /// Publish a typed signaling broadcast on the channel.
    async fn send(
        &self,
        handle: &TransportHandle,
        message: &SignalMessage,
    ) -> Result<(), TransportError>;

    /// Publish the local presence payload on the channel.
    async fn track(
        &self,
        handle: &TransportHandle,
        payload: &PresenceMeta,
    ) -> Result<(), TransportError>;

    /// Withdraw the local presence payload.
    async fn untrack(&self, handle: &TransportHandle) -> Result<(), TransportError>;

    /// Tear down the subscription.
    async fn unsubscribe(&self, handle: TransportHandle) -> Result<(), TransportError>;
}
