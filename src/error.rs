//! Typed error taxonomy

use crate::protocol::RoomKey;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the external realtime transport.
///
/// Caught at the registry boundary and converted into [`MuxError`]; the
/// consumers above it never see a raw transport failure.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport disconnected")]
    Disconnected,
}

/// Subsystem error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// Subscribe failed after the retry budget; presence for the room is
    /// temporarily unavailable and will be retried on the next membership
    /// reconciliation pass.
    #[error("channel unavailable for {room}: {reason}")]
    ChannelUnavailable { room: RoomKey, reason: String },

    /// A call broadcast referenced an offer that is no longer pending.
    #[error("stale offer {0} ignored")]
    StaleOffer(Uuid),

    /// A broadcast arrived without the required fields.
    #[error("malformed broadcast payload on {room}")]
    MalformedPayload { room: RoomKey },

    /// Registry dedup failed and a second transport subscribe was about to be
    /// issued for a live room. Programming error; asserted in tests.
    #[error("duplicate subscribe attempted for {0}")]
    DuplicateSubscribe(RoomKey),

    #[error("session already shut down")]
    SessionClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
