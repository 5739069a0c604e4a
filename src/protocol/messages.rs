//! Room keys, presence payloads, and signaling broadcast messages

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical channel scope for one unordered pair of users.
///
/// Both peers derive the same key regardless of argument order, so either
/// side can open "the" room for a friendship without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Canonical key for the pair `(a, b)`: sorted ids joined under a fixed
    /// prefix. `for_pair(a, b) == for_pair(b, a)` always holds.
    pub fn for_pair(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("room:{lo}:{hi}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Presence status of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Away => f.write_str("away"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Presence payload tracked on a channel for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub peer_id: String,
    pub status: PresenceStatus,
    /// Epoch millis of the peer's last reported activity.
    pub last_active_at: u64,
}

/// Why a call offer was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Callee already has a pending offer from someone else.
    Busy,
    /// Callee explicitly declined.
    Declined,
    /// Callee never answered within the timeout.
    NoAnswer,
}

/// A proposed call awaiting accept/reject on the callee side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOffer {
    pub room: RoomKey,
    pub caller: String,
    pub callee: String,
    pub offer_id: Uuid,
    pub issued_at: u64,
}

/// Signaling broadcast riding on a room channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    TypingStart {
        room: RoomKey,
        sender: String,
        issued_at: u64,
    },
    TypingStop {
        room: RoomKey,
        sender: String,
        issued_at: u64,
    },
    CallRequest {
        room: RoomKey,
        sender: String,
        callee: String,
        offer_id: Uuid,
        issued_at: u64,
    },
    CallAccepted {
        room: RoomKey,
        sender: String,
        offer_id: Uuid,
        issued_at: u64,
    },
    CallEnd {
        room: RoomKey,
        sender: String,
        offer_id: Uuid,
        issued_at: u64,
    },
    CallRejected {
        room: RoomKey,
        sender: String,
        offer_id: Uuid,
        reason: RejectReason,
        issued_at: u64,
    },
}

impl SignalMessage {
    /// Broadcast event name as published on the transport.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::CallRequest { .. } => "call_request",
            Self::CallAccepted { .. } => "call_accepted",
            Self::CallEnd { .. } => "call_end",
            Self::CallRejected { .. } => "call_rejected",
        }
    }

    pub fn room(&self) -> &RoomKey {
        match self {
            Self::TypingStart { room, .. }
            | Self::TypingStop { room, .. }
            | Self::CallRequest { room, .. }
            | Self::CallAccepted { room, .. }
            | Self::CallEnd { room, .. }
            | Self::CallRejected { room, .. } => room,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::TypingStart { sender, .. }
            | Self::TypingStop { sender, .. }
            | Self::CallRequest { sender, .. }
            | Self::CallAccepted { sender, .. }
            | Self::CallEnd { sender, .. }
            | Self::CallRejected { sender, .. } => sender,
        }
    }
}

/// Lifecycle of one transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    Closed,
    Failed,
}

/// Event delivered by the transport for one subscribed room channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Authoritative full peer set; replaces prior per-room state.
    PresenceSync {
        room: RoomKey,
        peers: Vec<PresenceMeta>,
    },
    PresenceJoin {
        room: RoomKey,
        peer: PresenceMeta,
    },
    PresenceLeave {
        room: RoomKey,
        peer_id: String,
    },
    /// Raw broadcast payload; parsed into [`SignalMessage`] by the consumer.
    Broadcast {
        room: RoomKey,
        payload: serde_json::Value,
    },
    StatusChange {
        room: RoomKey,
        status: ChannelStatus,
    },
}

/// Current wall-clock time as epoch millis.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
