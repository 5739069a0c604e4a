//! Derived-state consumers multiplexed over the shared room channels

pub mod membership;
pub mod presence;
pub mod signaling;
pub mod typing;

pub use membership::RoomMembershipWatcher;
pub use presence::{PresenceRecord, PresenceTracker};
pub use signaling::SignalingRouter;
pub use typing::TypingCoordinator;

use crate::protocol::{RejectReason, RoomKey};
use std::collections::HashSet;
use uuid::Uuid;

/// Derived-state change notification for the UI layer.
///
/// Emitted only when a value actually changed, never once per raw transport
/// event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A peer's stored presence record changed; `None` means the peer left.
    PresenceChanged {
        room: RoomKey,
        peer_id: String,
        record: Option<PresenceRecord>,
    },
    /// The set of peers typing in a room changed.
    TypingChanged {
        room: RoomKey,
        typers: HashSet<String>,
    },
    /// An outgoing call we placed was answered (or turned down / timed out
    /// on the far side).
    CallAnswered {
        offer_id: Uuid,
        accepted: bool,
        reason: Option<RejectReason>,
    },
}
