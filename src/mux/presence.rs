//! Per-room presence tracking
//!
//! Consumes sync/join/leave events from the shared channel feed. A `sync`
//! payload is authoritative and replaces the room's peer set wholesale, so a
//! reconnect can never leak stale peers. "Away" is never pushed by the
//! remote; it is derived at read time from `last_active_at`.

use crate::config::PresenceConfig;
use crate::mux::SessionEvent;
use crate::protocol::{epoch_millis, PresenceMeta, PresenceStatus, RoomKey};
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

/// Stored presence state for one peer in one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub peer_id: String,
    pub status: PresenceStatus,
    pub last_active_at: u64,
}

impl From<PresenceMeta> for PresenceRecord {
    fn from(meta: PresenceMeta) -> Self {
        Self {
            peer_id: meta.peer_id,
            status: meta.status,
            last_active_at: meta.last_active_at,
        }
    }
}

/// Maintains peer → presence record per room and notifies the UI on change.
pub struct PresenceTracker {
    local_user: String,
    cfg: PresenceConfig,
    rooms: DashMap<RoomKey, HashMap<String, PresenceRecord>>,
    events: UnboundedSender<SessionEvent>,
}

impl PresenceTracker {
    pub fn new(
        local_user: impl Into<String>,
        cfg: PresenceConfig,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            local_user: local_user.into(),
            cfg,
            rooms: DashMap::new(),
            events,
        }
    }

    /// Replace the room's peer set with the synced snapshot and emit one
    /// change event per peer whose record actually differs.
    pub fn handle_sync(&self, room: &RoomKey, peers: Vec<PresenceMeta>) {
        let fresh: HashMap<String, PresenceRecord> = peers
            .into_iter()
            .filter(|meta| meta.peer_id != self.local_user)
            .map(|meta| (meta.peer_id.clone(), PresenceRecord::from(meta)))
            .collect();

        let old = self
            .rooms
            .insert(room.clone(), fresh.clone())
            .unwrap_or_default();

        for (peer_id, record) in &fresh {
            if old.get(peer_id) != Some(record) {
                self.emit_change(room, peer_id, Some(record.clone()));
            }
        }
        for peer_id in old.keys() {
            if !fresh.contains_key(peer_id) {
                self.emit_change(room, peer_id, None);
            }
        }

        tracing::debug!(room = %room, peers = fresh.len(), "Presence synced");
    }

    /// Add or update one peer without disturbing the rest of the room.
    pub fn handle_join(&self, room: &RoomKey, peer: PresenceMeta) {
        if peer.peer_id == self.local_user {
            return;
        }
        let record = PresenceRecord::from(peer);
        let mut entry = self.rooms.entry(room.clone()).or_default();
        let changed = entry.get(&record.peer_id) != Some(&record);
        let peer_id = record.peer_id.clone();
        entry.insert(peer_id.clone(), record.clone());
        drop(entry);

        if changed {
            tracing::debug!(room = %room, peer = %peer_id, "Peer joined");
            self.emit_change(room, &peer_id, Some(record));
        }
    }

    /// Remove exactly the departing peer.
    pub fn handle_leave(&self, room: &RoomKey, peer_id: &str) {
        let removed = self
            .rooms
            .get_mut(room)
            .map(|mut entry| entry.remove(peer_id).is_some())
            .unwrap_or(false);

        if removed {
            tracing::debug!(room = %room, peer = %peer_id, "Peer left");
            self.emit_change(room, peer_id, None);
        }
    }

    /// Drop all state for a room whose channel closed or failed.
    pub fn handle_channel_closed(&self, room: &RoomKey) {
        if let Some((_, peers)) = self.rooms.remove(room) {
            for peer_id in peers.keys() {
                self.emit_change(room, peer_id, None);
            }
        }
    }

    /// Current record for a peer, with Away derived from idle time.
    ///
    /// A peer present in several rooms reports its most recently active
    /// record.
    pub fn get_status(&self, peer_id: &str) -> Option<PresenceRecord> {
        let mut best: Option<PresenceRecord> = None;
        for entry in self.rooms.iter() {
            if let Some(record) = entry.value().get(peer_id) {
                if best
                    .as_ref()
                    .map(|b| record.last_active_at > b.last_active_at)
                    .unwrap_or(true)
                {
                    best = Some(record.clone());
                }
            }
        }
        best.map(|record| self.derive_away(record))
    }

    fn derive_away(&self, mut record: PresenceRecord) -> PresenceRecord {
        if record.status == PresenceStatus::Online {
            let idle = epoch_millis().saturating_sub(record.last_active_at);
            if idle > self.cfg.away_threshold_ms {
                record.status = PresenceStatus::Away;
            }
        }
        record
    }

    fn emit_change(&self, room: &RoomKey, peer_id: &str, record: Option<PresenceRecord>) {
        let _ = self.events.send(SessionEvent::PresenceChanged {
            room: room.clone(),
            peer_id: peer_id.to_string(),
            record,
        });
    }
}
