//! Friend-list driven room reconciliation
//!
//! Watches the external friend-list collaborator's peer set and keeps the
//! registry's acquired rooms equal to `{room(local, peer)}`. Duplicate
//! membership notifications are no-ops; teardown releases every held grant.

use crate::error::MuxError;
use crate::protocol::RoomKey;
use crate::registry::{ChannelGrant, ChannelRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Reconciles the desired room set against acquired channels.
pub struct RoomMembershipWatcher {
    registry: Arc<ChannelRegistry>,
    local_user: String,
    held: Mutex<HashMap<RoomKey, ChannelGrant>>,
    /// Bumped on shutdown so an acquire still in flight cannot apply its
    /// resolution to discarded state.
    generation: AtomicU64,
}

impl RoomMembershipWatcher {
    pub fn new(registry: Arc<ChannelRegistry>, local_user: impl Into<String>) -> Self {
        Self {
            registry,
            local_user: local_user.into(),
            held: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Reconcile against the current peer set: acquire rooms for new peers,
    /// release rooms for removed ones. Rooms the registry evicted after a
    /// failure are re-acquired here (the auto-retry pass).
    pub async fn sync_peers(&self, peers: &HashSet<String>) {
        let generation = self.generation.load(Ordering::Acquire);
        let desired: HashSet<RoomKey> = peers
            .iter()
            .filter(|peer| **peer != self.local_user)
            .map(|peer| RoomKey::for_pair(&self.local_user, peer))
            .collect();

        let mut held = self.held.lock().await;

        // Removed friends first.
        let gone: Vec<RoomKey> = held
            .keys()
            .filter(|room| !desired.contains(*room))
            .cloned()
            .collect();
        for room in gone {
            if let Some(grant) = held.remove(&room) {
                tracing::info!(room = %room, "Peer removed, releasing room");
                self.registry.release(grant).await;
            }
        }

        // Drop grants for rooms the registry evicted behind our back so the
        // acquire below starts fresh.
        let stale: Vec<RoomKey> = held
            .keys()
            .filter(|room| !self.registry.is_tracked(room))
            .cloned()
            .collect();
        for room in stale {
            held.remove(&room);
        }

        for room in desired {
            if held.contains_key(&room) {
                continue;
            }
            match self.registry.acquire(room.clone()).await {
                Ok(grant) => {
                    if self.generation.load(Ordering::Acquire) != generation {
                        // Torn down while subscribing; do not keep the grant.
                        self.registry.release(grant).await;
                        return;
                    }
                    held.insert(room, grant);
                }
                Err(MuxError::ChannelUnavailable { room, reason }) => {
                    tracing::warn!(
                        room = %room,
                        reason = %reason,
                        "Room unavailable, will retry on next reconciliation"
                    );
                }
                Err(err) => {
                    tracing::warn!(room = %room, error = %err, "Acquire failed");
                }
            }
        }
    }

    /// Drive reconciliation from a reactive peer-set feed.
    pub fn watch(
        self: Arc<Self>,
        mut feed: watch::Receiver<HashSet<String>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let initial = feed.borrow_and_update().clone();
            self.sync_peers(&initial).await;
            while feed.changed().await.is_ok() {
                let peers = feed.borrow_and_update().clone();
                self.sync_peers(&peers).await;
            }
        })
    }

    /// Release every held grant. No subscription survives this call.
    pub async fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let grants: Vec<ChannelGrant> = {
            let mut held = self.held.lock().await;
            held.drain().map(|(_, grant)| grant).collect()
        };
        let count = grants.len();
        futures::future::join_all(
            grants
                .into_iter()
                .map(|grant| self.registry.release(grant)),
        )
        .await;
        if count > 0 {
            tracing::info!(released = count, "Membership watcher torn down");
        }
    }

    /// Rooms currently held (test and debugging aid).
    pub async fn held_rooms(&self) -> HashSet<RoomKey> {
        self.held.lock().await.keys().cloned().collect()
    }
}
