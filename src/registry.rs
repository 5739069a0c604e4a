//! Refcounted channel registry
//!
//! Owns at most one transport subscription per room. Concurrent acquires for
//! the same room while a subscribe is in flight queue behind it instead of
//! issuing a second subscribe; the last release tears the channel down.

use crate::config::SubscribeConfig;
use crate::error::{MuxError, TransportError};
use crate::protocol::{
    epoch_millis, ChannelEvent, ChannelStatus, PresenceMeta, PresenceStatus, RoomKey,
    SignalMessage,
};
use crate::transport::{RealtimeTransport, TransportHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{broadcast, oneshot};

/// Consumer-side token for one acquired room channel. Consumed by
/// [`ChannelRegistry::release`]; deliberately not `Clone`.
#[derive(Debug)]
pub struct ChannelGrant {
    room: RoomKey,
}

impl ChannelGrant {
    pub fn room(&self) -> &RoomKey {
        &self.room
    }
}

/// Channel lifecycle notification for the consumers.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub room: RoomKey,
    pub status: ChannelStatus,
}

enum ChannelState {
    /// First acquire is subscribing; later acquires park a waiter here.
    Connecting {
        waiters: Vec<oneshot::Sender<Result<ChannelGrant, MuxError>>>,
    },
    Subscribed { handle: TransportHandle },
}

struct ChannelEntry {
    refcount: usize,
    state: ChannelState,
}

/// Owns the room → channel table and every transport subscription in it.
pub struct ChannelRegistry {
    transport: Arc<dyn RealtimeTransport>,
    cfg: SubscribeConfig,
    local_user: String,
    rooms: DashMap<RoomKey, ChannelEntry>,
    /// Shared feed every subscription delivers into; owned by the session.
    events: UnboundedSender<ChannelEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    /// Epoch millis of the last local activity, published in presence metas.
    last_activity: AtomicU64,
}

impl ChannelRegistry {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        local_user: impl Into<String>,
        cfg: SubscribeConfig,
        events: UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(64);
        Self {
            transport,
            cfg,
            local_user: local_user.into(),
            rooms: DashMap::new(),
            events,
            lifecycle,
            last_activity: AtomicU64::new(epoch_millis()),
        }
    }

    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Record local activity; the next presence publish carries it.
    pub fn touch_activity(&self) {
        self.last_activity.store(epoch_millis(), Ordering::Relaxed);
    }

    /// Acquire the channel for `room`, subscribing if nobody holds it yet.
    ///
    /// Resolves once the channel is Subscribed. Exactly one transport
    /// subscribe is issued per room no matter how many consumers call this
    /// concurrently.
    pub async fn acquire(&self, room: RoomKey) -> Result<ChannelGrant, MuxError> {
        enum Action {
            Ready,
            Wait(oneshot::Receiver<Result<ChannelGrant, MuxError>>),
            Subscribe,
        }

        let action = match self.rooms.entry(room.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.refcount += 1;
                match &mut entry.state {
                    ChannelState::Subscribed { .. } => Action::Ready,
                    ChannelState::Connecting { waiters } => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Action::Wait(rx)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ChannelEntry {
                    refcount: 1,
                    state: ChannelState::Connecting { waiters: Vec::new() },
                });
                Action::Subscribe
            }
        };

        match action {
            Action::Ready => {
                tracing::debug!(room = %room, "Acquire joined live channel");
                Ok(ChannelGrant { room })
            }
            Action::Wait(rx) => rx.await.unwrap_or_else(|_| {
                Err(MuxError::ChannelUnavailable {
                    room,
                    reason: "subscribe attempt dropped".into(),
                })
            }),
            Action::Subscribe => self.subscribe_with_retry(room).await,
        }
    }

    /// Release one grant. At refcount zero the channel is untracked,
    /// unsubscribed, and evicted. Releasing a room the registry already
    /// evicted is a no-op.
    pub async fn release(&self, grant: ChannelGrant) {
        let ChannelGrant { room } = grant;

        let now_zero = match self.rooms.get_mut(&room) {
            None => return,
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
        };
        if !now_zero {
            return;
        }

        let evicted = self.rooms.remove_if(&room, |_, entry| entry.refcount == 0);
        if let Some((_, entry)) = evicted {
            if let ChannelState::Subscribed { handle } = entry.state {
                if let Err(err) = self.transport.untrack(&handle).await {
                    tracing::warn!(room = %room, error = %err, "Untrack failed during release");
                }
                if let Err(err) = self.transport.unsubscribe(handle).await {
                    tracing::warn!(room = %room, error = %err, "Unsubscribe failed during release");
                }
            }
            self.emit(&room, ChannelStatus::Closed);
            tracing::info!(room = %room, "Channel released and evicted");
        }
    }

    /// Evict every entry: unsubscribe live channels, fail parked waiters.
    ///
    /// Final teardown sweep. Also catches a channel whose acquire was
    /// cancelled after its subscribe landed but before the grant reached the
    /// holder, so teardown never leaves a live subscription behind.
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomKey> = self.rooms.iter().map(|e| e.key().clone()).collect();
        for room in rooms {
            let Some((_, entry)) = self.rooms.remove(&room) else {
                continue;
            };
            match entry.state {
                ChannelState::Subscribed { handle } => {
                    if let Err(err) = self.transport.untrack(&handle).await {
                        tracing::warn!(room = %room, error = %err, "Untrack failed during shutdown");
                    }
                    if let Err(err) = self.transport.unsubscribe(handle).await {
                        tracing::warn!(room = %room, error = %err, "Unsubscribe failed during shutdown");
                    }
                }
                ChannelState::Connecting { waiters } => {
                    for waiter in waiters {
                        let _ = waiter.send(Err(MuxError::ChannelUnavailable {
                            room: room.clone(),
                            reason: "session shut down".into(),
                        }));
                    }
                }
            }
            self.emit(&room, ChannelStatus::Closed);
        }
    }

    /// Broadcast a signaling message on the room's channel.
    pub async fn send(&self, room: &RoomKey, message: &SignalMessage) -> Result<(), MuxError> {
        let handle = self.subscribed_handle(room).ok_or_else(|| MuxError::ChannelUnavailable {
            room: room.clone(),
            reason: "no subscribed channel".into(),
        })?;
        self.transport
            .send(&handle, message)
            .await
            .map_err(MuxError::from)?;
        tracing::debug!(room = %room, event = message.event_name(), "Broadcast sent");
        Ok(())
    }

    /// Re-publish the local presence meta on every live channel (heartbeat).
    pub async fn refresh_presence(&self) {
        let meta = self.local_meta();
        for handle in self.subscribed_handles() {
            if let Err(err) = self.transport.track(&handle, &meta).await {
                tracing::warn!(channel = %handle.channel, error = %err, "Presence refresh failed");
            }
        }
    }

    /// Apply a transport status change for `room`.
    ///
    /// A `Failed` or `Closed` status evicts the entry so a later acquire
    /// starts fresh; any parked waiters are failed with `ChannelUnavailable`.
    pub async fn handle_status(&self, room: &RoomKey, status: ChannelStatus) {
        match status {
            ChannelStatus::Failed | ChannelStatus::Closed => {
                if let Some((_, entry)) = self.rooms.remove(room) {
                    if let ChannelState::Connecting { waiters } = entry.state {
                        for waiter in waiters {
                            let _ = waiter.send(Err(MuxError::ChannelUnavailable {
                                room: room.clone(),
                                reason: format!("transport reported {status:?}"),
                            }));
                        }
                    }
                    self.emit(room, status);
                    tracing::warn!(room = %room, status = ?status, "Channel evicted on transport status");
                }
            }
            ChannelStatus::Connecting | ChannelStatus::Subscribed => {}
        }
    }

    /// Whether `room` currently has a Subscribed channel.
    pub fn is_active(&self, room: &RoomKey) -> bool {
        self.subscribed_handle(room).is_some()
    }

    /// Whether `room` has a live entry at all (Connecting or Subscribed).
    pub fn is_tracked(&self, room: &RoomKey) -> bool {
        self.rooms.contains_key(room)
    }

    /// Rooms with a live (Connecting or Subscribed) entry.
    pub fn tracked_rooms(&self) -> Vec<RoomKey> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    fn local_meta(&self) -> PresenceMeta {
        PresenceMeta {
            peer_id: self.local_user.clone(),
            status: PresenceStatus::Online,
            last_active_at: self.last_activity.load(Ordering::Relaxed),
        }
    }

    async fn subscribe_with_retry(&self, room: RoomKey) -> Result<ChannelGrant, MuxError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .transport
                .subscribe(room.as_str(), self.events.clone())
                .await
            {
                Ok(handle) => return self.finish_subscribe(room, handle).await,
                Err(err) if attempt < self.cfg.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        room = %room,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Subscribe failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return self.fail_subscribe(room, err),
            }
        }
    }

    async fn finish_subscribe(
        &self,
        room: RoomKey,
        handle: TransportHandle,
    ) -> Result<ChannelGrant, MuxError> {
        enum Outcome {
            Ready(Vec<oneshot::Sender<Result<ChannelGrant, MuxError>>>),
            Duplicate,
            Evicted,
        }

        let outcome = match self.rooms.get_mut(&room) {
            Some(mut entry) => match std::mem::replace(
                &mut entry.state,
                ChannelState::Subscribed {
                    handle: handle.clone(),
                },
            ) {
                ChannelState::Connecting { waiters } => Outcome::Ready(waiters),
                ChannelState::Subscribed { .. } => Outcome::Duplicate,
            },
            None => Outcome::Evicted,
        };

        let waiters = match outcome {
            Outcome::Ready(waiters) => waiters,
            // Dedup broke: a subscribe completed for a room that was
            // already live. Should be unreachable.
            Outcome::Duplicate => {
                debug_assert!(false, "duplicate subscribe for {room}");
                tracing::error!(room = %room, "Duplicate subscribe detected");
                return Err(MuxError::DuplicateSubscribe(room));
            }
            // Evicted while the subscribe was in flight (shutdown or a
            // transport failure race); do not resurrect it.
            Outcome::Evicted => {
                let _ = self.transport.unsubscribe(handle).await;
                return Err(MuxError::ChannelUnavailable {
                    room,
                    reason: "evicted during subscribe".into(),
                });
            }
        };

        for waiter in waiters {
            let _ = waiter.send(Ok(ChannelGrant { room: room.clone() }));
        }

        if let Err(err) = self.transport.track(&handle, &self.local_meta()).await {
            tracing::warn!(room = %room, error = %err, "Initial presence track failed");
        }

        self.emit(&room, ChannelStatus::Subscribed);
        tracing::info!(room = %room, channel = %handle.channel, "Channel subscribed");
        Ok(ChannelGrant { room })
    }

    fn fail_subscribe(&self, room: RoomKey, err: TransportError) -> Result<ChannelGrant, MuxError> {
        if let Some((_, entry)) = self.rooms.remove(&room) {
            if let ChannelState::Connecting { waiters } = entry.state {
                for waiter in waiters {
                    let _ = waiter.send(Err(MuxError::ChannelUnavailable {
                        room: room.clone(),
                        reason: err.to_string(),
                    }));
                }
            }
        }
        self.emit(&room, ChannelStatus::Failed);
        tracing::warn!(room = %room, error = %err, "Subscribe retries exhausted");
        Err(MuxError::ChannelUnavailable {
            room,
            reason: err.to_string(),
        })
    }

    fn subscribed_handle(&self, room: &RoomKey) -> Option<TransportHandle> {
        self.rooms.get(room).and_then(|entry| match &entry.state {
            ChannelState::Subscribed { handle } => Some(handle.clone()),
            ChannelState::Connecting { .. } => None,
        })
    }

    fn subscribed_handles(&self) -> Vec<TransportHandle> {
        self.rooms
            .iter()
            .filter_map(|entry| match &entry.state {
                ChannelState::Subscribed { handle } => Some(handle.clone()),
                ChannelState::Connecting { .. } => None,
            })
            .collect()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .cfg
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16).saturating_sub(1))
            .min(self.cfg.backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=exp / 4 + 1);
        Duration::from_millis(exp + jitter)
    }

    fn emit(&self, room: &RoomKey, status: ChannelStatus) {
        let _ = self.lifecycle.send(LifecycleEvent {
            room: room.clone(),
            status,
        });
    }
}
