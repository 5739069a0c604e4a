//! Typing indicator coordination
//!
//! Local side: a keystroke burst collapses into at most one `typing_start`
//! broadcast per debounce window, while `typing_stop` goes out immediately.
//! Remote side: every received `typing_start` refreshes a TTL entry, so a
//! peer that crashes mid-sentence stops showing as typing once the TTL
//! elapses even though no stop broadcast ever arrives.

use crate::config::TypingConfig;
use crate::error::MuxError;
use crate::mux::SessionEvent;
use crate::protocol::{epoch_millis, RoomKey, SignalMessage};
use crate::registry::ChannelRegistry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

struct LocalTyping {
    /// Whether we have announced typing for the current cycle.
    announced: bool,
    last_broadcast: Instant,
}

/// Derives local typing broadcasts and tracks who is typing remotely.
pub struct TypingCoordinator {
    registry: Arc<ChannelRegistry>,
    cfg: TypingConfig,
    local: DashMap<RoomKey, LocalTyping>,
    /// room → peer → expiry.
    remote: DashMap<RoomKey, HashMap<String, Instant>>,
    events: UnboundedSender<SessionEvent>,
}

impl TypingCoordinator {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        cfg: TypingConfig,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            registry,
            cfg,
            local: DashMap::new(),
            remote: DashMap::new(),
            events,
        }
    }

    /// Called on every local keystroke. `has_content` is whether the input
    /// currently holds any non-whitespace text; a room where it never does
    /// never broadcasts anything.
    pub async fn notify_local_input(
        &self,
        room: &RoomKey,
        has_content: bool,
    ) -> Result<(), MuxError> {
        if let Some(message) = self.local_transition(room, has_content) {
            self.registry.send(room, &message).await?;
        }
        Ok(())
    }

    /// Apply a remote typing broadcast.
    pub fn handle_remote(&self, message: &SignalMessage) {
        match message {
            SignalMessage::TypingStart { room, sender, .. } => {
                let expires = Instant::now() + self.cfg.ttl();
                let newly_typing = {
                    let mut entry = self.remote.entry(room.clone()).or_default();
                    entry.insert(sender.clone(), expires).is_none()
                };
                if newly_typing {
                    tracing::debug!(room = %room, peer = %sender, "Peer started typing");
                    self.emit(room);
                }
            }
            SignalMessage::TypingStop { room, sender, .. } => {
                let removed = self
                    .remote
                    .get_mut(room)
                    .map(|mut entry| entry.remove(sender).is_some())
                    .unwrap_or(false);
                if removed {
                    tracing::debug!(room = %room, peer = %sender, "Peer stopped typing");
                    self.emit(room);
                }
            }
            _ => {}
        }
    }

    /// Peers currently typing in `room`. Expired entries are filtered out
    /// here as well, so a read between sweeps never shows a stale typer.
    pub fn typers(&self, room: &RoomKey) -> HashSet<String> {
        let now = Instant::now();
        match self.remote.get_mut(room) {
            Some(mut entry) => {
                entry.retain(|_, expires| *expires > now);
                entry.keys().cloned().collect()
            }
            None => HashSet::new(),
        }
    }

    /// Evict expired typing entries and notify rooms whose set changed.
    pub fn sweep(&self) {
        let now = Instant::now();
        let rooms: Vec<RoomKey> = self.remote.iter().map(|e| e.key().clone()).collect();
        for room in rooms {
            let changed = self
                .remote
                .get_mut(&room)
                .map(|mut entry| {
                    let before = entry.len();
                    entry.retain(|_, expires| *expires > now);
                    entry.len() != before
                })
                .unwrap_or(false);
            if changed {
                self.emit(&room);
            }
        }
        self.remote.retain(|_, peers| !peers.is_empty());
    }

    /// Drop all typing state for a room whose channel closed or failed.
    pub fn handle_channel_closed(&self, room: &RoomKey) {
        self.local.remove(room);
        if let Some((_, peers)) = self.remote.remove(room) {
            if !peers.is_empty() {
                self.emit(room);
            }
        }
    }

    fn local_transition(&self, room: &RoomKey, has_content: bool) -> Option<SignalMessage> {
        let mut entry = self.local.entry(room.clone()).or_insert_with(|| LocalTyping {
            announced: false,
            last_broadcast: Instant::now(),
        });

        if has_content {
            let window_elapsed = entry.last_broadcast.elapsed() >= self.cfg.debounce();
            if entry.announced && !window_elapsed {
                return None;
            }
            entry.announced = true;
            entry.last_broadcast = Instant::now();
            Some(SignalMessage::TypingStart {
                room: room.clone(),
                sender: self.registry.local_user().to_string(),
                issued_at: epoch_millis(),
            })
        } else if entry.announced {
            // Stopping is low-latency: never debounced.
            entry.announced = false;
            Some(SignalMessage::TypingStop {
                room: room.clone(),
                sender: self.registry.local_user().to_string(),
                issued_at: epoch_millis(),
            })
        } else {
            None
        }
    }

    fn emit(&self, room: &RoomKey) {
        let typers = self
            .remote
            .get(room)
            .map(|entry| {
                let now = Instant::now();
                entry
                    .iter()
                    .filter(|(_, expires)| **expires > now)
                    .map(|(peer, _)| peer.clone())
                    .collect()
            })
            .unwrap_or_default();
        let _ = self.events.send(SessionEvent::TypingChanged {
            room: room.clone(),
            typers,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscribeConfig;
    use crate::error::TransportError;
    use crate::protocol::{ChannelEvent, PresenceMeta};
    use crate::transport::{RealtimeTransport, TransportHandle};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::{advance, Duration};

    struct NullTransport;

    #[async_trait]
    impl RealtimeTransport for NullTransport {
        async fn subscribe(
            &self,
            channel: &str,
            _events: mpsc::UnboundedSender<ChannelEvent>,
        ) -> Result<TransportHandle, TransportError> {
            Ok(TransportHandle::new(channel))
        }
        async fn send(
            &self,
            _handle: &TransportHandle,
            _message: &SignalMessage,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn track(
            &self,
            _handle: &TransportHandle,
            _payload: &PresenceMeta,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn untrack(&self, _handle: &TransportHandle) -> Result<(), TransportError> {
            Ok(())
        }
        async fn unsubscribe(&self, _handle: TransportHandle) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn coordinator() -> (TypingCoordinator, mpsc::UnboundedReceiver<SessionEvent>) {
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(NullTransport),
            "me",
            SubscribeConfig::default(),
            ev_tx,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TypingCoordinator::new(registry, TypingConfig::default(), tx),
            rx,
        )
    }

    fn start(room: &RoomKey, sender: &str) -> SignalMessage {
        SignalMessage::TypingStart {
            room: room.clone(),
            sender: sender.into(),
            issued_at: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_one_start() {
        let (typing, _rx) = coordinator();
        let room = RoomKey::for_pair("me", "x");

        let mut broadcasts = 0;
        for _ in 0..10 {
            if typing.local_transition(&room, true).is_some() {
                broadcasts += 1;
            }
        }
        assert_eq!(broadcasts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_immediate() {
        let (typing, _rx) = coordinator();
        let room = RoomKey::for_pair("me", "x");

        assert!(matches!(
            typing.local_transition(&room, true),
            Some(SignalMessage::TypingStart { .. })
        ));
        assert!(matches!(
            typing.local_transition(&room, false),
            Some(SignalMessage::TypingStop { .. })
        ));
        // Repeat stop with nothing announced: silent.
        assert!(typing.local_transition(&room, false).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_typing_rebroadcasts_each_window() {
        let (typing, _rx) = coordinator();
        let room = RoomKey::for_pair("me", "x");

        assert!(typing.local_transition(&room, true).is_some());
        assert!(typing.local_transition(&room, true).is_none());
        advance(Duration::from_millis(1_600)).await;
        assert!(typing.local_transition(&room, true).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_never_broadcasts() {
        let (typing, _rx) = coordinator();
        let room = RoomKey::for_pair("me", "x");
        assert!(typing.local_transition(&room, false).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_ttl_expires_without_stop() {
        let (typing, _rx) = coordinator();
        let room = RoomKey::for_pair("me", "x");

        typing.handle_remote(&start(&room, "x"));
        assert_eq!(typing.typers(&room).len(), 1);

        advance(Duration::from_millis(2_100)).await;
        assert!(typing.typers(&room).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_ttl() {
        let (typing, _rx) = coordinator();
        let room = RoomKey::for_pair("me", "x");

        typing.handle_remote(&start(&room, "x"));
        advance(Duration::from_millis(1_500)).await;
        typing.handle_remote(&start(&room, "x"));
        advance(Duration::from_millis(1_500)).await;
        // 3.0s after the first start, but only 1.5s after the refresh.
        assert_eq!(typing.typers(&room).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_emits_change_once() {
        let (typing, mut rx) = coordinator();
        let room = RoomKey::for_pair("me", "x");

        typing.handle_remote(&start(&room, "x"));
        let _ = rx.try_recv();

        advance(Duration::from_millis(2_100)).await;
        typing.sweep();
        match rx.try_recv() {
            Ok(SessionEvent::TypingChanged { typers, .. }) => assert!(typers.is_empty()),
            other => panic!("expected TypingChanged, got {other:?}"),
        }
        // Second sweep: nothing left to evict, no event.
        typing.sweep();
        assert!(rx.try_recv().is_err());
    }
}
