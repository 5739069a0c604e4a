//! Presence session composition
//!
//! One `PresenceSession` instance owns the registry, the three channel
//! consumers, the membership watcher, and every background task. It is an
//! explicit object with init/teardown, never a process-wide singleton, so
//! tests and multi-account hosts can run independent sessions.

use crate::config::Config;
use crate::error::MuxError;
use crate::mux::{
    PresenceRecord, PresenceTracker, RoomMembershipWatcher, SessionEvent, SignalingRouter,
    TypingCoordinator,
};
use crate::protocol::{CallOffer, ChannelEvent, ChannelStatus, RoomKey, SignalMessage};
use crate::registry::{ChannelRegistry, LifecycleEvent};
use crate::transport::RealtimeTransport;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// The composed presence / typing / call-signaling subsystem for one local
/// user and one transport connection.
pub struct PresenceSession {
    registry: Arc<ChannelRegistry>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingCoordinator>,
    signaling: Arc<SignalingRouter>,
    membership: Arc<RoomMembershipWatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PresenceSession {
    /// Build the subsystem and spawn its background tasks (event pump,
    /// typing sweep, presence heartbeat). Returns the session and the UI
    /// event stream. Must run inside a tokio runtime.
    pub fn start(
        local_user: impl Into<String>,
        transport: Arc<dyn RealtimeTransport>,
        config: Config,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let local_user = local_user.into();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(ChannelRegistry::new(
            transport,
            local_user.clone(),
            config.subscribe.clone(),
            channel_tx,
        ));
        let presence = Arc::new(PresenceTracker::new(
            local_user.clone(),
            config.presence.clone(),
            ui_tx.clone(),
        ));
        let typing = Arc::new(TypingCoordinator::new(
            registry.clone(),
            config.typing.clone(),
            ui_tx.clone(),
        ));
        let signaling = SignalingRouter::new(registry.clone(), config.call.clone(), ui_tx);
        let membership = Arc::new(RoomMembershipWatcher::new(
            registry.clone(),
            local_user.clone(),
        ));

        let mut tasks = Vec::new();
        tasks.push(Self::spawn_pump(
            local_user,
            channel_rx,
            registry.clone(),
            presence.clone(),
            typing.clone(),
            signaling.clone(),
        ));
        tasks.push(Self::spawn_typing_sweep(typing.clone(), &config));
        tasks.push(Self::spawn_heartbeat(registry.clone(), &config));

        let session = Arc::new(Self {
            registry,
            presence,
            typing,
            signaling,
            membership,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        });
        tracing::info!("Presence session started");
        (session, ui_rx)
    }

    /// Drive room membership from the friend-list collaborator's feed.
    pub async fn watch_membership(&self, feed: watch::Receiver<HashSet<String>>) {
        let handle = self.membership.clone().watch(feed);
        self.tasks.lock().await.push(handle);
    }

    /// One-shot membership reconciliation (also the retry path after a room
    /// came up unavailable).
    pub async fn sync_peers(&self, peers: &HashSet<String>) -> Result<(), MuxError> {
        self.ensure_open()?;
        self.membership.sync_peers(peers).await;
        Ok(())
    }

    /// Presence of a peer, with Away derived from idle time.
    pub fn get_presence(&self, peer_id: &str) -> Option<PresenceRecord> {
        self.presence.get_status(peer_id)
    }

    /// Peers currently typing in `room`.
    pub fn is_typing(&self, room: &RoomKey) -> HashSet<String> {
        self.typing.typers(room)
    }

    /// Observable pending incoming call offer.
    pub fn incoming_call(&self) -> watch::Receiver<Option<CallOffer>> {
        self.signaling.incoming_call()
    }

    /// Report local composer state. Call on every keystroke; `has_content`
    /// is whether the input holds non-whitespace text.
    pub async fn report_local_typing(
        &self,
        room: &RoomKey,
        has_content: bool,
    ) -> Result<(), MuxError> {
        self.ensure_open()?;
        if has_content {
            self.registry.touch_activity();
        }
        self.typing.notify_local_input(room, has_content).await
    }

    /// Accept or decline the pending incoming call. On accept the returned
    /// offer is handed to the external call layer.
    pub async fn respond_to_call(&self, accept: bool) -> Result<Option<CallOffer>, MuxError> {
        self.ensure_open()?;
        self.signaling.respond(accept).await
    }

    /// Place an outgoing call to a friend.
    pub async fn place_call(&self, callee: &str) -> Result<CallOffer, MuxError> {
        self.ensure_open()?;
        self.signaling.place_call(callee).await
    }

    /// Record local user activity (any interaction, not just typing).
    pub fn touch_activity(&self) {
        self.registry.touch_activity();
    }

    /// Tear everything down: abort the background tasks, clear any pending
    /// call, release every room. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.signaling.shutdown().await;
        self.membership.shutdown().await;
        // An acquire the aborted watch task never got to record leaves its
        // channel owner-less; the registry sweep reclaims it.
        self.registry.shutdown().await;
        tracing::info!("Presence session shut down");
    }

    fn ensure_open(&self) -> Result<(), MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::SessionClosed);
        }
        Ok(())
    }

    fn spawn_pump(
        local_user: String,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        registry: Arc<ChannelRegistry>,
        presence: Arc<PresenceTracker>,
        typing: Arc<TypingCoordinator>,
        signaling: Arc<SignalingRouter>,
    ) -> JoinHandle<()> {
        let mut lifecycle = registry.lifecycle_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = channel_rx.recv() => {
                        let Some(event) = event else { break };
                        Self::dispatch(&local_user, event, &registry, &presence, &typing, &signaling)
                            .await;
                    }
                    lifecycle_event = lifecycle.recv() => {
                        match lifecycle_event {
                            Ok(LifecycleEvent { room, status }) => {
                                if matches!(status, ChannelStatus::Closed | ChannelStatus::Failed) {
                                    presence.handle_channel_closed(&room);
                                    typing.handle_channel_closed(&room);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "Lifecycle events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            tracing::debug!("Event pump stopped");
        })
    }

    async fn dispatch(
        local_user: &str,
        event: ChannelEvent,
        registry: &Arc<ChannelRegistry>,
        presence: &Arc<PresenceTracker>,
        typing: &Arc<TypingCoordinator>,
        signaling: &Arc<SignalingRouter>,
    ) {
        match event {
            ChannelEvent::PresenceSync { room, peers } => presence.handle_sync(&room, peers),
            ChannelEvent::PresenceJoin { room, peer } => presence.handle_join(&room, peer),
            ChannelEvent::PresenceLeave { room, peer_id } => {
                presence.handle_leave(&room, &peer_id)
            }
            ChannelEvent::StatusChange { room, status } => {
                registry.handle_status(&room, status).await
            }
            ChannelEvent::Broadcast { room, payload } => {
                let message: SignalMessage = match serde_json::from_value(payload) {
                    Ok(message) => message,
                    Err(err) => {
                        // Malformed payloads degrade to "not shown"; they
                        // never take the pump down.
                        tracing::warn!(room = %room, error = %err, "Malformed broadcast dropped");
                        return;
                    }
                };
                if message.sender() == local_user {
                    return; // own echo
                }
                match &message {
                    SignalMessage::TypingStart { .. } | SignalMessage::TypingStop { .. } => {
                        typing.handle_remote(&message)
                    }
                    _ => signaling.handle_remote(&message).await,
                }
            }
        }
    }

    fn spawn_typing_sweep(typing: Arc<TypingCoordinator>, config: &Config) -> JoinHandle<()> {
        let period = config.typing.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                typing.sweep();
            }
        })
    }

    fn spawn_heartbeat(registry: Arc<ChannelRegistry>, config: &Config) -> JoinHandle<()> {
        let period = config.presence.heartbeat_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                registry.refresh_presence().await;
            }
        })
    }
}
