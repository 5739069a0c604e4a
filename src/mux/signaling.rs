//! Call-offer routing and arbitration
//!
//! One state machine per local user: `Idle → OfferPending → terminal → Idle`.
//! At most one incoming offer is ever pending; a second caller gets an
//! automatic busy reject while the first offer stays authoritative. Every
//! terminal transition broadcasts exactly one message back to the caller's
//! room; entering OfferPending is receive-only.

use crate::config::CallConfig;
use crate::error::MuxError;
use crate::mux::SessionEvent;
use crate::protocol::{epoch_millis, CallOffer, RejectReason, RoomKey, SignalMessage};
use crate::registry::ChannelRegistry;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct PendingOffer {
    offer: CallOffer,
    timeout: JoinHandle<()>,
}

/// Routes call broadcasts and arbitrates the single pending incoming offer.
pub struct SignalingRouter {
    registry: Arc<ChannelRegistry>,
    cfg: CallConfig,
    pending: Mutex<Option<PendingOffer>>,
    /// Offers we placed and are still waiting on.
    outgoing: Mutex<HashSet<Uuid>>,
    offer_tx: watch::Sender<Option<CallOffer>>,
    events: UnboundedSender<SessionEvent>,
    /// Handed to timeout tasks so they outlive nothing.
    weak: Weak<Self>,
}

impl SignalingRouter {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        cfg: CallConfig,
        events: UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let (offer_tx, _) = watch::channel(None);
        Arc::new_cyclic(|weak| Self {
            registry,
            cfg,
            pending: Mutex::new(None),
            outgoing: Mutex::new(HashSet::new()),
            offer_tx,
            events,
            weak: weak.clone(),
        })
    }

    /// Observable pending incoming offer (`None` when idle).
    pub fn incoming_call(&self) -> watch::Receiver<Option<CallOffer>> {
        self.offer_tx.subscribe()
    }

    pub async fn pending_offer(&self) -> Option<CallOffer> {
        self.pending.lock().await.as_ref().map(|p| p.offer.clone())
    }

    /// Apply a remote call broadcast.
    pub async fn handle_remote(&self, message: &SignalMessage) {
        match message {
            SignalMessage::CallRequest {
                room,
                sender,
                callee,
                offer_id,
                issued_at,
            } => {
                if callee != self.registry.local_user() {
                    return;
                }
                self.handle_request(room, sender, *offer_id, *issued_at).await;
            }
            SignalMessage::CallEnd { room, offer_id, .. } => {
                self.handle_end(room, *offer_id).await;
            }
            SignalMessage::CallAccepted { offer_id, .. } => {
                self.handle_answer(*offer_id, true, None).await;
            }
            SignalMessage::CallRejected {
                offer_id, reason, ..
            } => {
                self.handle_answer(*offer_id, false, Some(*reason)).await;
            }
            SignalMessage::TypingStart { .. } | SignalMessage::TypingStop { .. } => {}
        }
    }

    /// Accept or decline the pending offer. Returns the offer so an accept
    /// can be handed off to the call layer; `Ok(None)` when nothing was
    /// pending (the offer may have just timed out).
    pub async fn respond(&self, accept: bool) -> Result<Option<CallOffer>, MuxError> {
        let taken = {
            let mut pending = self.pending.lock().await;
            pending.take()
        };
        let Some(PendingOffer { offer, timeout }) = taken else {
            return Ok(None);
        };
        timeout.abort();
        self.offer_tx.send_replace(None);

        let reply = if accept {
            SignalMessage::CallAccepted {
                room: offer.room.clone(),
                sender: self.registry.local_user().to_string(),
                offer_id: offer.offer_id,
                issued_at: epoch_millis(),
            }
        } else {
            SignalMessage::CallRejected {
                room: offer.room.clone(),
                sender: self.registry.local_user().to_string(),
                offer_id: offer.offer_id,
                reason: RejectReason::Declined,
                issued_at: epoch_millis(),
            }
        };
        self.registry.send(&offer.room, &reply).await?;

        tracing::info!(
            offer = %offer.offer_id,
            caller = %offer.caller,
            accepted = accept,
            "Responded to call offer"
        );
        Ok(Some(offer))
    }

    /// Place an outgoing call to `callee`.
    pub async fn place_call(&self, callee: &str) -> Result<CallOffer, MuxError> {
        let local = self.registry.local_user().to_string();
        let offer = CallOffer {
            room: RoomKey::for_pair(&local, callee),
            caller: local.clone(),
            callee: callee.to_string(),
            offer_id: Uuid::new_v4(),
            issued_at: epoch_millis(),
        };
        let request = SignalMessage::CallRequest {
            room: offer.room.clone(),
            sender: local,
            callee: offer.callee.clone(),
            offer_id: offer.offer_id,
            issued_at: offer.issued_at,
        };
        self.registry.send(&offer.room, &request).await?;
        self.outgoing.lock().await.insert(offer.offer_id);

        // The callee may be offline and never answer at all; expire the
        // offer locally so the set stays bounded and the UI is told.
        let router = self.weak.clone();
        // Anchor the deadline at placement time, before the task is polled.
        let sleep = tokio::time::sleep(self.cfg.answer_timeout());
        let offer_id = offer.offer_id;
        tokio::spawn(async move {
            sleep.await;
            if let Some(router) = router.upgrade() {
                router.on_outgoing_timeout(offer_id).await;
            }
        });

        tracing::info!(offer = %offer.offer_id, callee = %callee, "Call placed");
        Ok(offer)
    }

    /// Clear any pending offer and its timer.
    pub async fn shutdown(&self) {
        if let Some(PendingOffer { timeout, .. }) = self.pending.lock().await.take() {
            timeout.abort();
        }
        self.offer_tx.send_replace(None);
        self.outgoing.lock().await.clear();
    }

    async fn handle_request(
        &self,
        room: &RoomKey,
        caller: &str,
        offer_id: Uuid,
        issued_at: u64,
    ) {
        let mut pending = self.pending.lock().await;
        match pending.as_ref() {
            Some(existing) if existing.offer.offer_id == offer_id => {
                tracing::debug!(offer = %offer_id, "Duplicate call_request ignored");
            }
            Some(existing) => {
                // First offer stays authoritative; the newcomer gets busy.
                tracing::info!(
                    offer = %offer_id,
                    caller = %caller,
                    pending = %existing.offer.offer_id,
                    "Busy, auto-rejecting second offer"
                );
                let busy = SignalMessage::CallRejected {
                    room: room.clone(),
                    sender: self.registry.local_user().to_string(),
                    offer_id,
                    reason: RejectReason::Busy,
                    issued_at: epoch_millis(),
                };
                if let Err(err) = self.registry.send(room, &busy).await {
                    tracing::warn!(room = %room, error = %err, "Busy reject failed to send");
                }
            }
            None => {
                let offer = CallOffer {
                    room: room.clone(),
                    caller: caller.to_string(),
                    callee: self.registry.local_user().to_string(),
                    offer_id,
                    issued_at,
                };
                let router = self.weak.clone();
                let delay = self.cfg.answer_timeout();
                let timeout = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(router) = router.upgrade() {
                        router.on_timeout(offer_id).await;
                    }
                });
                *pending = Some(PendingOffer {
                    offer: offer.clone(),
                    timeout,
                });
                self.offer_tx.send_replace(Some(offer));
                tracing::info!(offer = %offer_id, caller = %caller, "Incoming call offer");
            }
        }
    }

    async fn handle_end(&self, room: &RoomKey, offer_id: Uuid) {
        let taken = {
            let mut pending = self.pending.lock().await;
            match pending.as_ref() {
                Some(existing) if existing.offer.offer_id == offer_id => pending.take(),
                _ => None,
            }
        };
        let Some(PendingOffer { offer, timeout }) = taken else {
            tracing::debug!(offer = %offer_id, "Stale call_end ignored");
            return;
        };
        timeout.abort();
        self.offer_tx.send_replace(None);

        let ack = SignalMessage::CallRejected {
            room: offer.room.clone(),
            sender: self.registry.local_user().to_string(),
            offer_id,
            reason: RejectReason::Declined,
            issued_at: epoch_millis(),
        };
        if let Err(err) = self.registry.send(room, &ack).await {
            tracing::warn!(room = %room, error = %err, "Call end ack failed to send");
        }
        tracing::info!(offer = %offer_id, "Caller ended pending offer");
    }

    async fn handle_answer(&self, offer_id: Uuid, accepted: bool, reason: Option<RejectReason>) {
        let known = self.outgoing.lock().await.remove(&offer_id);
        if !known {
            tracing::debug!(offer = %offer_id, "Stale call answer ignored");
            return;
        }
        // A busy/no_answer reject means the call could not connect; the UI
        // surfaces it via this event instead of hanging.
        let _ = self.events.send(SessionEvent::CallAnswered {
            offer_id,
            accepted,
            reason,
        });
        tracing::info!(offer = %offer_id, accepted, reason = ?reason, "Outgoing call answered");
    }

    async fn on_outgoing_timeout(&self, offer_id: Uuid) {
        if !self.outgoing.lock().await.remove(&offer_id) {
            return;
        }
        let _ = self.events.send(SessionEvent::CallAnswered {
            offer_id,
            accepted: false,
            reason: Some(RejectReason::NoAnswer),
        });
        tracing::info!(offer = %offer_id, "Outgoing call went unanswered");
    }

    async fn on_timeout(&self, offer_id: Uuid) {
        let taken = {
            let mut pending = self.pending.lock().await;
            match pending.as_ref() {
                Some(existing) if existing.offer.offer_id == offer_id => pending.take(),
                _ => None,
            }
        };
        let Some(PendingOffer { offer, .. }) = taken else {
            return;
        };
        self.offer_tx.send_replace(None);

        let reply = SignalMessage::CallRejected {
            room: offer.room.clone(),
            sender: self.registry.local_user().to_string(),
            offer_id,
            reason: RejectReason::NoAnswer,
            issued_at: epoch_millis(),
        };
        if let Err(err) = self.registry.send(&offer.room, &reply).await {
            tracing::warn!(room = %offer.room, error = %err, "No-answer reply failed to send");
        }
        tracing::info!(offer = %offer_id, caller = %offer.caller, "Call offer timed out");
    }
}
