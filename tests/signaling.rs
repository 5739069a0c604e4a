mod common;

use common::{settle, MockTransport};
use pairwave_presence::{
    CallOffer, Config, MuxError, PresenceSession, RejectReason, RoomKey, SessionEvent,
    SignalMessage,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{advance, Duration};
use uuid::Uuid;

async fn session_with_friends(
    friends: &[&str],
) -> (
    Arc<PresenceSession>,
    Arc<MockTransport>,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    let transport = Arc::new(MockTransport::new());
    let (session, events) = PresenceSession::start("me", transport.clone(), Config::default());
    let peers: HashSet<String> = friends.iter().map(|f| f.to_string()).collect();
    session.sync_peers(&peers).await.unwrap();
    settle().await;
    (session, transport, events)
}

fn request(caller: &str, offer_id: Uuid) -> SignalMessage {
    SignalMessage::CallRequest {
        room: RoomKey::for_pair("me", caller),
        sender: caller.to_string(),
        callee: "me".to_string(),
        offer_id,
        issued_at: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn incoming_offer_becomes_observable() {
    let (session, transport, _events) = session_with_friends(&["ana"]).await;
    let mut incoming = session.incoming_call();
    let offer_id = Uuid::new_v4();

    transport.inject_broadcast(&request("ana", offer_id));
    settle().await;

    let offer = incoming.borrow_and_update().clone().unwrap();
    assert_eq!(offer.caller, "ana");
    assert_eq!(offer.offer_id, offer_id);
    // Entering OfferPending is receive-only: nothing was broadcast.
    assert!(transport.sent_messages().is_empty());
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_caller_gets_busy_and_first_stays_pending() {
    let (session, transport, _events) = session_with_friends(&["ana", "ben"]).await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    transport.inject_broadcast(&request("ana", first));
    settle().await;
    transport.inject_broadcast(&request("ben", second));
    settle().await;

    let busy: Vec<_> = transport
        .sent_messages()
        .into_iter()
        .filter(|m| {
            matches!(
                m,
                SignalMessage::CallRejected {
                    reason: RejectReason::Busy,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(busy.len(), 1);
    match &busy[0] {
        SignalMessage::CallRejected { offer_id, room, .. } => {
            assert_eq!(*offer_id, second);
            assert_eq!(*room, RoomKey::for_pair("me", "ben"));
        }
        _ => unreachable!(),
    }

    // First offer remains authoritative.
    let pending = session.incoming_call().borrow().clone().unwrap();
    assert_eq!(pending.offer_id, first);
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn accept_broadcasts_and_clears_pending() {
    let (session, transport, _events) = session_with_friends(&["ana"]).await;
    let offer_id = Uuid::new_v4();
    transport.inject_broadcast(&request("ana", offer_id));
    settle().await;

    let accepted: Option<CallOffer> = session.respond_to_call(true).await.unwrap();
    assert_eq!(accepted.unwrap().offer_id, offer_id);
    assert_eq!(transport.sent_count("call_accepted"), 1);
    assert!(session.incoming_call().borrow().is_none());

    // Responding again with nothing pending is a quiet no-op.
    assert!(session.respond_to_call(true).await.unwrap().is_none());
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reject_sends_declined() {
    let (session, transport, _events) = session_with_friends(&["ana"]).await;
    transport.inject_broadcast(&request("ana", Uuid::new_v4()));
    settle().await;

    session.respond_to_call(false).await.unwrap();
    let sent = transport.sent_messages();
    assert!(sent.iter().any(|m| matches!(
        m,
        SignalMessage::CallRejected {
            reason: RejectReason::Declined,
            ..
        }
    )));
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_times_out_as_no_answer() {
    let (session, transport, _events) = session_with_friends(&["ana"]).await;
    transport.inject_broadcast(&request("ana", Uuid::new_v4()));
    settle().await;
    assert!(session.incoming_call().borrow().is_some());

    advance(Duration::from_millis(30_500)).await;
    settle().await;

    assert!(session.incoming_call().borrow().is_none());
    let sent = transport.sent_messages();
    assert!(sent.iter().any(|m| matches!(
        m,
        SignalMessage::CallRejected {
            reason: RejectReason::NoAnswer,
            ..
        }
    )));
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn remote_call_end_clears_pending() {
    let (session, transport, _events) = session_with_friends(&["ana"]).await;
    let offer_id = Uuid::new_v4();
    transport.inject_broadcast(&request("ana", offer_id));
    settle().await;

    transport.inject_broadcast(&SignalMessage::CallEnd {
        room: RoomKey::for_pair("me", "ana"),
        sender: "ana".into(),
        offer_id,
        issued_at: 2,
    });
    settle().await;

    assert!(session.incoming_call().borrow().is_none());
    // No-answer timer must not fire afterwards.
    advance(Duration::from_millis(31_000)).await;
    settle().await;
    assert_eq!(transport.sent_count("call_rejected"), 1);
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_call_broadcasts_are_dropped() {
    let (session, transport, _events) = session_with_friends(&["ana"]).await;

    transport.inject_broadcast(&SignalMessage::CallEnd {
        room: RoomKey::for_pair("me", "ana"),
        sender: "ana".into(),
        offer_id: Uuid::new_v4(),
        issued_at: 1,
    });
    transport.inject_broadcast(&SignalMessage::CallRejected {
        room: RoomKey::for_pair("me", "ana"),
        sender: "ana".into(),
        offer_id: Uuid::new_v4(),
        reason: RejectReason::Declined,
        issued_at: 1,
    });
    settle().await;

    assert!(transport.sent_messages().is_empty());
    assert!(session.incoming_call().borrow().is_none());
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn outgoing_call_answer_reaches_the_ui() {
    let (session, transport, mut events) = session_with_friends(&["ana"]).await;

    let offer = session.place_call("ana").await.unwrap();
    assert_eq!(transport.sent_count("call_request"), 1);

    transport.inject_broadcast(&SignalMessage::CallAccepted {
        room: offer.room.clone(),
        sender: "ana".into(),
        offer_id: offer.offer_id,
        issued_at: 2,
    });
    settle().await;

    let mut answered = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::CallAnswered {
            offer_id, accepted, ..
        } = event
        {
            answered = Some((offer_id, accepted));
        }
    }
    assert_eq!(answered, Some((offer.offer_id, true)));
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn outgoing_call_expires_when_never_answered() {
    let (session, transport, mut events) = session_with_friends(&["ana"]).await;
    let offer = session.place_call("ana").await.unwrap();

    advance(Duration::from_millis(30_500)).await;
    settle().await;

    let mut answered = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::CallAnswered {
            offer_id,
            accepted,
            reason,
        } = event
        {
            answered = Some((offer_id, accepted, reason));
        }
    }
    assert_eq!(
        answered,
        Some((offer.offer_id, false, Some(RejectReason::NoAnswer)))
    );

    // An accept landing after the local expiry is stale: no second answer.
    transport.inject_broadcast(&SignalMessage::CallAccepted {
        room: offer.room.clone(),
        sender: "ana".into(),
        offer_id: offer.offer_id,
        issued_at: 3,
    });
    settle().await;
    assert!(events.try_recv().is_err());
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn place_call_to_stranger_fails_typed() {
    let (session, _transport, _events) = session_with_friends(&["ana"]).await;
    let err = session.place_call("nobody").await.unwrap_err();
    assert!(matches!(err, MuxError::ChannelUnavailable { .. }));
    session.shutdown().await;
}
