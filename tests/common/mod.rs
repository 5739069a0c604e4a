//! Recording mock transport shared by the integration suites.

use async_trait::async_trait;
use pairwave_presence::{
    ChannelEvent, PresenceMeta, RealtimeTransport, SignalMessage, TransportError, TransportHandle,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Default)]
struct Inner {
    subscribes: Vec<String>,
    unsubscribes: Vec<String>,
    tracks: Vec<(String, PresenceMeta)>,
    untracks: Vec<String>,
    sent: Vec<SignalMessage>,
    /// channel → remaining scripted subscribe failures.
    fail_subscribes: HashMap<String, u32>,
    /// Live event feeds keyed by channel name.
    feeds: HashMap<String, UnboundedSender<ChannelEvent>>,
}

/// Transport double that records every call and lets tests inject channel
/// events and script subscribe failures.
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<Inner>,
    subscribe_delay: Mutex<Option<Duration>>,
    track_delay: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` subscribes for `channel` fail.
    pub fn fail_next_subscribes(&self, channel: &str, n: u32) {
        self.inner
            .lock()
            .unwrap()
            .fail_subscribes
            .insert(channel.to_string(), n);
    }

    /// Delay every subscribe, so concurrent acquires genuinely overlap.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap() = Some(delay);
    }

    /// Delay every track, to hold an acquire open mid-subscription.
    pub fn set_track_delay(&self, delay: Duration) {
        *self.track_delay.lock().unwrap() = Some(delay);
    }

    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscribes
            .iter()
            .filter(|c| c.as_str() == channel)
            .count()
    }

    pub fn total_subscribes(&self) -> usize {
        self.inner.lock().unwrap().subscribes.len()
    }

    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .unsubscribes
            .iter()
            .filter(|c| c.as_str() == channel)
            .count()
    }

    pub fn total_unsubscribes(&self) -> usize {
        self.inner.lock().unwrap().unsubscribes.len()
    }

    pub fn track_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tracks
            .iter()
            .filter(|(c, _)| c.as_str() == channel)
            .count()
    }

    pub fn last_track_meta(&self, channel: &str) -> Option<PresenceMeta> {
        self.inner
            .lock()
            .unwrap()
            .tracks
            .iter()
            .rev()
            .find(|(c, _)| c.as_str() == channel)
            .map(|(_, meta)| meta.clone())
    }

    pub fn sent_messages(&self) -> Vec<SignalMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn sent_count(&self, event_name: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|m| m.event_name() == event_name)
            .count()
    }

    /// Deliver a channel event as the backend would.
    pub fn inject(&self, channel: &str, event: ChannelEvent) {
        let feed = self
            .inner
            .lock()
            .unwrap()
            .feeds
            .get(channel)
            .cloned()
            .expect("channel not subscribed");
        feed.send(event).expect("event feed closed");
    }

    /// Deliver a well-formed signaling broadcast.
    pub fn inject_broadcast(&self, message: &SignalMessage) {
        let room = message.room().clone();
        let channel = room.as_str().to_string();
        let payload = serde_json::to_value(message).expect("serialize broadcast");
        self.inject(&channel, ChannelEvent::Broadcast { room, payload });
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn subscribe(
        &self,
        channel: &str,
        events: UnboundedSender<ChannelEvent>,
    ) -> Result<TransportHandle, TransportError> {
        let delay = *self.subscribe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(remaining) = inner.fail_subscribes.get_mut(channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::SubscribeFailed("scripted failure".into()));
            }
        }
        inner.subscribes.push(channel.to_string());
        inner.feeds.insert(channel.to_string(), events);
        Ok(TransportHandle::new(channel))
    }

    async fn send(
        &self,
        _handle: &TransportHandle,
        message: &SignalMessage,
    ) -> Result<(), TransportError> {
        self.inner.lock().unwrap().sent.push(message.clone());
        Ok(())
    }

    async fn track(
        &self,
        handle: &TransportHandle,
        payload: &PresenceMeta,
    ) -> Result<(), TransportError> {
        let delay = *self.track_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .lock()
            .unwrap()
            .tracks
            .push((handle.channel.clone(), payload.clone()));
        Ok(())
    }

    async fn untrack(&self, handle: &TransportHandle) -> Result<(), TransportError> {
        self.inner
            .lock()
            .unwrap()
            .untracks
            .push(handle.channel.clone());
        Ok(())
    }

    async fn unsubscribe(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.unsubscribes.push(handle.channel.clone());
        inner.feeds.remove(&handle.channel);
        Ok(())
    }
}

/// Let spawned tasks (event pump, timers) run under paused time.
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
