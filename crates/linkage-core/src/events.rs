//! Per-user job notifications and the in-process event bus.
//!
//! Events are lightweight "re-fetch status" signals: the text carries only the
//! graph id and a kind (`"<id> - STEP UPDATE"`, `"<id> - UPDATE"`,
//! `"<id> - DONE"`, `"<id> - ERROR"`). Delivery is best-effort; an event
//! published to a channel without subscribers is dropped.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::defaults;
use crate::traits::NotificationChannel;
use crate::Result;

/// Channel key of one user's notification stream (`"jobs-<user>"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn for_user(user_id: Uuid) -> Self {
        Self(format!("{}-{}", defaults::CHANNEL_PREFIX, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of job notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// A stage transition was persisted.
    StepUpdate,
    /// Clustering progress was persisted.
    Update,
    /// The clustering run finished and its terminal state was persisted.
    Done,
    /// The job entered the errored state.
    Error,
}

impl JobEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobEventKind::StepUpdate => "STEP UPDATE",
            JobEventKind::Update => "UPDATE",
            JobEventKind::Done => "DONE",
            JobEventKind::Error => "ERROR",
        }
    }
}

/// A notification about one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub graph_id: Uuid,
    pub kind: JobEventKind,
}

impl JobEvent {
    pub fn new(graph_id: Uuid, kind: JobEventKind) -> Self {
        Self { graph_id, kind }
    }

    pub fn step_update(graph_id: Uuid) -> Self {
        Self::new(graph_id, JobEventKind::StepUpdate)
    }

    pub fn update(graph_id: Uuid) -> Self {
        Self::new(graph_id, JobEventKind::Update)
    }

    pub fn done(graph_id: Uuid) -> Self {
        Self::new(graph_id, JobEventKind::Done)
    }

    pub fn error(graph_id: Uuid) -> Self {
        Self::new(graph_id, JobEventKind::Error)
    }

    /// Wire text pushed to the UI.
    pub fn text(&self) -> String {
        format!("{} - {}", self.graph_id, self.kind.label())
    }
}

/// Envelope delivered to bus subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    pub channel: ChannelKey,
    pub occurred_at: DateTime<Utc>,
    /// Rendered event text.
    pub text: String,
    pub payload: JobEvent,
}

impl EventEnvelope {
    pub fn new(channel: ChannelKey, event: JobEvent) -> Self {
        Self {
            event_id: crate::new_v7(),
            channel,
            occurred_at: Utc::now(),
            text: event.text(),
            payload: event,
        }
    }
}

/// Publish-subscribe bus with one broadcast channel per user key.
///
/// Channels are created lazily on first subscribe. Publishing to a key nobody
/// subscribed to is a silent drop.
pub struct EventBus {
    capacity: usize,
    channels: RwLock<HashMap<ChannelKey, broadcast::Sender<EventEnvelope>>>,
}

impl EventBus {
    /// Create a bus whose per-user channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to one user's stream.
    pub async fn subscribe(&self, key: &ChannelKey) -> broadcast::Receiver<EventEnvelope> {
        let mut channels = self.channels.write().await;
        channels
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Number of live subscribers on a key.
    pub async fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.channels
            .read()
            .await
            .get(key)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of open per-user channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drop channels whose subscribers have all gone away.
    pub async fn prune(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(defaults::EVENT_BUS_CAPACITY)
    }
}

#[async_trait]
impl NotificationChannel for EventBus {
    /// Send to the key's subscribers. A channel whose last subscriber has
    /// gone away is removed here.
    async fn publish(&self, key: &ChannelKey, event: &JobEvent) -> Result<()> {
        let envelope = EventEnvelope::new(key.clone(), *event);
        let abandoned = {
            let channels = self.channels.read().await;
            let subscriber_count = channels.get(key).map(|tx| tx.receiver_count()).unwrap_or(0);
            tracing::debug!(
                channel = %key,
                event_id = %envelope.event_id,
                text = %envelope.text,
                subscriber_count,
                "EventBus publish"
            );
            match channels.get(key) {
                Some(tx) if subscriber_count > 0 => {
                    let _ = tx.send(envelope);
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if abandoned {
            let mut channels = self.channels.write().await;
            // A subscriber may have arrived between the two locks.
            if channels.get(key).is_some_and(|tx| tx.receiver_count() == 0) {
                channels.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_key_format() {
        let user = Uuid::nil();
        assert_eq!(
            ChannelKey::for_user(user).as_str(),
            "jobs-00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_event_text() {
        let id = Uuid::nil();
        assert_eq!(JobEvent::step_update(id).text(), format!("{id} - STEP UPDATE"));
        assert_eq!(JobEvent::update(id).text(), format!("{id} - UPDATE"));
        assert_eq!(JobEvent::done(id).text(), format!("{id} - DONE"));
        assert_eq!(JobEvent::error(id).text(), format!("{id} - ERROR"));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_of_same_user_only() {
        let bus = EventBus::new(32);
        let alice = ChannelKey::for_user(Uuid::new_v4());
        let bob = ChannelKey::for_user(Uuid::new_v4());
        let mut alice_rx = bus.subscribe(&alice).await;
        let mut bob_rx = bus.subscribe(&bob).await;

        let graph_id = Uuid::new_v4();
        bus.publish(&alice, &JobEvent::done(graph_id)).await.unwrap();

        let envelope = alice_rx.recv().await.unwrap();
        assert_eq!(envelope.payload.kind, JobEventKind::Done);
        assert_eq!(envelope.text, format!("{graph_id} - DONE"));
        assert_eq!(envelope.channel, alice);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        let key = ChannelKey::for_user(Uuid::new_v4());
        assert!(bus.publish(&key, &JobEvent::update(Uuid::nil())).await.is_ok());
        assert_eq!(bus.subscriber_count(&key).await, 0);
    }

    #[tokio::test]
    async fn test_prune_drops_dead_channels() {
        let bus = EventBus::new(8);
        let key = ChannelKey::for_user(Uuid::new_v4());
        let rx = bus.subscribe(&key).await;
        assert_eq!(bus.subscriber_count(&key).await, 1);
        drop(rx);
        assert_eq!(bus.prune().await, 1);
    }

    #[tokio::test]
    async fn test_publish_removes_abandoned_channel() {
        let bus = EventBus::new(8);
        let gone = ChannelKey::for_user(Uuid::new_v4());
        let live = ChannelKey::for_user(Uuid::new_v4());
        drop(bus.subscribe(&gone).await);
        let _live_rx = bus.subscribe(&live).await;
        assert_eq!(bus.channel_count().await, 2);

        bus.publish(&gone, &JobEvent::update(Uuid::nil())).await.unwrap();
        bus.publish(&live, &JobEvent::update(Uuid::nil())).await.unwrap();

        assert_eq!(bus.channel_count().await, 1);
        assert_eq!(bus.subscriber_count(&live).await, 1);
    }
}
