//! Publish/subscribe between services.
//!
//! Delivery is at-least-once: a handler may see the same envelope more than
//! once and must be idempotent. Publishes are keyed by a partition key (the
//! entity id) and consumers process a subscription sequentially, so events of
//! one entity are applied in emission order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::events::EventEnvelope;
use crate::AppError;

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError>;
}

/// A running subscription. Dropping it leaves the consumer running.
pub struct Subscription {
    pub group_id: String,
    pub topic: String,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(group_id: &str, topic: &str, task: Option<JoinHandle<()>>) -> Self {
        Self {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            task,
        }
    }

    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub async fn join(self) {
        if let Some(task) = self.task {
            let _ = task.await;
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Appends `envelope` to `topic`. `partition_key` defaults to the
    /// envelope's natural key.
    async fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        partition_key: Option<&str>,
    ) -> Result<(), AppError>;

    /// Delivers every message of `topic` to one member of `group_id`.
    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, AppError>;
}

/// Publishes an envelope on its own topic, keyed by its natural id.
pub async fn publish_event(bus: &dyn EventBus, envelope: &EventEnvelope) -> Result<(), AppError> {
    let key = envelope.partition_key();
    bus.publish(&envelope.topic(), envelope, Some(&key)).await
}

/// Publishes without surfacing failures to the caller.
pub async fn publish_best_effort(bus: &dyn EventBus, envelope: &EventEnvelope) -> bool {
    match publish_event(bus, envelope).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                topic = %envelope.topic(),
                event_id = %envelope.event_id,
                error = %e,
                "Dropping event after failed publish"
            );
            false
        }
    }
}

struct ConsumerGroup {
    members: Vec<Arc<dyn EventHandler>>,
    next: AtomicUsize,
}

impl ConsumerGroup {
    fn pick(&self) -> Option<Arc<dyn EventHandler>> {
        if self.members.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.members.len();
        Some(self.members[index].clone())
    }
}

#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub topic: String,
    pub partition_key: String,
    pub envelope: EventEnvelope,
}

/// Single-process bus with synchronous delivery.
///
/// Every consumer group of a topic receives each message; members of a
/// group take turns. Handler errors are logged and never reach the
/// publisher. Used by tests and by `EVENT_BUS_BACKEND=memory`.
#[derive(Default)]
pub struct InMemoryEventBus {
    groups: RwLock<HashMap<String, HashMap<String, Arc<ConsumerGroup>>>>,
    published: RwLock<VecDeque<PublishedEvent>>,
    history_limit: Option<usize>,
    unavailable: AtomicBool,
}

impl InMemoryEventBus {
    /// Records every published message for inspection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps only the last `limit` published messages.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            history_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Makes every publish fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedEvent> {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<EventEnvelope> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.envelope)
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.published_on(topic).len()
    }

    pub fn clear(&self) {
        self.published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn members_for(&self, topic: &str) -> Vec<(String, Arc<dyn EventHandler>)> {
        let groups = self.groups.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        groups
            .get(topic)
            .map(|by_group| {
                by_group
                    .iter()
                    .filter_map(|(group, members)| members.pick().map(|h| (group.clone(), h)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        partition_key: Option<&str>,
    ) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::ExternalService("event bus unavailable".to_string()));
        }

        let partition_key = partition_key
            .map(str::to_string)
            .unwrap_or_else(|| envelope.partition_key());

        if self.history_limit != Some(0) {
            let mut published = self.published.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            published.push_back(PublishedEvent {
                topic: topic.to_string(),
                partition_key,
                envelope: envelope.clone(),
            });
            if let Some(limit) = self.history_limit {
                while published.len() > limit {
                    published.pop_front();
                }
            }
        }

        // Locks are released before handlers run; handlers may publish.
        for (group, handler) in self.members_for(topic) {
            if let Err(e) = handler.handle(envelope).await {
                tracing::warn!(
                    topic,
                    group = %group,
                    handler = handler.name(),
                    event_id = %envelope.event_id,
                    error = %e,
                    "Event handler failed"
                );
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, AppError> {
        let mut groups = self.groups.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let by_group = groups.entry(topic.to_string()).or_default();

        let members = match by_group.get(group_id) {
            Some(existing) => {
                let mut members = existing.members.clone();
                members.push(handler);
                members
            }
            None => vec![handler],
        };
        by_group.insert(
            group_id.to_string(),
            Arc::new(ConsumerGroup {
                members,
                next: AtomicUsize::new(0),
            }),
        );

        tracing::debug!(topic, group = group_id, "Subscribed in-memory consumer");
        Ok(Subscription::new(group_id, topic, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DomainEvent, RideUpdated};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
            self.seen.lock().await.push(envelope.event_id.clone());
            if self.fail {
                return Err(AppError::Internal("handler failure".to_string()));
            }
            Ok(())
        }
    }

    fn ride_updated() -> EventEnvelope {
        EventEnvelope::new(
            "ride-service",
            DomainEvent::RideUpdated(RideUpdated {
                ride_id: Uuid::new_v4(),
                seats_available: 3,
                status: "published".to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn every_group_gets_a_copy_and_members_share_the_load() {
        let bus = InMemoryEventBus::new();
        let search_a = Recorder::new("search-a", false);
        let search_b = Recorder::new("search-b", false);
        let booking = Recorder::new("booking", false);

        bus.subscribe("search", "ride.updated", search_a.clone()).await.unwrap();
        bus.subscribe("search", "ride.updated", search_b.clone()).await.unwrap();
        bus.subscribe("booking", "ride.updated", booking.clone()).await.unwrap();

        for _ in 0..4 {
            publish_event(&bus, &ride_updated()).await.unwrap();
        }

        assert_eq!(booking.seen.lock().await.len(), 4);
        assert_eq!(search_a.seen.lock().await.len(), 2);
        assert_eq!(search_b.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn handler_failures_do_not_reach_the_publisher() {
        let bus = InMemoryEventBus::new();
        let failing = Recorder::new("failing", true);
        bus.subscribe("g", "ride.updated", failing.clone()).await.unwrap();

        let first = ride_updated();
        let second = ride_updated();
        assert!(publish_event(&bus, &first).await.is_ok());
        assert!(publish_event(&bus, &second).await.is_ok());

        assert_eq!(
            *failing.seen.lock().await,
            vec![first.event_id.clone(), second.event_id.clone()]
        );
    }

    #[tokio::test]
    async fn best_effort_publish_swallows_outages() {
        let bus = InMemoryEventBus::new();
        bus.set_unavailable(true);

        assert!(!publish_best_effort(&bus, &ride_updated()).await);
        assert_eq!(bus.count("ride.updated"), 0);

        bus.set_unavailable(false);
        let envelope = ride_updated();
        assert!(publish_best_effort(&bus, &envelope).await);
        assert_eq!(bus.published()[0].partition_key, envelope.partition_key());
    }

    #[tokio::test]
    async fn bounded_history_keeps_the_latest_messages() {
        let bus = InMemoryEventBus::with_history_limit(2);
        let consumer = Recorder::new("consumer", false);
        bus.subscribe("g", "ride.updated", consumer.clone()).await.unwrap();

        let envelopes: Vec<_> = (0..5).map(|_| ride_updated()).collect();
        for envelope in &envelopes {
            publish_event(&bus, envelope).await.unwrap();
        }

        let kept: Vec<_> = bus.published().into_iter().map(|p| p.envelope.event_id).collect();
        assert_eq!(kept, vec![envelopes[3].event_id.clone(), envelopes[4].event_id.clone()]);
        assert_eq!(consumer.seen.lock().await.len(), 5);

        let silent = InMemoryEventBus::with_history_limit(0);
        publish_event(&silent, &ride_updated()).await.unwrap();
        assert!(silent.published().is_empty());
    }
}
