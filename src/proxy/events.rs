use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

// Fan-out of state-change events to subscribers (UI bridge, failover
// hooks). Delivery is best-effort over a broadcast channel: publishing
// never blocks, and subscribers that fall behind drop the oldest events.
// Late subscribers do not see history.

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    SystemStatus,
    EndpointUpdate,
    GroupUpdate,
    UsageUpdate,
    ConfigReloaded,
    Error,
    Notification,
}

// Topics serialize as their wire names ("endpoint:update", ...).
impl Serialize for Topic {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SystemStatus => "system:status",
            Topic::EndpointUpdate => "endpoint:update",
            Topic::GroupUpdate => "group:update",
            Topic::UsageUpdate => "usage:update",
            Topic::ConfigReloaded => "config:reloaded",
            Topic::Error => "error",
            Topic::Notification => "notification",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyEvent {
    pub topic: Topic,
    // Fine-grained event name within the topic, e.g. "failover_triggered".
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

impl ProxyEvent {
    pub fn new(topic: Topic, kind: &str, data: Value) -> Self {
        Self {
            topic,
            kind: kind.to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    // Fire-and-forget. A send error only means nobody is listening.
    pub fn publish(&self, event: ProxyEvent) {
        tracing::debug!(
            "[EventBus] {} {} ({} subscriber(s))",
            event.topic.as_str(),
            event.kind,
            self.sender.receiver_count()
        );
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, topic: Topic, kind: &str, data: Value) {
        self.publish(ProxyEvent::new(topic, kind, data));
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
            topics: None,
        }
    }

    pub fn subscribe_topics(&self, topics: Vec<Topic>) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
            topics: Some(topics),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscriber {
    receiver: broadcast::Receiver<ProxyEvent>,
    topics: Option<Vec<Topic>>,
}

impl EventSubscriber {
    fn matches(&self, event: &ProxyEvent) -> bool {
        match &self.topics {
            Some(topics) => topics.contains(&event.topic),
            None => true,
        }
    }

    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("[EventBus] Subscriber lagged, missed {} event(s)", n);
                    continue;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ProxyEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("[EventBus] Subscriber lagged, missed {} event(s)", n);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.emit(Topic::EndpointUpdate, "health_changed", json!({"endpoint": "a"}));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.topic, Topic::EndpointUpdate);
        assert_eq!(event.kind, "health_changed");
        assert_eq!(event.data["endpoint"], "a");
    }

    #[tokio::test]
    async fn topic_filter_drops_unrelated_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_topics(vec![Topic::GroupUpdate]);

        bus.emit(Topic::EndpointUpdate, "health_changed", json!({}));
        bus.emit(Topic::GroupUpdate, "group_manually_paused", json!({}));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.topic, Topic::GroupUpdate);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::new();
        bus.emit(Topic::SystemStatus, "started", json!({}));
    }

    #[tokio::test]
    async fn late_subscribers_miss_history() {
        let bus = EventBus::new();
        bus.emit(Topic::Notification, "early", json!({}));

        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn per_subject_publish_order_is_preserved() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(Topic::EndpointUpdate, "seq", json!({"n": i}));
        }
        for i in 0..5 {
            let event = sub.recv().await.expect("event");
            assert_eq!(event.data["n"], i);
        }
    }
}
