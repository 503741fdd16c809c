use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::containers::{ContainerStatus, LogKind};

/// Catalog-level events are published on this topic; status changes are
/// mirrored here so catalog-wide observers see them too.
pub const TOPIC_CONTAINERS: &str = "containers";

pub fn container_topic(uuid: Uuid) -> String {
    format!("containers:{uuid}")
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    CatalogChanged,
    StatusChanged {
        uuid: Uuid,
        status: ContainerStatus,
    },
    LogLine {
        uuid: Uuid,
        #[serde(rename = "log_kind")]
        kind: LogKind,
        message: String,
    },
}

/// How many events a subscriber may have pending before the oldest is
/// dropped. A slow subscriber loses events instead of stalling producers.
const SUBSCRIBER_CAPACITY: usize = 256;

struct SubscriberQueue {
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn push(&self, event: Event) {
        let mut events = self.events.lock().expect("subscriber queue poisoned");
        if events.len() >= SUBSCRIBER_CAPACITY {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
    }
}

/// A live subscription handle. Dropping it without unsubscribing leaves a
/// dead queue behind until `unsubscribe` is called with its id.
pub struct Subscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.queue
            .events
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }

    /// Number of events lost to the bounded buffer so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

struct BusInner {
    topics: HashMap<String, HashMap<Uuid, Arc<SubscriberQueue>>>,
    index: HashMap<Uuid, String>,
}

/// Process-wide pub/sub. Publication is fire-and-forget: producers never
/// block on subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                topics: HashMap::new(),
                index: HashMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });

        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(id, queue.clone());
        inner.index.insert(id, topic.to_string());
        debug!(subscription = %id, topic, "subscribed");

        Subscription { id, queue }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        if let Some(topic) = inner.index.remove(&id) {
            if let Some(subscribers) = inner.topics.get_mut(&topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    inner.topics.remove(&topic);
                }
            }
            debug!(subscription = %id, topic, "unsubscribed");
        }
    }

    pub fn publish(&self, topic: &str, event: Event) {
        let inner = self.inner.lock().expect("event bus poisoned");
        if let Some(subscribers) = inner.topics.get(topic) {
            for queue in subscribers.values() {
                queue.push(event.clone());
            }
        }
    }
}
