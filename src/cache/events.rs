//! Cache event system.
//!
//! Change notifications from the canonical store travel through an in-memory
//! queue and are applied to the cache by the consumer in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::domain::content::ContentCacheNode;
use crate::domain::types::{NodeObjectType, PublishedState};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::events";

pub const METRIC_EVENT_QUEUE_LEN: &str = "nucache_event_queue_len";

/// Monotonic epoch for ordering events.
///
/// Each event gets a unique, monotonically increasing epoch number.
pub type Epoch = u64;

/// Cache event with idempotency and ordering support.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Changes reported by the canonical store.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    // Documents
    /// A draft or published document version was saved.
    ContentRefreshed {
        node: Arc<ContentCacheNode>,
        state: PublishedState,
    },
    /// A document subtree was moved to the recycle bin.
    ContentTrashed { id: i32, key: Uuid },
    /// A document was permanently deleted.
    ContentDeleted { id: i32, key: Uuid },

    // Media
    MediaRefreshed { node: Arc<ContentCacheNode> },
    MediaTrashed { id: i32, key: Uuid },
    MediaDeleted { id: i32, key: Uuid },

    // Members
    MemberRefreshed { node: Arc<ContentCacheNode> },
    MemberDeleted { id: i32 },

    // Schema
    /// Content types were altered; their nodes must be reloaded.
    ContentTypesChanged {
        object_type: NodeObjectType,
        content_type_ids: Vec<i32>,
    },
}

impl EventKind {
    /// Node touched by the event, if it concerns a single node.
    pub fn node_id(&self) -> Option<i32> {
        match self {
            Self::ContentRefreshed { node, .. }
            | Self::MediaRefreshed { node }
            | Self::MemberRefreshed { node } => Some(node.id),
            Self::ContentTrashed { id, .. }
            | Self::ContentDeleted { id, .. }
            | Self::MediaTrashed { id, .. }
            | Self::MediaDeleted { id, .. }
            | Self::MemberDeleted { id } => Some(*id),
            Self::ContentTypesChanged { .. } => None,
        }
    }

    pub fn object_type(&self) -> NodeObjectType {
        match self {
            Self::ContentRefreshed { .. }
            | Self::ContentTrashed { .. }
            | Self::ContentDeleted { .. } => NodeObjectType::Document,
            Self::MediaRefreshed { .. } | Self::MediaTrashed { .. } | Self::MediaDeleted { .. } => {
                NodeObjectType::Media
            }
            Self::MemberRefreshed { .. } | Self::MemberDeleted { .. } => NodeObjectType::Member,
            Self::ContentTypesChanged { object_type, .. } => *object_type,
        }
    }

    /// Short label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ContentRefreshed { .. } => "content_refreshed",
            Self::ContentTrashed { .. } => "content_trashed",
            Self::ContentDeleted { .. } => "content_deleted",
            Self::MediaRefreshed { .. } => "media_refreshed",
            Self::MediaTrashed { .. } => "media_trashed",
            Self::MediaDeleted { .. } => "media_deleted",
            Self::MemberRefreshed { .. } => "member_refreshed",
            Self::MemberDeleted { .. } => "member_deleted",
            Self::ContentTypesChanged { .. } => "content_types_changed",
        }
    }
}

/// In-memory event queue feeding the cache consumer.
///
/// The queue uses a mutex for simplicity since contention is expected to be low.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event to the queue, returning its id.
    pub fn publish(&self, kind: EventKind) -> Uuid {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(kind, epoch);
        let event_id = event.id;

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = event.kind.name(),
            node_id = ?event.kind.node_id(),
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        queue.push_back(event);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        event_id
    }

    /// Drain up to `limit` events from the queue, in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    /// Put events back at the head of the queue, keeping their order.
    pub fn requeue_front(&self, events: Vec<CacheEvent>) {
        if events.is_empty() {
            return;
        }
        let mut queue = mutex_lock(&self.queue, SOURCE, "requeue_front");
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
