//! Cache consumer applying queued change notifications.
//!
//! Consumption is serialized so that events for one node are applied in the
//! order they were published.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::application::error::CacheError;

use super::config::CacheConfig;
use super::events::{CacheEvent, EventQueue};
use super::hybrid::HybridCache;

pub const METRIC_CACHE_CONSUME_MS: &str = "nucache_consume_ms";
pub const METRIC_EVENT_REQUEUED: &str = "nucache_event_requeued_total";

/// Drains the event queue into the hybrid cache.
///
/// A batch stops at the first failing event. When the repository is
/// unreachable the failing event and everything after it go back to the
/// head of the queue; any other failure drops only the failing event.
pub struct CacheConsumer {
    config: CacheConfig,
    cache: Arc<HybridCache>,
    queue: Arc<EventQueue>,
    serial: Mutex<()>,
}

impl CacheConsumer {
    pub fn new(config: CacheConfig, cache: Arc<HybridCache>, queue: Arc<EventQueue>) -> Self {
        Self {
            config,
            cache,
            queue,
            serial: Mutex::new(()),
        }
    }

    /// Apply one batch of pending events, returning how many were applied.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> Result<usize, CacheError> {
        let _serial = self.serial.lock().await;
        let consume_started_at = Instant::now();
        let events = self.queue.drain(self.config.batch_limit());
        if events.is_empty() {
            return Ok(0);
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        info!(event_count, event_ids = ?event_ids, "Cache consumption starting");

        let result = self.apply_batch(events).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        histogram!(METRIC_CACHE_CONSUME_MS, "outcome" => outcome)
            .record(consume_started_at.elapsed().as_secs_f64() * 1000.0);

        if let Ok(applied) = result {
            info!(event_count, applied, "Cache consumption complete");
        }
        result
    }

    async fn apply_batch(&self, events: Vec<CacheEvent>) -> Result<usize, CacheError> {
        let mut in_flight = InFlight {
            queue: Arc::clone(&self.queue),
            events: events.into(),
        };
        let mut seen = HashSet::with_capacity(in_flight.events.len());
        let mut applied = 0;

        while let Some(event) = in_flight.events.front() {
            if !seen.insert(event.id) {
                debug!(event_id = %event.id, "Duplicate cache event skipped");
                in_flight.events.pop_front();
                continue;
            }

            if let Err(err) = self.cache.apply(&event.kind).await {
                if err.is_unavailable() {
                    let requeued = in_flight.events.len();
                    warn!(
                        event_id = %event.id,
                        event_kind = event.kind.name(),
                        requeued,
                        error = %err,
                        "Repository unavailable; cache events requeued"
                    );
                    counter!(METRIC_EVENT_REQUEUED).increment(requeued as u64);
                } else {
                    warn!(
                        event_id = %event.id,
                        event_kind = event.kind.name(),
                        node_id = ?event.kind.node_id(),
                        error = %err,
                        "Cache event dropped after failure"
                    );
                    in_flight.events.pop_front();
                }
                return Err(err);
            }
            in_flight.events.pop_front();
            applied += 1;
        }

        Ok(applied)
    }

    /// Consume batches until the queue is empty or a batch fails.
    pub async fn consume_all(&self) -> Result<usize, CacheError> {
        let mut total = 0;
        loop {
            let applied = self.consume().await?;
            if applied == 0 && self.queue.is_empty() {
                return Ok(total);
            }
            total += applied;
        }
    }

    /// Background loop consuming the queue every `interval`.
    pub fn spawn_auto_consume(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let consumer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                ticker.tick().await;
                if let Err(err) = consumer.consume_all().await {
                    warn!(error = %err, "Auto-consume stopped early");
                }
            }
        })
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<HybridCache> {
        &self.cache
    }
}

/// Events drained for a batch but not yet settled.
///
/// Whatever is still held when the guard drops goes back to the head of the
/// queue, including the event being applied if the batch future is
/// cancelled mid-write. Re-applying it is safe: every change is an
/// idempotent upsert or delete.
struct InFlight {
    queue: Arc<EventQueue>,
    events: VecDeque<CacheEvent>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.events.is_empty() {
            return;
        }
        let events: Vec<CacheEvent> = self.events.drain(..).collect();
        debug!(requeued = events.len(), "Unsettled cache events returned to the queue");
        self.queue.requeue_front(events);
    }
}
