use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::TrackingConfig;

mod flusher;

pub use flusher::spawn_flusher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Forwarding,
    Streaming,
    Retry,
    Completed,
    Cancelled,
    Timeout,
    ConnectionTimeout,
    EofInterrupted,
    RateLimited,
    ServerError,
    StreamError,
    AuthError,
    Error,
    PartialRecovery,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Forwarding => "forwarding",
            RequestStatus::Streaming => "streaming",
            RequestStatus::Retry => "retry",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Timeout => "timeout",
            RequestStatus::ConnectionTimeout => "connection_timeout",
            RequestStatus::EofInterrupted => "eof_interrupted",
            RequestStatus::RateLimited => "rate_limited",
            RequestStatus::ServerError => "server_error",
            RequestStatus::StreamError => "stream_error",
            RequestStatus::AuthError => "auth_error",
            RequestStatus::Error => "error",
            RequestStatus::PartialRecovery => "partial_recovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => RequestStatus::Pending,
            "forwarding" => RequestStatus::Forwarding,
            "streaming" => RequestStatus::Streaming,
            "retry" => RequestStatus::Retry,
            "completed" => RequestStatus::Completed,
            "cancelled" => RequestStatus::Cancelled,
            "timeout" => RequestStatus::Timeout,
            "connection_timeout" => RequestStatus::ConnectionTimeout,
            "eof_interrupted" => RequestStatus::EofInterrupted,
            "rate_limited" => RequestStatus::RateLimited,
            "server_error" => RequestStatus::ServerError,
            "stream_error" => RequestStatus::StreamError,
            "auth_error" => RequestStatus::AuthError,
            "error" => RequestStatus::Error,
            "partial_recovery" => RequestStatus::PartialRecovery,
            _ => return None,
        })
    }

    // partial_recovery is the terminal status for a broken stream whose
    // tail still carried salvageable usage data.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RequestStatus::Pending
                | RequestStatus::Forwarding
                | RequestStatus::Streaming
                | RequestStatus::Retry
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: u64,
    pub status: RequestStatus,
    pub method: String,
    pub path: String,
    pub endpoint_name: String,
    pub group_name: String,
    pub retry_count: u32,
    pub http_status: u16,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cost: Option<f64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// Copy-on-write patch for the mutable record fields. Applying the same
// patch twice leaves the record in the same state.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub status: Option<RequestStatus>,
    pub endpoint_name: Option<String>,
    pub group_name: Option<String>,
    pub retry_count: Option<u32>,
    pub http_status: Option<u16>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cost: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub cancelled_count: u64,
    pub dropped_flushes: u64,
}

struct HotPool {
    records: HashMap<u64, RequestRecord>,
    // Insertion order, oldest first; used for cap and age eviction.
    order: VecDeque<u64>,
    stats: TrackerStats,
}

// Write-heavy observability store: a bounded in-memory hot pool that
// collapses per-request updates, plus an async flush queue feeding the
// durable store. Completions never block user-visible latency beyond the
// bounded back-pressure window.
pub struct UsageTracker {
    pool: Mutex<HotPool>,
    flush_tx: mpsc::Sender<RequestRecord>,
    next_id: AtomicU64,
    config: TrackingConfig,
}

// Bounded wait before a finished record is dead-lettered instead of
// queued for the durable store.
const FLUSH_ENQUEUE_WAIT_MS: u64 = 200;

impl UsageTracker {
    // Returns the tracker plus the receiving end of the flush queue; the
    // caller hands the receiver to `spawn_flusher`.
    pub fn new(config: TrackingConfig) -> (Arc<Self>, mpsc::Receiver<RequestRecord>) {
        let (flush_tx, flush_rx) = mpsc::channel(config.flush_queue_size.max(1));
        let tracker = Arc::new(Self {
            pool: Mutex::new(HotPool {
                records: HashMap::new(),
                order: VecDeque::new(),
                stats: TrackerStats::default(),
            }),
            flush_tx,
            next_id: AtomicU64::new(1),
            config,
        });
        (tracker, flush_rx)
    }

    pub async fn record_request_start(&self, method: &str, path: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis();
        let record = RequestRecord {
            id,
            status: RequestStatus::Pending,
            method: method.to_string(),
            path: path.to_string(),
            endpoint_name: String::new(),
            group_name: String::new(),
            retry_count: 0,
            http_status: 0,
            input_tokens: None,
            output_tokens: None,
            cost: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut pool = self.pool.lock().await;
        pool.stats.total_requests += 1;
        Self::evict_aged(&mut pool, self.config.max_record_age_secs, now);
        if pool.records.len() >= self.config.hot_pool_size
            && !Self::evict_oldest_terminal(&mut pool)
        {
            // Every pooled record is still in flight; refusing the insert
            // keeps the cap intact. The request itself proceeds untracked.
            warn!(
                "[Tracker] Hot pool full of in-flight records, request {} untracked",
                id
            );
            return id;
        }
        pool.order.push_back(id);
        pool.records.insert(id, record);
        id
    }

    pub async fn record_request_update(&self, id: u64, patch: RecordPatch) {
        if let Some(status) = patch.status {
            if status.is_terminal() {
                debug!(
                    "[Tracker] Ignoring terminal status {} via update for {}; use finish",
                    status.as_str(),
                    id
                );
            }
        }

        let mut pool = self.pool.lock().await;
        let Some(record) = pool.records.get_mut(&id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        Self::apply_patch(record, &patch, true);
    }

    // Transitions the record to a terminal status exactly once and queues
    // it for durable flush. Later calls for the same id are no-ops.
    pub async fn record_request_finish(&self, id: u64, terminal: RequestStatus, patch: RecordPatch) {
        if !terminal.is_terminal() {
            warn!(
                "[Tracker] finish called with non-terminal status {} for {}",
                terminal.as_str(),
                id
            );
            return;
        }

        let finalized = {
            let mut pool = self.pool.lock().await;
            let Some(record) = pool.records.get_mut(&id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            Self::apply_patch(record, &patch, false);
            record.status = terminal;
            record.updated_at = chrono::Utc::now().timestamp_millis();
            let snapshot = record.clone();

            match terminal {
                RequestStatus::Completed => pool.stats.success_count += 1,
                RequestStatus::Cancelled => pool.stats.cancelled_count += 1,
                _ => pool.stats.error_count += 1,
            }
            snapshot
        };

        self.enqueue_for_flush(finalized).await;
    }

    async fn enqueue_for_flush(&self, record: RequestRecord) {
        if self.flush_tx.try_send(record.clone()).is_ok() {
            return;
        }
        // Queue full: wait a bounded moment, then drop to the dead-letter
        // log so completions never stall the caller.
        let wait = tokio::time::Duration::from_millis(FLUSH_ENQUEUE_WAIT_MS);
        match tokio::time::timeout(wait, self.flush_tx.send(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[Tracker] Flush queue closed, record {} dropped", e.0.id);
                self.pool.lock().await.stats.dropped_flushes += 1;
            }
            Err(_) => {
                let mut pool = self.pool.lock().await;
                pool.stats.dropped_flushes += 1;
                tracing::error!(
                    "[DeadLetter] Flush queue saturated for {}ms, terminal record dropped",
                    FLUSH_ENQUEUE_WAIT_MS
                );
            }
        }
    }

    fn apply_patch(record: &mut RequestRecord, patch: &RecordPatch, allow_status: bool) {
        if allow_status {
            if let Some(status) = patch.status {
                if !status.is_terminal() {
                    record.status = status;
                }
            }
        }
        if let Some(ref endpoint) = patch.endpoint_name {
            record.endpoint_name = endpoint.clone();
        }
        if let Some(ref group) = patch.group_name {
            record.group_name = group.clone();
        }
        if let Some(retry_count) = patch.retry_count {
            record.retry_count = retry_count;
        }
        if let Some(http_status) = patch.http_status {
            record.http_status = http_status;
        }
        if let Some(input_tokens) = patch.input_tokens {
            record.input_tokens = Some(input_tokens);
        }
        if let Some(output_tokens) = patch.output_tokens {
            record.output_tokens = Some(output_tokens);
        }
        if let Some(cost) = patch.cost {
            record.cost = Some(cost);
        }
        if let Some(ref error) = patch.error {
            record.error = Some(error.clone());
        }
        record.updated_at = chrono::Utc::now().timestamp_millis();
    }

    fn evict_oldest_terminal(pool: &mut HotPool) -> bool {
        let position = pool
            .order
            .iter()
            .position(|id| {
                pool.records
                    .get(id)
                    .map(|r| r.status.is_terminal())
                    .unwrap_or(true)
            });
        if let Some(pos) = position {
            if let Some(id) = pool.order.remove(pos) {
                pool.records.remove(&id);
            }
            true
        } else {
            false
        }
    }

    fn evict_aged(pool: &mut HotPool, max_age_secs: u64, now_millis: i64) {
        let cutoff = now_millis - (max_age_secs as i64) * 1_000;
        while let Some(&front) = pool.order.front() {
            let evictable = match pool.records.get(&front) {
                Some(record) => record.status.is_terminal() && record.updated_at < cutoff,
                None => true,
            };
            if !evictable {
                break;
            }
            pool.order.pop_front();
            pool.records.remove(&front);
        }
    }

    pub async fn get_record(&self, id: u64) -> Option<RequestRecord> {
        self.pool.lock().await.records.get(&id).cloned()
    }

    pub async fn recent_records(&self, limit: usize) -> Vec<RequestRecord> {
        let pool = self.pool.lock().await;
        pool.order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| pool.records.get(id).cloned())
            .collect()
    }

    pub async fn stats(&self) -> TrackerStats {
        self.pool.lock().await.stats.clone()
    }

    pub async fn in_flight_count(&self) -> usize {
        let pool = self.pool.lock().await;
        pool.records
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(pool: usize, queue: usize) -> TrackingConfig {
        TrackingConfig {
            hot_pool_size: pool,
            max_record_age_secs: 3_600,
            flush_batch_size: 16,
            flush_queue_size: queue,
            unit_cost_per_mtok: None,
        }
    }

    #[tokio::test]
    async fn start_update_finish_lifecycle() {
        let (tracker, mut rx) = UsageTracker::new(test_config(100, 16));
        let id = tracker.record_request_start("POST", "/v1/messages").await;

        tracker
            .record_request_update(
                id,
                RecordPatch {
                    status: Some(RequestStatus::Forwarding),
                    endpoint_name: Some("ep-a".to_string()),
                    group_name: Some("g1".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let record = tracker.get_record(id).await.expect("record");
        assert_eq!(record.status, RequestStatus::Forwarding);
        assert_eq!(record.endpoint_name, "ep-a");

        tracker
            .record_request_finish(
                id,
                RequestStatus::Completed,
                RecordPatch {
                    http_status: Some(200),
                    ..Default::default()
                },
            )
            .await;

        let flushed = rx.recv().await.expect("flushed record");
        assert_eq!(flushed.id, id);
        assert_eq!(flushed.status, RequestStatus::Completed);
        assert_eq!(flushed.http_status, 200);

        let stats = tracker.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test]
    async fn terminal_transition_happens_only_once() {
        let (tracker, mut rx) = UsageTracker::new(test_config(100, 16));
        let id = tracker.record_request_start("GET", "/health").await;

        tracker
            .record_request_finish(id, RequestStatus::Completed, RecordPatch::default())
            .await;
        tracker
            .record_request_finish(id, RequestStatus::Error, RecordPatch::default())
            .await;

        let record = tracker.get_record(id).await.expect("record");
        assert_eq!(record.status, RequestStatus::Completed);

        // Exactly one flush for the record.
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());

        let stats = tracker.stats().await;
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 0);
    }

    #[tokio::test]
    async fn repeated_identical_patch_is_idempotent() {
        let (tracker, _rx) = UsageTracker::new(test_config(100, 16));
        let id = tracker.record_request_start("POST", "/v1/messages").await;

        let patch = RecordPatch {
            status: Some(RequestStatus::Retry),
            retry_count: Some(1),
            ..Default::default()
        };
        tracker.record_request_update(id, patch.clone()).await;
        let first = tracker.get_record(id).await.expect("record");
        tracker.record_request_update(id, patch).await;
        let second = tracker.get_record(id).await.expect("record");

        assert_eq!(first.status, second.status);
        assert_eq!(first.retry_count, second.retry_count);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_terminal_never_in_flight() {
        let (tracker, mut rx) = UsageTracker::new(test_config(2, 16));

        let a = tracker.record_request_start("GET", "/a").await;
        let b = tracker.record_request_start("GET", "/b").await;
        tracker
            .record_request_finish(a, RequestStatus::Completed, RecordPatch::default())
            .await;
        let _ = rx.recv().await;

        // Pool at cap (a terminal, b in flight); c evicts a.
        let c = tracker.record_request_start("GET", "/c").await;
        assert!(tracker.get_record(a).await.is_none());
        assert!(tracker.get_record(b).await.is_some());
        assert!(tracker.get_record(c).await.is_some());

        // Pool again at cap and fully in flight: d is refused, b/c stay.
        let d = tracker.record_request_start("GET", "/d").await;
        assert!(tracker.get_record(d).await.is_none());
        assert!(tracker.get_record(b).await.is_some());
        assert!(tracker.get_record(c).await.is_some());
    }

    #[tokio::test]
    async fn partial_recovery_is_a_flushable_terminal_status() {
        let (tracker, mut rx) = UsageTracker::new(test_config(100, 16));
        let id = tracker.record_request_start("POST", "/v1/messages").await;

        tracker
            .record_request_finish(
                id,
                RequestStatus::PartialRecovery,
                RecordPatch {
                    input_tokens: Some(12),
                    output_tokens: Some(256),
                    error: Some("stream interrupted".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let flushed = rx.recv().await.expect("flushed record");
        assert_eq!(flushed.status, RequestStatus::PartialRecovery);
        assert_eq!(flushed.output_tokens, Some(256));

        // Salvaged-but-broken still counts as a failed request.
        let stats = tracker.stats().await;
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn update_after_terminal_is_ignored() {
        let (tracker, _rx) = UsageTracker::new(test_config(100, 16));
        let id = tracker.record_request_start("GET", "/a").await;
        tracker
            .record_request_finish(id, RequestStatus::Cancelled, RecordPatch::default())
            .await;

        tracker
            .record_request_update(
                id,
                RecordPatch {
                    endpoint_name: Some("late".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let record = tracker.get_record(id).await.expect("record");
        assert_eq!(record.endpoint_name, "");
        assert_eq!(record.status, RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let (tracker, _rx) = UsageTracker::new(test_config(100, 16));
        let a = tracker.record_request_start("GET", "/a").await;
        let b = tracker.record_request_start("GET", "/b").await;
        let c = tracker.record_request_start("GET", "/c").await;
        assert!(a < b && b < c);
    }
}
