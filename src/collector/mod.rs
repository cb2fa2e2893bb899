//! BackendCollector: batches witnesses per trace and uploads them to the
//! remote ingestion service.
//!
//! Mirrors the batch-buffer-plus-flush-interval shape of the teacher's
//! lifestats writer (flush on batch-size OR time threshold, whichever
//! comes first) but swaps "dedicated OS thread + SQLite" for "tokio task
//! + gzip-compressed HTTPS POST", since uploads are I/O-bound rather than
//! CPU-bound. The outbound queue lives behind a `Mutex` rather than a
//! channel so producers can drop the oldest entry on overflow instead of
//! blocking.

pub mod retry;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::control_plane::ControlPlaneClient;
use crate::error::CollectorError;
use crate::witness::Witness;
use retry::RetryBudget;

/// Where to ask for rotated trace ids, per spec.md §4.7's "per-trace
/// rotation" contract. Absent in the HAR-conversion and daemon-mode call
/// sites, where trace ids are either fixed for the run or already
/// allocated by the `DaemonCoordinator`'s own trace lifecycle.
#[derive(Clone)]
pub struct TraceRotation {
    pub control_plane: Arc<ControlPlaneClient>,
    pub service_id: String,
}

#[derive(Debug, Default)]
pub struct CollectorMetrics {
    pub enqueued: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub witnesses_sent: AtomicU64,
    pub retries: AtomicU64,
}

impl CollectorMetrics {
    pub fn snapshot(&self) -> CollectorMetricsSnapshot {
        CollectorMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            witnesses_sent: self.witnesses_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CollectorMetricsSnapshot {
    pub enqueued: u64,
    pub dropped_overflow: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub witnesses_sent: u64,
    pub retries: u64,
}

struct QueueEntry {
    trace_id: String,
    witness: Witness,
}

struct SharedQueue {
    items: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    max_size: usize,
}

#[derive(serde::Serialize)]
struct BatchPayload<'a> {
    batch_id: Uuid,
    trace_id: &'a str,
    witnesses: &'a [Witness],
}

/// Handle to a running collector worker. Cloneable; `enqueue` and
/// `rotate_trace` are cheap and non-blocking.
#[derive(Clone)]
pub struct BackendCollector {
    queue: Arc<SharedQueue>,
    current_trace_id: Arc<Mutex<String>>,
    shutdown: Arc<Notify>,
    shutdown_requested: Arc<std::sync::atomic::AtomicBool>,
    pub metrics: Arc<CollectorMetrics>,
}

impl BackendCollector {
    /// Spawn the worker task and return a handle plus its `JoinHandle`
    /// (awaited during shutdown to ensure the final flush completes).
    pub fn spawn(
        config: BackendConfig,
        http_client: reqwest::Client,
        initial_trace_id: String,
        rotation: Option<TraceRotation>,
    ) -> (Self, JoinHandle<()>) {
        let queue = Arc::new(SharedQueue {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_size: config.max_queue_size,
        });
        let metrics = Arc::new(CollectorMetrics::default());
        let shutdown = Arc::new(Notify::new());
        let shutdown_requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let current_trace_id = Arc::new(Mutex::new(initial_trace_id));

        let collector = Self {
            queue: queue.clone(),
            current_trace_id: current_trace_id.clone(),
            shutdown: shutdown.clone(),
            shutdown_requested: shutdown_requested.clone(),
            metrics: metrics.clone(),
        };

        let handle = tokio::spawn(worker_loop(
            config,
            http_client,
            queue,
            current_trace_id,
            rotation,
            metrics,
            shutdown,
            shutdown_requested,
        ));

        (collector, handle)
    }

    /// Enqueue a witness under the currently-active trace id. Drops the
    /// oldest queued entry (counted) if the queue is at capacity.
    pub async fn enqueue(&self, witness: Witness) {
        let trace_id = self.current_trace_id.lock().await.clone();
        let mut items = self.queue.items.lock().await;
        if items.len() >= self.queue.max_size {
            items.pop_front();
            self.metrics.dropped_overflow.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(QueueEntry { trace_id, witness });
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue.notify.notify_one();
    }

    /// Switch new enqueues to `new_trace_id`. Entries already queued under
    /// the previous trace id continue draining under that id.
    pub async fn rotate_trace(&self, new_trace_id: String) {
        *self.current_trace_id.lock().await = new_trace_id;
    }

    /// Signal the worker to drain and stop, then wait (bounded by the
    /// configured flush deadline, enforced inside the worker itself).
    pub async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

async fn worker_loop(
    config: BackendConfig,
    http_client: reqwest::Client,
    queue: Arc<SharedQueue>,
    current_trace_id: Arc<Mutex<String>>,
    rotation: Option<TraceRotation>,
    metrics: Arc<CollectorMetrics>,
    shutdown: Arc<Notify>,
    shutdown_requested: Arc<std::sync::atomic::AtomicBool>,
) {
    let retry_budget = RetryBudget::new(config.min_retry_secs, config.max_retry_secs, config.retry_factor);
    let mut flush_interval = tokio::time::interval(Duration::from_secs(config.batch_max_interval_secs.max(1)));
    flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let rotation = rotation.filter(|_| config.trace_rotate_interval_secs > 0);
    let mut rotate_interval = rotation.as_ref().map(|_| {
        let mut interval = tokio::time::interval(Duration::from_secs(config.trace_rotate_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = queue.notify.notified() => {
                drain_and_flush_if_full(&config, &http_client, &queue, &metrics, &retry_budget).await;
            }
            _ = flush_interval.tick() => {
                drain_and_flush_all(&config, &http_client, &queue, &metrics, &retry_budget).await;
            }
            _ = async { rotate_interval.as_mut().unwrap().tick().await }, if rotate_interval.is_some() => {
                rotate_trace_id(rotation.as_ref().unwrap(), &current_trace_id).await;
            }
            _ = shutdown.notified() => {
                break;
            }
        }

        if shutdown_requested.load(Ordering::SeqCst) {
            break;
        }
    }

    debug!("backend collector shutting down, flushing remaining queue");
    let deadline = Duration::from_secs(config.shutdown_flush_deadline_secs);
    let flush_all = async {
        loop {
            let remaining = queue.items.lock().await.len();
            if remaining == 0 {
                break;
            }
            drain_and_flush_all(&config, &http_client, &queue, &metrics, &retry_budget).await;
        }
    };
    if tokio::time::timeout(deadline, flush_all).await.is_err() {
        let remaining = queue.items.lock().await.len();
        warn!(remaining, "shutdown flush deadline exceeded, dropping remaining witnesses");
    }
}

/// Ask the control plane for a new trace id and switch new enqueues to it.
/// Witnesses already queued under the previous id are unaffected — they
/// carry their own `trace_id` copied at enqueue time and drain normally.
async fn rotate_trace_id(rotation: &TraceRotation, current_trace_id: &Mutex<String>) {
    match rotation.control_plane.create_trace(&rotation.service_id).await {
        Ok(resp) => {
            debug!(new_trace_id = %resp.trace_id, "rotated to new trace id");
            *current_trace_id.lock().await = resp.trace_id;
        }
        Err(e) => {
            warn!(error = %e, "trace rotation request failed, keeping current trace id");
        }
    }
}

/// Flush once batch-size worth of items is queued (called on every enqueue
/// notification, so this mostly no-ops until the threshold is crossed).
async fn drain_and_flush_if_full(
    config: &BackendConfig,
    client: &reqwest::Client,
    queue: &Arc<SharedQueue>,
    metrics: &Arc<CollectorMetrics>,
    retry_budget: &RetryBudget,
) {
    loop {
        let batch = {
            let mut items = queue.items.lock().await;
            if items.len() < config.batch_max_events {
                return;
            }
            drain_one_batch(&mut items, config.batch_max_events)
        };
        flush_batches(config, client, batch, metrics, retry_budget).await;
    }
}

async fn drain_and_flush_all(
    config: &BackendConfig,
    client: &reqwest::Client,
    queue: &Arc<SharedQueue>,
    metrics: &Arc<CollectorMetrics>,
    retry_budget: &RetryBudget,
) {
    loop {
        let batch = {
            let mut items = queue.items.lock().await;
            if items.is_empty() {
                return;
            }
            drain_one_batch(&mut items, config.batch_max_events)
        };
        flush_batches(config, client, batch, metrics, retry_budget).await;
    }
}

/// Pop up to `max` entries, splitting at trace-id boundaries so a single
/// upload never mixes witnesses from two different traces.
fn drain_one_batch(items: &mut VecDeque<QueueEntry>, max: usize) -> Vec<(String, Vec<Witness>)> {
    let mut batches: Vec<(String, Vec<Witness>)> = Vec::new();
    let mut taken = 0;
    while taken < max {
        let Some(trace_id) = items.front().map(|e| e.trace_id.clone()) else {
            break;
        };
        match batches.last_mut() {
            Some((last_trace, witnesses)) if *last_trace == trace_id => {
                witnesses.push(items.pop_front().unwrap().witness);
            }
            _ => {
                let entry = items.pop_front().unwrap();
                batches.push((entry.trace_id, vec![entry.witness]));
            }
        }
        taken += 1;
    }
    batches
}

async fn flush_batches(
    config: &BackendConfig,
    client: &reqwest::Client,
    batches: Vec<(String, Vec<Witness>)>,
    metrics: &Arc<CollectorMetrics>,
    retry_budget: &RetryBudget,
) {
    for (trace_id, witnesses) in batches {
        if witnesses.is_empty() {
            continue;
        }
        let count = witnesses.len();
        match upload_with_retry(config, client, &trace_id, witnesses, metrics, retry_budget).await {
            Ok(()) => {
                metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
                metrics.witnesses_sent.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(e) => {
                metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
                error!(trace_id, error = %e, "dropping batch after exhausting retries");
            }
        }
    }
}

async fn upload_with_retry(
    config: &BackendConfig,
    client: &reqwest::Client,
    trace_id: &str,
    witnesses: Vec<Witness>,
    metrics: &Arc<CollectorMetrics>,
    retry_budget: &RetryBudget,
) -> Result<(), CollectorError> {
    let batch_id = Uuid::new_v4();
    let body = compress_payload(&BatchPayload {
        batch_id,
        trace_id,
        witnesses: &witnesses,
    })?;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = client
            .post(&config.endpoint)
            .header("Content-Encoding", "gzip")
            .header("Content-Type", "application/json")
            .header("X-Batch-Id", batch_id.to_string())
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                let status = response.status();
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let body_text = response.text().await.unwrap_or_default();
                let err = CollectorError::Http {
                    status: status.as_u16(),
                    body: body_text,
                };
                if status.as_u16() == 429 {
                    metrics.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(retry_budget.delay_for_retry_after(attempt, retry_after)).await;
                    continue;
                }
                if !err.is_retryable() {
                    return Err(err);
                }
                metrics.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(retry_budget.delay_for_attempt(attempt)).await;
            }
            Err(e) => {
                metrics.retries.fetch_add(1, Ordering::Relaxed);
                debug!(attempt, error = %e, "transport error uploading batch, retrying");
                tokio::time::sleep(retry_budget.delay_for_attempt(attempt)).await;
            }
        }
    }
}

fn compress_payload(payload: &BatchPayload<'_>) -> Result<Vec<u8>, CollectorError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let json = serde_json::to_vec(payload).map_err(|e| CollectorError::Compression(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CollectorError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| CollectorError::Compression(e.to_string()))
}

/// A new trace id for when no rotation is configured yet — callers pass
/// the real server-issued id once the daemon/control-plane path is live.
pub fn placeholder_trace_id() -> String {
    format!("local-{}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_one_batch_splits_on_trace_boundary() {
        let mut items = VecDeque::new();
        items.push_back(QueueEntry { trace_id: "a".into(), witness: test_witness() });
        items.push_back(QueueEntry { trace_id: "a".into(), witness: test_witness() });
        items.push_back(QueueEntry { trace_id: "b".into(), witness: test_witness() });

        let batches = drain_one_batch(&mut items, 10);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, "a");
        assert_eq!(batches[0].1.len(), 2);
        assert_eq!(batches[1].0, "b");
        assert_eq!(batches[1].1.len(), 1);
        assert!(items.is_empty());
    }

    #[test]
    fn drain_one_batch_respects_max() {
        let mut items = VecDeque::new();
        for _ in 0..5 {
            items.push_back(QueueEntry { trace_id: "a".into(), witness: test_witness() });
        }
        let batches = drain_one_batch(&mut items, 3);
        assert_eq!(batches[0].1.len(), 3);
        assert_eq!(items.len(), 2);
    }

    fn test_witness() -> Witness {
        Witness {
            id: Witness::new_id(),
            connection_id_display: "x".into(),
            trace_id: None,
            observed_at: Utc::now(),
            request: None,
            response: None,
            one_sided: true,
            tcp_metadata: None,
            tls_handshake: None,
        }
    }

    /// A batch's `X-Batch-Id` is minted once per `upload_with_retry` call
    /// and reused on every attempt within it, so the ingestion service can
    /// dedupe a retried upload rather than recording the batch twice.
    #[test]
    fn retries_of_one_batch_reuse_the_same_batch_id() {
        let witnesses = vec![test_witness(), test_witness()];
        let payload_one = BatchPayload {
            batch_id: Uuid::new_v4(),
            trace_id: "t",
            witnesses: &witnesses,
        };
        let body_one = compress_payload(&payload_one).expect("compress");
        let payload_two = BatchPayload {
            batch_id: payload_one.batch_id,
            trace_id: "t",
            witnesses: &witnesses,
        };
        let body_two = compress_payload(&payload_two).expect("compress");
        assert_eq!(body_one, body_two);
    }
}
