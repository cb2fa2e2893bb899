//! BackendCollector configuration: upload endpoint, batching thresholds,
//! and the retry/backoff budget (min 5s / max 5m / factor 1.2, per the
//! collector's design notes).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub endpoint: String,
    pub batch_max_events: usize,
    pub batch_max_interval_secs: u64,
    pub max_queue_size: usize,
    pub min_retry_secs: u64,
    pub max_retry_secs: u64,
    pub retry_factor: f64,
    pub shutdown_flush_deadline_secs: u64,
    /// When > 0, the capture-mode collector periodically asks the control
    /// plane named by `control_plane_url`/`service_id` for a new trace id
    /// and switches new witnesses to it; 0 disables rotation.
    pub trace_rotate_interval_secs: u64,
    /// Control plane to ask for rotated trace ids. Rotation is a no-op
    /// without both this and `service_id` set, regardless of the interval.
    pub control_plane_url: Option<String>,
    pub service_id: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://collector.akita.example.com/v1/batches".to_string(),
            batch_max_events: 100,
            batch_max_interval_secs: 5,
            max_queue_size: 10_000,
            min_retry_secs: 5,
            max_retry_secs: 300,
            retry_factor: 1.2,
            shutdown_flush_deadline_secs: 120,
            trace_rotate_interval_secs: 0,
            control_plane_url: None,
            service_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendFileConfig {
    pub endpoint: Option<String>,
    pub batch_max_events: Option<usize>,
    pub batch_max_interval_secs: Option<u64>,
    pub max_queue_size: Option<usize>,
    pub min_retry_secs: Option<u64>,
    pub max_retry_secs: Option<u64>,
    pub retry_factor: Option<f64>,
    pub shutdown_flush_deadline_secs: Option<u64>,
    pub trace_rotate_interval_secs: Option<u64>,
    pub control_plane_url: Option<String>,
    pub service_id: Option<String>,
}
