//! TelemetryReporter: a periodic, compact self-report of what this agent
//! has been doing, posted to the control plane (or just logged when no
//! endpoint is configured) so operators can watch capture/filter/upload
//! health without attaching a debugger.

pub mod resource_monitor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collector::CollectorMetricsSnapshot;
use crate::config::TelemetryConfig;
use crate::filter::FilterCountersSnapshot;
use crate::logging::LogBuffer;
use crate::sampled_reservoir::SampledReservoir;

use resource_monitor::{ResourceMonitor, ResourceSnapshot};

/// Per-destination-port breakdown of the same four event types
/// `CaptureCounters` tracks in aggregate, keyed off the connection's
/// `dst_port` at the point each unit is observed.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PortCounts {
    pub packets_observed: u64,
    pub requests_parsed: u64,
    pub responses_parsed: u64,
    pub parse_errors: u64,
}

/// Rolling counts of capture/parse activity, fed by the orchestration
/// layer as units flow through it. Kept separate from `FilterCounters`
/// and `CollectorMetrics`, which already track their own stages.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub packets_observed: AtomicU64,
    pub requests_parsed: AtomicU64,
    pub responses_parsed: AtomicU64,
    pub parse_errors: AtomicU64,
    per_port: Mutex<HashMap<u16, PortCounts>>,
}

impl CaptureCounters {
    pub fn record_packet(&self, port: u16) {
        self.packets_observed.fetch_add(1, Ordering::Relaxed);
        self.per_port.lock().unwrap().entry(port).or_default().packets_observed += 1;
    }

    pub fn record_request(&self, port: u16) {
        self.requests_parsed.fetch_add(1, Ordering::Relaxed);
        self.per_port.lock().unwrap().entry(port).or_default().requests_parsed += 1;
    }

    pub fn record_response(&self, port: u16) {
        self.responses_parsed.fetch_add(1, Ordering::Relaxed);
        self.per_port.lock().unwrap().entry(port).or_default().responses_parsed += 1;
    }

    pub fn record_parse_error(&self, port: u16) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        self.per_port.lock().unwrap().entry(port).or_default().parse_errors += 1;
    }

    pub fn snapshot(&self) -> CaptureCountersSnapshot {
        CaptureCountersSnapshot {
            packets_observed: self.packets_observed.load(Ordering::Relaxed),
            requests_parsed: self.requests_parsed.load(Ordering::Relaxed),
            responses_parsed: self.responses_parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            per_port: self.per_port.lock().unwrap().clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureCountersSnapshot {
    pub packets_observed: u64,
    pub requests_parsed: u64,
    pub responses_parsed: u64,
    pub parse_errors: u64,
    pub per_port: HashMap<u16, PortCounts>,
}

#[derive(Debug, Serialize)]
struct StartupReport<'a> {
    kind: &'static str,
    version: &'a str,
    arch: &'a str,
    os: &'a str,
    deployment_tag: Option<&'a str>,
    api_key_fingerprint: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PeriodicReport<'a> {
    kind: &'static str,
    capture: CaptureCountersSnapshot,
    filters: FilterCountersSnapshot,
    collector: CollectorMetricsSnapshot,
    resources: ResourceSnapshot,
    recent_errors: &'a [String],
    recent_error_count: u64,
}

pub struct TelemetryReporter {
    config: TelemetryConfig,
    http_client: reqwest::Client,
    capture_counters: Arc<CaptureCounters>,
    filter_counters: Arc<crate::filter::FilterCounters>,
    collector_metrics: Arc<crate::collector::CollectorMetrics>,
    log_buffer: LogBuffer,
    deployment_tag: Option<String>,
    api_key_fingerprint: Option<String>,
}

impl TelemetryReporter {
    pub fn new(
        config: TelemetryConfig,
        http_client: reqwest::Client,
        capture_counters: Arc<CaptureCounters>,
        filter_counters: Arc<crate::filter::FilterCounters>,
        collector_metrics: Arc<crate::collector::CollectorMetrics>,
        log_buffer: LogBuffer,
        deployment_tag: Option<String>,
        api_key_fingerprint: Option<String>,
    ) -> Self {
        Self {
            config,
            http_client,
            capture_counters,
            filter_counters,
            collector_metrics,
            log_buffer,
            deployment_tag,
            api_key_fingerprint,
        }
    }

    /// Spawn the periodic reporting loop. Returns immediately after
    /// sending the one-off startup report.
    pub fn spawn(self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.send_startup_report().await;

            let mut resource_monitor =
                ResourceMonitor::new(Duration::from_secs(self.config.resource_sample_interval_secs.max(1)));
            let mut report_interval = tokio::time::interval(Duration::from_secs(self.config.report_interval_secs.max(1)));
            let mut resource_interval =
                tokio::time::interval(Duration::from_secs(self.config.resource_sample_interval_secs.max(1)));
            // Only the most recent reporting failure per interval is logged,
            // to avoid flooding logs when the backend is unreachable.
            let mut last_report_failed = false;

            loop {
                tokio::select! {
                    _ = resource_interval.tick() => {
                        let _ = resource_monitor.sample();
                    }
                    _ = report_interval.tick() => {
                        let snapshot = resource_monitor.sample();
                        let failed = self.send_periodic_report(&snapshot).await.is_err();
                        if failed && !last_report_failed {
                            warn!("telemetry report failed; suppressing repeat warnings until next success");
                        }
                        last_report_failed = failed;
                    }
                    _ = &mut shutdown => {
                        debug!("telemetry reporter shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn send_startup_report(&self) {
        if !self.config.enabled {
            return;
        }
        let report = StartupReport {
            kind: "startup",
            version: env!("CARGO_PKG_VERSION"),
            arch: std::env::consts::ARCH,
            os: std::env::consts::OS,
            deployment_tag: self.deployment_tag.as_deref(),
            api_key_fingerprint: self.api_key_fingerprint.as_deref(),
        };
        match &self.config.endpoint {
            Some(endpoint) => {
                if let Err(err) = self.http_client.post(endpoint).json(&report).send().await {
                    warn!(%err, "failed to send startup telemetry report");
                }
            }
            None => debug!(?report, "startup telemetry report (no endpoint configured)"),
        }
    }

    async fn send_periodic_report(&self, resources: &ResourceSnapshot) -> Result<(), ()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut errors: SampledReservoir<String> = SampledReservoir::new(10);
        for entry in self.log_buffer.get_all() {
            if matches!(entry.level, crate::logging::LogLevel::Error | crate::logging::LogLevel::Warn) {
                errors.record(entry.message);
            }
        }

        let report = PeriodicReport {
            kind: "periodic",
            capture: self.capture_counters.snapshot(),
            filters: self.filter_counters.snapshot(),
            collector: self.collector_metrics.snapshot(),
            resources: resources.clone(),
            recent_errors: errors.samples(),
            recent_error_count: errors.total_count(),
        };

        match &self.config.endpoint {
            Some(endpoint) => {
                self.http_client
                    .post(endpoint)
                    .json(&report)
                    .send()
                    .await
                    .map_err(|_| ())?
                    .error_for_status()
                    .map_err(|_| ())?;
                Ok(())
            }
            None => {
                debug!(
                    capture = ?report.capture,
                    filters = ?report.filters,
                    collector = ?report.collector,
                    "periodic telemetry report (no endpoint configured)"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_port_counts_track_alongside_aggregate_totals() {
        let counters = CaptureCounters::default();
        counters.record_request(443);
        counters.record_request(443);
        counters.record_response(443);
        counters.record_packet(8080);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.requests_parsed, 2);
        assert_eq!(snapshot.responses_parsed, 1);
        assert_eq!(snapshot.per_port[&443].requests_parsed, 2);
        assert_eq!(snapshot.per_port[&443].responses_parsed, 1);
        assert_eq!(snapshot.per_port[&8080].packets_observed, 1);
        assert!(!snapshot.per_port.contains_key(&9000));
    }
}
