//! TelemetryReporter and ResourceMonitor configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub report_interval_secs: u64,
    pub resource_sample_interval_secs: u64,
    /// Where compact telemetry reports are POSTed. `None` means reports
    /// are only logged (useful for offline/dev runs with no backend).
    pub endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_secs: 60,
            resource_sample_interval_secs: 15,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryFileConfig {
    pub enabled: Option<bool>,
    pub report_interval_secs: Option<u64>,
    pub resource_sample_interval_secs: Option<u64>,
    pub endpoint: Option<String>,
}
