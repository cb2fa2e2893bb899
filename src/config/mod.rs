//! Configuration for the capture/collector/daemon agent.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/akita-agent/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! Credentials (API key id/secret) are deliberately NOT part of this file
//! — see `crate::credentials` for the separate, narrowly-permissioned
//! credentials store.

pub mod backend;
pub mod capture;
pub mod daemon;
pub mod filters;
pub mod pipeline;
pub mod telemetry;

pub use backend::BackendConfig;
pub use capture::CaptureConfig;
pub use daemon::DaemonConfig;
pub use filters::FiltersConfig;
pub use pipeline::PipelineConfig;
pub use telemetry::TelemetryConfig;

use serde::Deserialize;
use std::path::PathBuf;

use backend::BackendFileConfig;
use capture::CaptureFileConfig;
use daemon::DaemonFileConfig;
use filters::FiltersFileConfig;
use pipeline::PipelineFileConfig;
use telemetry::TelemetryFileConfig;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for storing logs
    pub log_dir: PathBuf,

    /// Packet capture configuration
    pub capture: CaptureConfig,

    /// FilterChain configuration
    pub filters: FiltersConfig,

    /// BackendCollector configuration
    pub backend: BackendConfig,

    /// DaemonCoordinator configuration
    pub daemon: DaemonConfig,

    /// TelemetryReporter / ResourceMonitor configuration
    pub telemetry: TelemetryConfig,

    /// PluginPipeline configuration (built-in obfuscation plugin)
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            capture: CaptureConfig::default(),
            filters: FiltersConfig::default(),
            backend: BackendConfig::default(),
            daemon: DaemonConfig::default(),
            telemetry: TelemetryConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Config file structure (subset of `Config` that makes sense to persist).
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub log_dir: Option<String>,
    pub capture: Option<CaptureFileConfig>,
    pub filters: Option<FiltersFileConfig>,
    pub backend: Option<BackendFileConfig>,
    pub daemon: Option<DaemonFileConfig>,
    pub telemetry: Option<TelemetryFileConfig>,
    pub pipeline: Option<PipelineFileConfig>,
}

impl Config {
    /// Get the config file path: ~/.config/akita-agent/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency.
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("akita-agent").join("config.toml"))
    }

    /// Create the config file with defaults if it doesn't exist. Called
    /// during startup to help users discover configuration options.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Config is optional; silently skip.
            }
        }
        let template = Self::default().to_toml();
        let _ = std::fs::write(&path, template);
    }

    /// Load file config if it exists.
    ///
    /// # Panics (via process exit)
    /// If the config file exists but cannot be parsed. This is intentional:
    /// a broken config should fail fast with a clear error rather than
    /// silently falling back to defaults while the user debugs the wrong
    /// thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                    eprintln!("║  CONFIG ERROR - Failed to parse configuration file           ║");
                    eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  To reset, delete the file and restart akita-agent.\n");
                    std::process::exit(2);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file               ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(2);
            }
        }
    }

    /// Load configuration: env vars > file > defaults.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        let log_dir = std::env::var("AKITA_LOG_DIR")
            .ok()
            .or(file.log_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./logs"));

        let capture = load_capture(file.capture.unwrap_or_default());
        let filters = load_filters(file.filters.unwrap_or_default());
        let backend = load_backend(file.backend.unwrap_or_default());
        let daemon = load_daemon(file.daemon.unwrap_or_default());
        let telemetry = load_telemetry(file.telemetry.unwrap_or_default());
        let pipeline = load_pipeline(file.pipeline.unwrap_or_default());

        Self {
            log_dir,
            capture,
            filters,
            backend,
            daemon,
            telemetry,
            pipeline,
        }
    }

    /// Render this config as TOML, used both as the template written by
    /// `ensure_config_exists` and by `akita-agent config --update`.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# akita-agent configuration
# Generated defaults — edit freely, comments are not preserved across `config --update`.

log_dir = {log_dir:?}

[capture]
interface = {interface}
offline_file = {offline_file}
bpf_filter = {bpf_filter:?}
parse_tls_handshakes = {parse_tls_handshakes}
max_http_length = {max_http_length}
max_buffered_bytes_per_connection = {max_buffered_bytes_per_connection}
max_buffered_bytes_total = {max_buffered_bytes_total}
stream_timeout_secs = {stream_timeout_secs}

[filters]
allow_hosts = {allow_hosts:?}
deny_hosts = {deny_hosts:?}
tracker_hosts = {tracker_hosts:?}
internal_hosts = {internal_hosts:?}
max_witness_bytes = {max_witness_bytes}
rate_limit_per_minute = {rate_limit_per_minute}

[backend]
endpoint = {endpoint:?}
batch_max_events = {batch_max_events}
batch_max_interval_secs = {batch_max_interval_secs}
max_queue_size = {max_queue_size}
min_retry_secs = {min_retry_secs}
max_retry_secs = {max_retry_secs}
retry_factor = {retry_factor}
shutdown_flush_deadline_secs = {shutdown_flush_deadline_secs}
trace_rotate_interval_secs = {trace_rotate_interval_secs}
control_plane_url = {backend_control_plane_url}
service_id = {backend_service_id}

[daemon]
bind_addr = {daemon_bind_addr:?}
control_plane_url = {control_plane_url:?}
heartbeat_interval_secs = {heartbeat_interval_secs}
long_poll_timeout_secs = {long_poll_timeout_secs}
long_poll_retry_interval_secs = {long_poll_retry_interval_secs}

[telemetry]
enabled = {telemetry_enabled}
report_interval_secs = {report_interval_secs}
resource_sample_interval_secs = {resource_sample_interval_secs}
endpoint = {telemetry_endpoint}

[pipeline]
redact_headers = {redact_headers:?}
redact_bodies = {redact_bodies}
"#,
            log_dir = self.log_dir.display().to_string(),
            interface = toml_opt_string(&self.capture.interface),
            offline_file = toml_opt_string(&self.capture.offline_file),
            bpf_filter = self.capture.bpf_filter,
            parse_tls_handshakes = self.capture.parse_tls_handshakes,
            max_http_length = self.capture.max_http_length,
            max_buffered_bytes_per_connection = self.capture.max_buffered_bytes_per_connection,
            max_buffered_bytes_total = self.capture.max_buffered_bytes_total,
            stream_timeout_secs = self.capture.stream_timeout_secs,
            allow_hosts = self.filters.allow_hosts,
            deny_hosts = self.filters.deny_hosts,
            tracker_hosts = self.filters.tracker_hosts,
            internal_hosts = self.filters.internal_hosts,
            max_witness_bytes = self.filters.max_witness_bytes,
            rate_limit_per_minute = self.filters.rate_limit_per_minute,
            endpoint = self.backend.endpoint,
            batch_max_events = self.backend.batch_max_events,
            batch_max_interval_secs = self.backend.batch_max_interval_secs,
            max_queue_size = self.backend.max_queue_size,
            min_retry_secs = self.backend.min_retry_secs,
            max_retry_secs = self.backend.max_retry_secs,
            retry_factor = self.backend.retry_factor,
            shutdown_flush_deadline_secs = self.backend.shutdown_flush_deadline_secs,
            trace_rotate_interval_secs = self.backend.trace_rotate_interval_secs,
            backend_control_plane_url = toml_opt_string(&self.backend.control_plane_url),
            backend_service_id = toml_opt_string(&self.backend.service_id),
            daemon_bind_addr = self.daemon.bind_addr.to_string(),
            control_plane_url = self.daemon.control_plane_url,
            heartbeat_interval_secs = self.daemon.heartbeat_interval_secs,
            long_poll_timeout_secs = self.daemon.long_poll_timeout_secs,
            long_poll_retry_interval_secs = self.daemon.long_poll_retry_interval_secs,
            telemetry_enabled = self.telemetry.enabled,
            report_interval_secs = self.telemetry.report_interval_secs,
            resource_sample_interval_secs = self.telemetry.resource_sample_interval_secs,
            redact_headers = self.pipeline.redact_headers,
            redact_bodies = self.pipeline.redact_bodies,
            telemetry_endpoint = toml_opt_string(&self.telemetry.endpoint),
        )
    }
}

fn toml_opt_string(value: &Option<String>) -> String {
    match value {
        Some(v) => format!("{v:?}"),
        None => "\"\"".to_string(),
    }
}

fn load_capture(file: CaptureFileConfig) -> CaptureConfig {
    let defaults = CaptureConfig::default();
    CaptureConfig {
        interface: std::env::var("AKITA_CAPTURE_INTERFACE").ok().or(file.interface),
        offline_file: std::env::var("AKITA_CAPTURE_OFFLINE_FILE")
            .ok()
            .or(file.offline_file),
        bpf_filter: file.bpf_filter.unwrap_or(defaults.bpf_filter),
        parse_tls_handshakes: file
            .parse_tls_handshakes
            .unwrap_or(defaults.parse_tls_handshakes),
        max_http_length: file.max_http_length.unwrap_or(defaults.max_http_length),
        max_buffered_bytes_per_connection: file
            .max_buffered_bytes_per_connection
            .unwrap_or(defaults.max_buffered_bytes_per_connection),
        max_buffered_bytes_total: file
            .max_buffered_bytes_total
            .unwrap_or(defaults.max_buffered_bytes_total),
        stream_timeout_secs: file
            .stream_timeout_secs
            .unwrap_or(defaults.stream_timeout_secs),
    }
}

fn load_filters(file: FiltersFileConfig) -> FiltersConfig {
    let defaults = FiltersConfig::default();
    FiltersConfig {
        allow_hosts: file.allow_hosts.unwrap_or(defaults.allow_hosts),
        deny_hosts: file.deny_hosts.unwrap_or(defaults.deny_hosts),
        tracker_hosts: file.tracker_hosts.unwrap_or(defaults.tracker_hosts),
        internal_hosts: file.internal_hosts.unwrap_or(defaults.internal_hosts),
        max_witness_bytes: file.max_witness_bytes.unwrap_or(defaults.max_witness_bytes),
        rate_limit_per_minute: std::env::var("AKITA_RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.rate_limit_per_minute)
            .unwrap_or(defaults.rate_limit_per_minute),
    }
}

fn load_backend(file: BackendFileConfig) -> BackendConfig {
    let defaults = BackendConfig::default();
    BackendConfig {
        endpoint: std::env::var("AKITA_BACKEND_ENDPOINT")
            .ok()
            .or(file.endpoint)
            .unwrap_or(defaults.endpoint),
        batch_max_events: file.batch_max_events.unwrap_or(defaults.batch_max_events),
        batch_max_interval_secs: file
            .batch_max_interval_secs
            .unwrap_or(defaults.batch_max_interval_secs),
        max_queue_size: file.max_queue_size.unwrap_or(defaults.max_queue_size),
        min_retry_secs: file.min_retry_secs.unwrap_or(defaults.min_retry_secs),
        max_retry_secs: file.max_retry_secs.unwrap_or(defaults.max_retry_secs),
        retry_factor: file.retry_factor.unwrap_or(defaults.retry_factor),
        shutdown_flush_deadline_secs: file
            .shutdown_flush_deadline_secs
            .unwrap_or(defaults.shutdown_flush_deadline_secs),
        trace_rotate_interval_secs: file
            .trace_rotate_interval_secs
            .unwrap_or(defaults.trace_rotate_interval_secs),
        control_plane_url: std::env::var("AKITA_BACKEND_CONTROL_PLANE_URL")
            .ok()
            .or(file.control_plane_url),
        service_id: std::env::var("AKITA_BACKEND_SERVICE_ID").ok().or(file.service_id),
    }
}

fn load_daemon(file: DaemonFileConfig) -> DaemonConfig {
    let defaults = DaemonConfig::default();
    let bind_addr = std::env::var("AKITA_DAEMON_BIND")
        .ok()
        .or(file.bind_addr)
        .map(|v| v.parse().expect("invalid AKITA_DAEMON_BIND/daemon.bind_addr"))
        .unwrap_or(defaults.bind_addr);
    DaemonConfig {
        bind_addr,
        control_plane_url: std::env::var("AKITA_CONTROL_PLANE_URL")
            .ok()
            .or(file.control_plane_url)
            .unwrap_or(defaults.control_plane_url),
        heartbeat_interval_secs: file
            .heartbeat_interval_secs
            .unwrap_or(defaults.heartbeat_interval_secs),
        long_poll_timeout_secs: file
            .long_poll_timeout_secs
            .unwrap_or(defaults.long_poll_timeout_secs),
        long_poll_retry_interval_secs: file
            .long_poll_retry_interval_secs
            .unwrap_or(defaults.long_poll_retry_interval_secs),
    }
}

fn load_telemetry(file: TelemetryFileConfig) -> TelemetryConfig {
    let defaults = TelemetryConfig::default();
    TelemetryConfig {
        enabled: std::env::var("AKITA_TELEMETRY_DISABLED")
            .map(|v| v != "1" && v.to_lowercase() != "true")
            .unwrap_or(file.enabled.unwrap_or(defaults.enabled)),
        report_interval_secs: file
            .report_interval_secs
            .unwrap_or(defaults.report_interval_secs),
        resource_sample_interval_secs: file
            .resource_sample_interval_secs
            .unwrap_or(defaults.resource_sample_interval_secs),
        endpoint: std::env::var("AKITA_TELEMETRY_ENDPOINT").ok().or(file.endpoint),
    }
}

fn load_pipeline(file: PipelineFileConfig) -> PipelineConfig {
    let defaults = PipelineConfig::default();
    PipelineConfig {
        redact_headers: file.redact_headers.unwrap_or(defaults.redact_headers),
        redact_bodies: file.redact_bodies.unwrap_or(defaults.redact_bodies),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml();
        let parsed: FileConfig = toml::from_str(&rendered).expect("default config must parse");
        assert_eq!(
            parsed.backend.unwrap().endpoint.unwrap(),
            config.backend.endpoint
        );
    }
}
