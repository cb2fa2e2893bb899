// akita-agent - API-observability capture and daemon agent
//
// Passively captures HTTP(S) request/response traffic from the host
// network, reassembles it into structured witnesses, and streams those
// witnesses to a remote ingestion service for API-shape inference.
//
// Two run modes, selected on the command line:
// - `akita-agent capture`: PacketSource -> StreamReassembler -> L7Parser
//   -> FlowPairer -> FilterChain -> PluginPipeline -> BackendCollector.
// - `akita-agent daemon`: DaemonCoordinator multiplexes local clients onto
//   server-managed traces via long-poll control-plane RPCs, draining
//   trace events through per-trace BackendCollector instances.

mod capture;
mod cli;
mod collector;
mod config;
mod control_plane;
mod credentials;
mod daemon;
mod engine;
mod error;
mod filter;
mod har;
mod logging;
mod parser;
mod pipeline;
mod sampled_reservoir;
mod startup;
mod telemetry;
mod util;
mod witness;

use std::collections::HashMap;
use std::sync::Arc;

use cli::RunMode;
use collector::BackendCollector;
use config::Config;
use credentials::Credentials;
use engine::CaptureEngine;
use filter::FilterChain;
use logging::{LogBuffer, TelemetryLogLayer};
use pipeline::obfuscation::{ObfuscationConfig, ObfuscationPlugin};
use pipeline::EventPipeline;
use telemetry::{CaptureCounters, TelemetryReporter};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let Some(mode) = cli::parse_run_mode() else {
        // A config subcommand ran and already printed its own output.
        return;
    };

    Config::ensure_config_exists();
    let config = Config::from_env();

    let log_buffer = LogBuffer::new();
    let default_filter = "akita_agent=info,tower_http=info,axum=info";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // Held for the rest of `main`: the non-blocking writer stops flushing
    // once its guard drops.
    let file_log = std::fs::create_dir_all(&config.log_dir)
        .ok()
        .map(|()| tracing_appender::non_blocking(tracing_appender::rolling::daily(&config.log_dir, "akita-agent.log")));
    let file_log_layer = file_log.as_ref().map(|(writer, _guard)| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_log_layer)
        .with(TelemetryLogLayer::new(log_buffer.clone()))
        .init();

    startup::print_startup(&config, &mode);
    startup::log_startup(&config, &mode);

    let credentials = match Credentials::load() {
        Ok(creds) => creds,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load credentials; proceeding unauthenticated");
            Credentials::default()
        }
    };
    if !credentials.is_configured() {
        tracing::warn!(
            "no API credentials configured (~/.akita/credentials.yaml or AKITA_API_KEY_ID/SECRET); \
             uploads will be attempted unauthenticated"
        );
    }

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to build http client");

    let exit_code = match mode {
        RunMode::Capture { interface, offline_file } => {
            run_capture(
                config,
                &mode_with_overrides(interface, offline_file),
                credentials,
                http_client,
                log_buffer,
            )
            .await
        }
        RunMode::Daemon => run_daemon(config, credentials, http_client, log_buffer).await,
    };

    std::process::exit(exit_code);
}

/// The capture subcommand's `--interface`/`--offline-file` flags override
/// the corresponding config values for this run only.
fn mode_with_overrides(interface: Option<String>, offline_file: Option<String>) -> RunMode {
    RunMode::Capture { interface, offline_file }
}

async fn run_capture(
    mut config: Config,
    overrides: &RunMode,
    credentials: Credentials,
    http_client: reqwest::Client,
    log_buffer: LogBuffer,
) -> i32 {
    if let RunMode::Capture { interface, offline_file } = overrides {
        if interface.is_some() {
            config.capture.interface = interface.clone();
        }
        if offline_file.is_some() {
            config.capture.offline_file = offline_file.clone();
        }
    }

    if let Some(path) = &config.capture.offline_file {
        if path.ends_with(".har") {
            return run_har_conversion(path, &config, http_client, log_buffer).await;
        }
    }

    let sources = match build_sources(&config.capture) {
        Ok(sources) => sources,
        Err(e) => {
            tracing::error!(error = %e, "failed to open capture source(s)");
            return 2;
        }
    };

    let limits = capture::ReassemblerLimits {
        max_buffered_bytes_per_connection: config.capture.max_buffered_bytes_per_connection,
        max_buffered_bytes_total: config.capture.max_buffered_bytes_total,
        stream_timeout: std::time::Duration::from_secs(config.capture.stream_timeout_secs),
    };

    let filter_chain = Arc::new(FilterChain::new(&config.filters));

    let mut plugin_pipeline = EventPipeline::new();
    plugin_pipeline.register(ObfuscationPlugin::new(ObfuscationConfig {
        redact_headers: config.pipeline.redact_headers.clone(),
        redact_bodies: config.pipeline.redact_bodies,
    }));
    let plugin_pipeline = Arc::new(plugin_pipeline);

    let rotation = match (&config.backend.control_plane_url, &config.backend.service_id) {
        (Some(url), Some(service_id)) if config.backend.trace_rotate_interval_secs > 0 => {
            Some(collector::TraceRotation {
                control_plane: Arc::new(control_plane::ControlPlaneClient::new(
                    url.clone(),
                    credentials.api_key_id.clone(),
                    credentials.api_key_secret.clone(),
                    config.daemon.long_poll_timeout_secs,
                )),
                service_id: service_id.clone(),
            })
        }
        _ => None,
    };
    let (collector, collector_join) = BackendCollector::spawn(
        config.backend.clone(),
        http_client.clone(),
        collector::placeholder_trace_id(),
        rotation,
    );

    let capture_counters = Arc::new(CaptureCounters::default());

    let telemetry = TelemetryReporter::new(
        config.telemetry.clone(),
        http_client.clone(),
        capture_counters.clone(),
        filter_chain.counters.clone(),
        collector.metrics.clone(),
        log_buffer,
        None,
        credentials.fingerprint(),
    );
    let (telemetry_shutdown_tx, telemetry_shutdown_rx) = tokio::sync::oneshot::channel();
    let telemetry_join = telemetry.spawn(telemetry_shutdown_rx);

    let (engine_shutdown_tx, engine_shutdown_rx) = tokio::sync::oneshot::channel();
    let engine = CaptureEngine::new(capture_counters);
    let engine_join = tokio::spawn(engine.run(
        sources,
        limits,
        config.capture.max_http_length,
        config.capture.parse_tls_handshakes,
        filter_chain,
        plugin_pipeline.clone(),
        collector.clone(),
        engine_shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutdown requested, draining capture pipeline");

    let _ = engine_shutdown_tx.send(());
    let _ = engine_join.await;

    if let Err(e) = plugin_pipeline.shutdown() {
        tracing::warn!(error = %e, "plugin pipeline shutdown reported an error");
    }

    collector.shutdown().await;
    let _ = collector_join.await;

    let _ = telemetry_shutdown_tx.send(());
    let _ = telemetry_join.await;

    tracing::info!("shutdown complete");
    0
}

/// HAR files are a finite conversion, not a long-running capture: read
/// every entry, push each synthesized witness through the same filter/
/// plugin/collector path a live witness would take, flush, and exit --
/// there is no reassembler/parser/pairer stage to drive since a HAR entry
/// already carries a paired request and response.
async fn run_har_conversion(
    path: &str,
    config: &Config,
    http_client: reqwest::Client,
    _log_buffer: LogBuffer,
) -> i32 {
    let witnesses = match har::parse_har_file(std::path::Path::new(path)) {
        Ok(witnesses) => witnesses,
        Err(e) => {
            tracing::error!(error = %e, path, "failed to read HAR file");
            return 2;
        }
    };
    tracing::info!(path, count = witnesses.len(), "converting HAR entries to witnesses");

    let filter_chain = FilterChain::new(&config.filters);

    let mut plugin_pipeline = EventPipeline::new();
    plugin_pipeline.register(ObfuscationPlugin::new(ObfuscationConfig {
        redact_headers: config.pipeline.redact_headers.clone(),
        redact_bodies: config.pipeline.redact_bodies,
    }));

    let (collector, collector_join) =
        BackendCollector::spawn(config.backend.clone(), http_client.clone(), collector::placeholder_trace_id(), None);

    for witness in witnesses {
        let host = witness.request.as_ref().and_then(|r| r.headers.get("host"));
        if !filter_chain.admit(&witness, host) {
            continue;
        }
        let ctx = pipeline::ProcessContext::default();
        if let Some(processed) = plugin_pipeline.process(&witness, &ctx) {
            collector.enqueue(processed.into_owned()).await;
        }
    }

    collector.shutdown().await;
    let _ = collector_join.await;
    tracing::info!("HAR conversion complete");
    0
}

fn build_sources(config: &config::CaptureConfig) -> Result<Vec<capture::PacketSource>, error::CaptureError> {
    if let Some(path) = &config.offline_file {
        return Ok(vec![capture::PacketSource::new(capture::CaptureSourceKind::OfflineFile {
            path: path.clone(),
        })]);
    }

    let interface = match &config.interface {
        Some(iface) => iface.clone(),
        None => {
            let devices = capture::list_interfaces()?;
            devices
                .into_iter()
                .find(|name| name != "lo")
                .ok_or_else(|| error::CaptureError::OpenFailed {
                    source_name: "(auto)".into(),
                    reason: "no non-loopback interface available".into(),
                })?
        }
    };

    Ok(vec![capture::PacketSource::new(capture::CaptureSourceKind::Live {
        interface,
        bpf_filter: config.bpf_filter.clone(),
    })])
}

/// Daemon mode: the coordinator owns the service/trace/client registry;
/// this function's job is just to wire its witness output to per-trace
/// `BackendCollector`s, spawned lazily on first witness for a trace id.
///
/// Simplification: telemetry in daemon mode is given its own
/// `CollectorMetrics`, separate from the per-trace collectors the router
/// spawns below, since `TelemetryReporter` is wired to a single collector
/// in this build. A per-trace telemetry breakdown would need a small
/// registry of its own; out of scope for this pass.
async fn run_daemon(
    config: Config,
    credentials: Credentials,
    http_client: reqwest::Client,
    log_buffer: LogBuffer,
) -> i32 {
    let (witness_tx, mut witness_rx) = mpsc::channel(4096);
    let control_plane = Arc::new(control_plane::ControlPlaneClient::new(
        config.daemon.control_plane_url.clone(),
        credentials.api_key_id.clone(),
        credentials.api_key_secret.clone(),
        config.daemon.long_poll_timeout_secs,
    ));
    let (daemon_handle, daemon_join) = daemon::DaemonCoordinator::spawn(
        witness_tx,
        control_plane,
        std::time::Duration::from_secs(config.daemon.heartbeat_interval_secs),
        std::time::Duration::from_secs(config.daemon.long_poll_retry_interval_secs),
    );

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel();
    let server_join = tokio::spawn(daemon::server::run(config.daemon.bind_addr, daemon_handle.clone(), server_shutdown_rx));

    let capture_counters = Arc::new(CaptureCounters::default());
    let filter_counters = Arc::new(filter::FilterCounters::default());
    let telemetry_metrics = Arc::new(collector::CollectorMetrics::default());

    let telemetry = TelemetryReporter::new(
        config.telemetry.clone(),
        http_client.clone(),
        capture_counters,
        filter_counters,
        telemetry_metrics,
        log_buffer,
        None,
        credentials.fingerprint(),
    );
    let (telemetry_shutdown_tx, telemetry_shutdown_rx) = tokio::sync::oneshot::channel();
    let telemetry_join = telemetry.spawn(telemetry_shutdown_rx);

    let backend_config = config.backend.clone();
    let router_http = http_client.clone();
    let router_join = tokio::spawn(async move {
        let mut collectors: HashMap<String, (BackendCollector, tokio::task::JoinHandle<()>)> = HashMap::new();
        while let Some((trace_id, witness)) = witness_rx.recv().await {
            let (collector, _) = collectors.entry(trace_id.clone()).or_insert_with(|| {
                BackendCollector::spawn(backend_config.clone(), router_http.clone(), trace_id.clone(), None)
            });
            collector.enqueue(witness).await;
        }
        for (_, (collector, join)) in collectors {
            collector.shutdown().await;
            let _ = join.await;
        }
    });

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutdown requested, draining daemon");

    let _ = server_shutdown_tx.send(());
    let _ = server_join.await;
    let _ = telemetry_shutdown_tx.send(());

    drop(daemon_handle);
    let _ = daemon_join.await;
    let _ = router_join.await;
    let _ = telemetry_join.await;

    tracing::info!("shutdown complete");
    0
}
