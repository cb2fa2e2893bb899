//! Capture-mode engine: the glue between §4.1-§4.7 of the design. Each
//! component (reassembler, parser, pairer, filter chain, plugin
//! pipeline, collector) owns its own contract in isolation; this module
//! owns the channels and per-connection bookkeeping that connect them
//! into the single running pipeline `akita-agent capture` drives.
//!
//! TCP/TLS metadata units don't pair through the `FlowPairer` (they have
//! no complementary half) — they're stashed per connection here and
//! attached to the next witness observed on that connection, per the
//! data model's note that connection metadata "rides along" with
//! whichever witness comes next rather than being its own emission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::capture::{self, PacketSource, ReassemblerLimits};
use crate::collector::BackendCollector;
use crate::filter::FilterChain;
use crate::pipeline::{EventPipeline, ProcessContext};
use crate::telemetry::CaptureCounters;
use crate::witness::{
    ConnectionID, ConnectionSummary, FlowPairer, ParsedUnit, ParsedUnitKind, TlsHandshakeMeta,
    Witness,
};

const PAIRING_TTL: Duration = Duration::from_secs(30);
const GAP_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct PendingMetadata {
    tcp: Option<ConnectionSummary>,
    tls: Option<TlsHandshakeMeta>,
}

pub struct CaptureEngine {
    capture_counters: Arc<CaptureCounters>,
}

impl CaptureEngine {
    pub fn new(capture_counters: Arc<CaptureCounters>) -> Self {
        Self { capture_counters }
    }

    /// Spawn one capture task per source and run the pairing/filter/
    /// pipeline/collector consumer loop until every capture task ends
    /// (offline mode exhausts its file) or `shutdown` fires.
    pub async fn run(
        self,
        sources: Vec<PacketSource>,
        limits: ReassemblerLimits,
        max_http_length: usize,
        parse_tls_handshakes: bool,
        filter_chain: Arc<FilterChain>,
        plugin_pipeline: Arc<EventPipeline>,
        collector: BackendCollector,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let (unit_tx, mut unit_rx) = mpsc::channel::<ParsedUnit>(4096);

        let mut capture_tasks = Vec::new();
        for source in sources {
            let tx = unit_tx.clone();
            capture_tasks.push(tokio::spawn(capture::run_capture_pipeline(
                source,
                limits,
                max_http_length,
                parse_tls_handshakes,
                tx,
            )));
        }
        drop(unit_tx);

        let mut pairers: HashMap<ConnectionID, FlowPairer> = HashMap::new();
        let mut pending_meta: HashMap<ConnectionID, PendingMetadata> = HashMap::new();
        let mut gap_interval = tokio::time::interval(GAP_FLUSH_INTERVAL);

        loop {
            tokio::select! {
                maybe_unit = unit_rx.recv() => {
                    let Some(unit) = maybe_unit else { break };
                    self.handle_unit(unit, &mut pairers, &mut pending_meta, &filter_chain, &plugin_pipeline, &collector).await;
                }
                _ = gap_interval.tick() => {
                    self.flush_expired(&mut pairers, &mut pending_meta, &filter_chain, &plugin_pipeline, &collector).await;
                }
                _ = &mut shutdown => {
                    debug!("capture engine shutting down");
                    break;
                }
            }
        }

        for task in capture_tasks {
            task.abort();
        }
    }

    async fn handle_unit(
        &self,
        unit: ParsedUnit,
        pairers: &mut HashMap<ConnectionID, FlowPairer>,
        pending_meta: &mut HashMap<ConnectionID, PendingMetadata>,
        filter_chain: &FilterChain,
        plugin_pipeline: &EventPipeline,
        collector: &BackendCollector,
    ) {
        let connection_id = unit.connection_id;

        match &unit.kind {
            ParsedUnitKind::HttpRequest(_) => {
                self.capture_counters.record_request(connection_id.dst_port);
            }
            ParsedUnitKind::HttpResponse(_) => {
                self.capture_counters.record_response(connection_id.dst_port);
            }
            ParsedUnitKind::Unrecognized { .. } => {
                self.capture_counters.record_parse_error(connection_id.dst_port);
                return;
            }
            ParsedUnitKind::TcpPacketMetadata { .. } => {
                self.capture_counters.record_packet(connection_id.dst_port);
                return;
            }
            ParsedUnitKind::TcpConnectionMetadata(summary) => {
                pending_meta.entry(connection_id).or_default().tcp = Some(summary.clone());
                return;
            }
            ParsedUnitKind::TlsClientHello(meta) | ParsedUnitKind::TlsServerHello(meta) => {
                pending_meta.entry(connection_id).or_default().tls = Some(meta.clone());
                return;
            }
        }

        let pairer = pairers
            .entry(connection_id)
            .or_insert_with(|| FlowPairer::new(connection_id, PAIRING_TTL));
        if let Some(mut witness) = pairer.accept(unit) {
            if let Some(meta) = pending_meta.remove(&connection_id) {
                witness.tcp_metadata = meta.tcp;
                witness.tls_handshake = meta.tls;
            }
            if pairer.is_empty() {
                pairers.remove(&connection_id);
            }
            self.emit(witness, filter_chain, plugin_pipeline, collector).await;
        }
    }

    async fn flush_expired(
        &self,
        pairers: &mut HashMap<ConnectionID, FlowPairer>,
        pending_meta: &mut HashMap<ConnectionID, PendingMetadata>,
        filter_chain: &FilterChain,
        plugin_pipeline: &EventPipeline,
        collector: &BackendCollector,
    ) {
        let mut witnesses = Vec::new();
        let mut emptied = Vec::new();
        for (connection_id, pairer) in pairers.iter_mut() {
            for mut witness in pairer.flush_expired() {
                if let Some(meta) = pending_meta.get_mut(connection_id) {
                    witness.tcp_metadata = meta.tcp.take();
                    witness.tls_handshake = meta.tls.take();
                }
                witnesses.push(witness);
            }
            if pairer.is_empty() {
                emptied.push(*connection_id);
            }
        }
        for connection_id in emptied {
            pairers.remove(&connection_id);
            pending_meta.remove(&connection_id);
        }
        for witness in witnesses {
            self.emit(witness, filter_chain, plugin_pipeline, collector).await;
        }
    }

    async fn emit(
        &self,
        witness: Witness,
        filter_chain: &FilterChain,
        plugin_pipeline: &EventPipeline,
        collector: &BackendCollector,
    ) {
        let host = witness.request.as_ref().and_then(|r| r.headers.get("host"));
        if !filter_chain.admit(&witness, host) {
            return;
        }
        let ctx = ProcessContext::default();
        if let Some(processed) = plugin_pipeline.process(&witness, &ctx) {
            collector.enqueue(processed.into_owned()).await;
        }
    }
}
