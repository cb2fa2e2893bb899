//! Packet capture and TCP reassembly.
//!
//! Each interface gets one producer task. All per-flow state (the
//! `StreamReassembler`, `TcpTracker`, and `L7Parser` instances) is confined
//! to that task; nothing here is shared across capture tasks.

pub mod reassembly;
pub mod source;
pub mod tcp_tracker;

pub use reassembly::{FeedOutcome, ReassemblerLimits, StreamReassembler};
pub use source::{CaptureSourceKind, PacketSource, RawSegment};
pub use tcp_tracker::{TcpFlag, TcpTracker};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::parser::L7Parser;
use crate::witness::{ParsedUnit, ParsedUnitKind, StreamSegment};

/// Runs one capture source end to end: pulls raw segments, tracks TCP
/// connection state, feeds the reassembler, and hands reassembled bytes to
/// the parser, emitting `ParsedUnit`s on `unit_tx`.
pub async fn run_capture_pipeline(
    source: PacketSource,
    limits: ReassemblerLimits,
    max_http_length: usize,
    parse_tls_handshakes: bool,
    unit_tx: mpsc::Sender<ParsedUnit>,
) {
    let source_name = source.name();
    let (raw_tx, mut raw_rx) = mpsc::channel::<RawSegment>(4096);

    let capture_task = tokio::spawn(async move {
        if let Err(err) = source.run(raw_tx).await {
            warn!(source = %source_name, error = %err, "capture source ended");
        }
    });

    let mut reassembler = StreamReassembler::new(limits);
    let mut tracker = TcpTracker::new();
    let mut parser = L7Parser::with_limits(max_http_length, parse_tls_handshakes);

    let mut gap_check = tokio::time::interval(std::time::Duration::from_secs(5));

    loop {
        tokio::select! {
            maybe_segment = raw_rx.recv() => {
                let Some(raw) = maybe_segment else { break };
                handle_raw_segment(raw, &mut reassembler, &mut tracker, &mut parser, &unit_tx).await;
            }
            _ = gap_check.tick() => {
                let advanced = reassembler.advance_stale_gaps();
                if advanced > 0 {
                    debug!(streams = advanced, "advanced past stale reassembly gaps");
                }
                tracker.reap_closed();
            }
        }
    }

    capture_task.abort();
}

async fn handle_raw_segment(
    raw: RawSegment,
    reassembler: &mut StreamReassembler,
    tracker: &mut TcpTracker,
    parser: &mut L7Parser,
    unit_tx: &mpsc::Sender<ParsedUnit>,
) {
    let flag = if raw.rst {
        TcpFlag::Rst
    } else if raw.syn && raw.ack {
        TcpFlag::SynAck
    } else if raw.syn {
        TcpFlag::Syn
    } else if raw.fin && raw.ack {
        TcpFlag::FinAck
    } else if raw.fin {
        TcpFlag::Fin
    } else {
        TcpFlag::Ack
    };
    // `tracker.observe` resolves this frame's as-observed (src, dst) tuple
    // to the flow's canonical `ConnectionID` and this packet's `Direction`
    // relative to whichever side sent the first packet of the flow; every
    // downstream consumer keys off that canonical id, never the raw tuple.
    let Some((connection_id, direction, meta, outcome)) =
        tracker.observe(raw.connection_id, flag, !raw.payload.is_empty())
    else {
        return;
    };

    if outcome.is_new || outcome.just_closed {
        let summary = meta.to_summary(connection_id);
        let unit = ParsedUnit {
            connection_id,
            direction,
            seq: raw.seq,
            observed_at: chrono::Utc::now(),
            kind: ParsedUnitKind::TcpConnectionMetadata(summary),
        };
        let _ = unit_tx.send(unit).await;
    }

    if raw.payload.is_empty() {
        return;
    }

    let segment = StreamSegment {
        connection_id,
        direction,
        seq: raw.seq,
        data: raw.payload,
        captured_at: chrono::Utc::now(),
    };

    if matches!(reassembler.feed(segment), FeedOutcome::Dropped) {
        return;
    }

    let ready = reassembler.take_ready(connection_id, direction);
    if ready.is_empty() {
        return;
    }

    for unit in parser.feed(connection_id, direction, &ready) {
        if unit_tx.send(unit).await.is_err() {
            return;
        }
    }
}

/// Enumerate local interfaces suitable for live capture, mirroring what a
/// `--list-interfaces` CLI flag would show.
pub fn list_interfaces() -> Result<Vec<String>, crate::error::CaptureError> {
    pcap::Device::list()
        .map(|devices| devices.into_iter().map(|d| d.name).collect())
        .map_err(|e| crate::error::CaptureError::OpenFailed {
            source_name: "(enumerate)".into(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::witness::{Direction, FlowPairer};
    use std::time::Duration;

    fn client_to_server(seq: u32, syn: bool, ack: bool, payload: &[u8]) -> RawSegment {
        RawSegment {
            connection_id: crate::witness::ConnectionID::new(
                "10.0.0.1".parse().unwrap(),
                40000,
                "10.0.0.2".parse().unwrap(),
                80,
            ),
            seq,
            syn,
            fin: false,
            rst: false,
            ack,
            payload: payload.to_vec(),
        }
    }

    fn server_to_client(seq: u32, syn: bool, ack: bool, payload: &[u8]) -> RawSegment {
        RawSegment {
            connection_id: crate::witness::ConnectionID::new(
                "10.0.0.2".parse().unwrap(),
                80,
                "10.0.0.1".parse().unwrap(),
                40000,
            ),
            seq,
            syn,
            fin: false,
            rst: false,
            ack,
            payload: payload.to_vec(),
        }
    }

    /// Spec §8 scenario 1, driven through the real capture wiring
    /// (`handle_raw_segment`) rather than hand-built `ParsedUnit`s: a
    /// three-way handshake followed by one request and one response on
    /// opposite tuple orientations of the same flow must resolve to the
    /// same `ConnectionID` with opposite directions, and the parser must
    /// recognize the response as a response (not fail into `Unrecognized`
    /// via the request parser).
    #[tokio::test]
    async fn request_and_response_on_opposite_tuples_pair_into_one_witness() {
        let mut reassembler = StreamReassembler::new(ReassemblerLimits::default());
        let mut tracker = TcpTracker::new();
        let mut parser = L7Parser::new();
        let (tx, mut rx) = mpsc::channel::<ParsedUnit>(16);

        handle_raw_segment(client_to_server(0, true, false, b""), &mut reassembler, &mut tracker, &mut parser, &tx).await;
        handle_raw_segment(server_to_client(0, true, true, b""), &mut reassembler, &mut tracker, &mut parser, &tx).await;

        let request = b"GET /v1/foo HTTP/1.1\r\nHost: api.example\r\n\r\n";
        handle_raw_segment(
            client_to_server(1, false, true, request),
            &mut reassembler,
            &mut tracker,
            &mut parser,
            &tx,
        )
        .await;

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        handle_raw_segment(
            server_to_client(1, false, true, response),
            &mut reassembler,
            &mut tracker,
            &mut parser,
            &tx,
        )
        .await;

        drop(tx);
        let mut units = Vec::new();
        while let Some(unit) = rx.recv().await {
            units.push(unit);
        }

        let request_unit = units
            .iter()
            .find(|u| matches!(u.kind, ParsedUnitKind::HttpRequest(_)))
            .expect("request unit recognized");
        let response_unit = units
            .iter()
            .find(|u| matches!(u.kind, ParsedUnitKind::HttpResponse(_)))
            .expect("response was parsed as a response, not Unrecognized");

        assert_eq!(request_unit.connection_id, response_unit.connection_id);
        assert_eq!(request_unit.direction, Direction::Outbound);
        assert_eq!(response_unit.direction, Direction::Inbound);

        let mut pairer = FlowPairer::new(request_unit.connection_id, Duration::from_secs(30));
        let mut witness = None;
        for unit in units.into_iter().filter(|u| {
            matches!(
                u.kind,
                ParsedUnitKind::HttpRequest(_) | ParsedUnitKind::HttpResponse(_)
            )
        }) {
            if let Some(w) = pairer.accept(unit) {
                witness = Some(w);
            }
        }
        let witness = witness.expect("one paired witness from the real capture wiring");
        assert!(!witness.one_sided);
        assert!(witness.request.is_some());
        assert!(witness.response.is_some());
    }
}
