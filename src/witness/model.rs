//! Core data model shared by capture, filtering, the plugin pipeline, and
//! the backend collector. See the data-model section of the design docs
//! for the ownership rules each component observes over these types.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Five-tuple identifying a TCP connection, plus the direction-agnostic
/// wall-clock time it was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionID {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl ConnectionID {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// The reverse-direction tuple, used to match a response connection
    /// against the request connection that produced it.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl std::fmt::Display for ConnectionID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Direction of a stream segment relative to the connection's initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A contiguous, reassembled span of a TCP stream handed from the
/// `StreamReassembler` to the `L7Parser`. `seq` is the stream-relative
/// sequence number of `data[0]`.
#[derive(Debug, Clone)]
pub struct StreamSegment {
    pub connection_id: ConnectionID,
    pub direction: Direction,
    pub seq: u32,
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// One fully-recognized protocol unit produced by the `L7Parser`, carrying
/// the `(StreamId, Seq)` pair the `FlowPairer` uses to order and pair halves.
#[derive(Debug, Clone)]
pub struct ParsedUnit {
    pub connection_id: ConnectionID,
    pub direction: Direction,
    pub seq: u32,
    pub observed_at: DateTime<Utc>,
    pub kind: ParsedUnitKind,
}

#[derive(Debug, Clone)]
pub enum ParsedUnitKind {
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    TlsClientHello(TlsHandshakeMeta),
    TlsServerHello(TlsHandshakeMeta),
    /// Per-packet TCP flag/length metadata, rolled up by the `TcpTracker`
    /// into `TcpConnectionMetadata`. Carried through as a `ParsedUnit` so
    /// a single channel from capture to the pairing/filter stage suffices.
    TcpPacketMetadata { flags: TcpPacketFlags, payload_len: usize },
    /// A connection-level summary emitted on state transitions (open,
    /// closed, reset). Attached to the next witness observed on this
    /// connection rather than paired on its own.
    TcpConnectionMetadata(ConnectionSummary),
    Unrecognized { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPacketFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Rolled-up per-connection TCP state, as produced by the `TcpTracker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionID,
    pub initiator: ConnectionID,
    pub end_state: ConnectionEndState,
    pub first_observed: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEndState {
    Open,
    Closed,
    Reset,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsHandshakeMeta {
    pub sni: Option<String>,
    pub version: String,
    pub cipher_suites: Vec<u16>,
}

/// A paired request/response (or a one-sided half flushed after the pairing
/// TTL) ready for filtering and plugin processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Witness {
    pub id: Uuid,
    pub connection_id_display: String,
    pub trace_id: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub request: Option<WitnessSide>,
    pub response: Option<WitnessSide>,
    pub one_sided: bool,
    pub tcp_metadata: Option<ConnectionSummary>,
    pub tls_handshake: Option<TlsHandshakeMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessSide {
    pub seq: u32,
    pub observed_at: DateTime<Utc>,
    pub method_or_status: String,
    pub path: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub truncated: bool,
}

impl Witness {
    pub fn new_id() -> Uuid {
        Uuid::new_v4()
    }

    /// Latency reconstructed from the request and response observation
    /// timestamps, in milliseconds. `None` for one-sided witnesses.
    pub fn latency_ms(&self) -> Option<i64> {
        let req = self.request.as_ref()?;
        let resp = self.response.as_ref()?;
        Some((resp.observed_at - req.observed_at).num_milliseconds())
    }
}

/// A server-managed trace: a named unit of witness collection the daemon
/// coordinator multiplexes local clients onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub service_id: String,
    pub active: bool,
}

/// A service as tracked by the daemon coordinator's registry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Service {
    pub service_id: String,
    pub traces: HashMap<String, Trace>,
}

/// A local client that registered with the daemon for a given service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    pub service_name: String,
    pub registered_at: DateTime<Utc>,
    /// The set of active trace ids the client is currently known to be
    /// registered against, as of the last `ActiveTraceDiff` it was sent.
    pub active_trace_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_reversed_round_trips() {
        let id = ConnectionID::new(
            "10.0.0.1".parse().unwrap(),
            4000,
            "10.0.0.2".parse().unwrap(),
            443,
        );
        assert_eq!(id.reversed().reversed(), id);
    }

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let mut h = Headers::default();
        h.push("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("missing"), None);
    }
}
