//! L7Parser: recognizes HTTP/1.x messages and TLS handshake metadata from
//! reassembled byte streams, producing `ParsedUnit`s in wire order.
//!
//! One `L7Parser` belongs to exactly one capture task and keeps a small
//! per-(connection, direction) buffer of bytes not yet resolved into a
//! complete unit. Malformed messages are sampled (see `SampledReservoir`)
//! and the recognizer resyncs to the next plausible boundary rather than
//! tearing down the connection.

pub mod http;
pub mod tls;

use std::collections::HashMap;

use crate::sampled_reservoir::SampledReservoir;
use crate::witness::{ConnectionID, Direction, ParsedUnit, ParsedUnitKind};

const DEFAULT_MAX_HTTP_LENGTH: usize = 1024 * 1024;
const MALFORMED_SAMPLE_CAPACITY: usize = 32;

struct StreamState {
    buffer: Vec<u8>,
    consumed_offset: u32,
}

impl StreamState {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            consumed_offset: 0,
        }
    }
}

pub struct L7Parser {
    streams: HashMap<(ConnectionID, Direction), StreamState>,
    max_http_length: usize,
    parse_tls_handshakes: bool,
    malformed_samples: SampledReservoir<String>,
}

impl L7Parser {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_HTTP_LENGTH, true)
    }

    pub fn with_limits(max_http_length: usize, parse_tls_handshakes: bool) -> Self {
        Self {
            streams: HashMap::new(),
            max_http_length,
            parse_tls_handshakes,
            malformed_samples: SampledReservoir::new(MALFORMED_SAMPLE_CAPACITY),
        }
    }

    /// Feed newly-ready bytes for one (connection, direction) and return
    /// every `ParsedUnit` that could be recognized from the accumulated
    /// buffer. May return zero, one, or several units (pipelined requests).
    pub fn feed(
        &mut self,
        connection_id: ConnectionID,
        direction: Direction,
        bytes: &[u8],
    ) -> Vec<ParsedUnit> {
        let state = self
            .streams
            .entry((connection_id, direction))
            .or_insert_with(StreamState::new);
        state.buffer.extend_from_slice(bytes);

        let mut units = Vec::new();
        loop {
            let seq = state.consumed_offset;
            let is_request = matches!(direction, Direction::Outbound);

            let outcome = if is_request {
                match http::try_parse_request(&state.buffer, self.max_http_length) {
                    http::HttpParseOutcome::Complete { message, consumed } => {
                        Some((ParsedUnitKind::HttpRequest(message), consumed))
                    }
                    http::HttpParseOutcome::Incomplete => None,
                    http::HttpParseOutcome::NotHttp => {
                        self.malformed_samples.record(format!(
                            "{}:{} unrecognized request bytes",
                            connection_id, seq
                        ));
                        Some((
                            ParsedUnitKind::Unrecognized {
                                reason: "not HTTP/1.x".into(),
                            },
                            state.buffer.len(),
                        ))
                    }
                }
            } else {
                let tls_outcome = if self.parse_tls_handshakes {
                    tls::try_parse_handshake(&state.buffer)
                } else {
                    tls::TlsParseOutcome::NotTls
                };
                match tls_outcome {
                    tls::TlsParseOutcome::ClientHello(meta) => {
                        Some((ParsedUnitKind::TlsClientHello(meta), state.buffer.len()))
                    }
                    tls::TlsParseOutcome::ServerHello(meta) => {
                        Some((ParsedUnitKind::TlsServerHello(meta), state.buffer.len()))
                    }
                    tls::TlsParseOutcome::Incomplete => None,
                    tls::TlsParseOutcome::NotTls => match http::try_parse_response(
                        &state.buffer,
                        self.max_http_length,
                    ) {
                        http::HttpParseOutcome::Complete { message, consumed } => {
                            Some((ParsedUnitKind::HttpResponse(message), consumed))
                        }
                        http::HttpParseOutcome::Incomplete => None,
                        http::HttpParseOutcome::NotHttp => {
                            self.malformed_samples.record(format!(
                                "{}:{} unrecognized response bytes",
                                connection_id, seq
                            ));
                            Some((
                                ParsedUnitKind::Unrecognized {
                                    reason: "not HTTP/1.x or TLS".into(),
                                },
                                state.buffer.len(),
                            ))
                        }
                    },
                }
            };

            let Some((kind, consumed)) = outcome else {
                break;
            };
            if consumed == 0 {
                break;
            }

            state.buffer.drain(..consumed);
            state.consumed_offset = state.consumed_offset.wrapping_add(consumed as u32);

            units.push(ParsedUnit {
                connection_id,
                direction,
                seq,
                observed_at: chrono::Utc::now(),
                kind,
            });

            if state.buffer.is_empty() {
                break;
            }
        }

        units
    }

    pub fn malformed_samples(&self) -> &SampledReservoir<String> {
        &self.malformed_samples
    }

    pub fn drop_connection(&mut self, connection_id: ConnectionID) {
        self.streams.retain(|(id, _), _| *id != connection_id);
    }
}

impl Default for L7Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionID {
        ConnectionID::new(
            "127.0.0.1".parse().unwrap(),
            1234,
            "127.0.0.1".parse().unwrap(),
            443,
        )
    }

    #[test]
    fn feeds_single_request_unit() {
        let mut parser = L7Parser::new();
        let units = parser.feed(
            conn(),
            Direction::Outbound,
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0].kind, ParsedUnitKind::HttpRequest(_)));
    }

    #[test]
    fn pipelined_requests_yield_multiple_units_with_increasing_seq() {
        let mut parser = L7Parser::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        buf.extend_from_slice(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        let units = parser.feed(conn(), Direction::Outbound, &buf);
        assert_eq!(units.len(), 2);
        assert!(units[0].seq < units[1].seq);
    }
}
