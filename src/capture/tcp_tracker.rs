//! TCPTracker: rolls SYN/ACK/FIN/RST flags into per-connection metadata.
//!
//! Named after the `ConnTracker` vocabulary used for this kind of
//! per-flow bookkeeping: a connection only gets an entry once a SYN (or a
//! SYN-ACK observed on an already-tracked reverse flow) is seen. A lone ACK
//! with no prior SYN and no payload does not create an entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::witness::{ConnectionEndState, ConnectionID, ConnectionSummary, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlag {
    Syn,
    SynAck,
    Fin,
    FinAck,
    Rst,
    Ack,
}

#[derive(Debug, Clone)]
pub struct TcpConnectionMetadata {
    pub initiator: ConnectionID,
    pub syn_seen: bool,
    pub syn_ack_seen: bool,
    pub fin_seen: bool,
    pub rst_seen: bool,
    pub first_observed: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
}

impl TcpConnectionMetadata {
    pub fn end_state(&self) -> ConnectionEndState {
        if self.rst_seen {
            ConnectionEndState::Reset
        } else if self.fin_seen {
            ConnectionEndState::Closed
        } else {
            ConnectionEndState::Open
        }
    }

    pub fn to_summary(&self, connection_id: ConnectionID) -> ConnectionSummary {
        ConnectionSummary {
            connection_id,
            initiator: self.initiator,
            end_state: self.end_state(),
            first_observed: self.first_observed,
            last_observed: self.last_observed,
        }
    }
}

/// Result of one `observe()` call: whether this is the first time this
/// connection was tracked, and whether its end state just transitioned
/// into `Closed`/`Reset` (the two moments a connection-metadata unit
/// should be emitted upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOutcome {
    pub is_new: bool,
    pub just_closed: bool,
}

pub struct TcpTracker {
    connections: HashMap<ConnectionID, TcpConnectionMetadata>,
}

impl TcpTracker {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Record one packet's flags and payload presence for a connection,
    /// keyed by the frame's as-observed (src, dst) tuple.
    ///
    /// This is the single place that canonicalizes a connection: the first
    /// tuple orientation seen for a flow becomes its `ConnectionID` (and is
    /// recorded as `initiator`); every later packet, in either direction,
    /// resolves back to that same id via a reverse-tuple lookup. Returns
    /// the canonical `ConnectionID`, this packet's `Direction` relative to
    /// the initiator (`Outbound` if the observed tuple matches the
    /// initiator's orientation, `Inbound` if it's the reverse), the
    /// (possibly newly created) connection metadata, and a transition
    /// summary, or `None` if the packet does not warrant creating an
    /// entry (a lone ACK with no prior SYN and no payload), in which case
    /// no canonical id can be derived and the caller has nothing to key
    /// reassembly on.
    pub fn observe(
        &mut self,
        connection_id: ConnectionID,
        flag: TcpFlag,
        has_payload: bool,
    ) -> Option<(ConnectionID, Direction, &TcpConnectionMetadata, ObserveOutcome)> {
        let reverse = connection_id.reversed();
        let now = Utc::now();

        let mut is_new = false;
        if !self.connections.contains_key(&connection_id) && !self.connections.contains_key(&reverse) {
            let should_create = matches!(flag, TcpFlag::Syn) || has_payload;
            if !should_create {
                return None;
            }
            is_new = true;
            self.connections.insert(
                connection_id,
                TcpConnectionMetadata {
                    initiator: connection_id,
                    syn_seen: matches!(flag, TcpFlag::Syn),
                    syn_ack_seen: false,
                    fin_seen: false,
                    rst_seen: false,
                    first_observed: now,
                    last_observed: now,
                },
            );
        }

        let key = if self.connections.contains_key(&connection_id) {
            connection_id
        } else {
            reverse
        };
        let direction = if key == connection_id {
            Direction::Outbound
        } else {
            Direction::Inbound
        };

        let meta = self.connections.get_mut(&key)?;
        let was_closed = meta.fin_seen || meta.rst_seen;
        meta.last_observed = now;
        match flag {
            TcpFlag::Syn => meta.syn_seen = true,
            TcpFlag::SynAck => meta.syn_ack_seen = true,
            TcpFlag::Fin | TcpFlag::FinAck => meta.fin_seen = true,
            TcpFlag::Rst => meta.rst_seen = true,
            TcpFlag::Ack => {}
        }
        let just_closed = !was_closed && (meta.fin_seen || meta.rst_seen);

        self.connections
            .get(&key)
            .map(|meta| (key, direction, meta, ObserveOutcome { is_new, just_closed }))
    }

    /// Evict connections that have seen a FIN/FIN-ACK handshake or an RST.
    pub fn reap_closed(&mut self) {
        self.connections
            .retain(|_, meta| !(meta.fin_seen || meta.rst_seen));
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for TcpTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionID {
        ConnectionID::new(
            "10.0.0.1".parse().unwrap(),
            4000,
            "10.0.0.2".parse().unwrap(),
            443,
        )
    }

    #[test]
    fn lone_ack_with_no_payload_creates_no_entry() {
        let mut tracker = TcpTracker::new();
        let result = tracker.observe(conn(), TcpFlag::Ack, false);
        assert!(result.is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn syn_creates_entry_and_fin_marks_closed() {
        let mut tracker = TcpTracker::new();
        tracker.observe(conn(), TcpFlag::Syn, false);
        assert_eq!(tracker.len(), 1);
        tracker.observe(conn(), TcpFlag::SynAck, false);
        tracker.observe(conn(), TcpFlag::Fin, false);
        tracker.reap_closed();
        assert!(tracker.is_empty());
    }

    #[test]
    fn syn_on_reverse_tuple_tracks_same_connection() {
        let mut tracker = TcpTracker::new();
        tracker.observe(conn(), TcpFlag::Syn, false);
        tracker.observe(conn().reversed(), TcpFlag::SynAck, false);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn both_directions_resolve_to_the_same_canonical_id_with_opposite_direction() {
        let mut tracker = TcpTracker::new();
        let (forward_id, forward_dir, ..) = tracker.observe(conn(), TcpFlag::Syn, false).unwrap();
        let (reverse_id, reverse_dir, ..) = tracker
            .observe(conn().reversed(), TcpFlag::SynAck, false)
            .unwrap();
        assert_eq!(forward_id, reverse_id);
        assert_eq!(forward_dir, Direction::Outbound);
        assert_eq!(reverse_dir, Direction::Inbound);

        // A later data packet in the original direction still resolves to
        // the same canonical id and Outbound direction.
        let (later_id, later_dir, ..) = tracker.observe(conn(), TcpFlag::Ack, true).unwrap();
        assert_eq!(later_id, forward_id);
        assert_eq!(later_dir, Direction::Outbound);
    }
}
