//! FlowPairer: pairs `ParsedUnit` halves into `Witness`es.
//!
//! One `FlowPairer` instance owns pairing state for a single connection.
//! Halves are kept in a `Seq -> PendingHalf` map; a pipelined request can
//! have more than one half waiting on the same `Seq`, so each slot is a
//! small FIFO queue rather than a single value.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::witness::model::{
    ConnectionID, Direction, ParsedUnit, ParsedUnitKind, Witness, WitnessSide,
};

#[derive(Debug)]
enum PendingHalf {
    Request(WitnessSide),
    Response(WitnessSide),
}

struct PendingEntry {
    halves: VecDeque<PendingHalf>,
    first_seen: Instant,
}

pub struct FlowPairer {
    connection_id: ConnectionID,
    pending: BTreeMap<u32, PendingEntry>,
    pairing_ttl: Duration,
}

impl FlowPairer {
    pub fn new(connection_id: ConnectionID, pairing_ttl: Duration) -> Self {
        Self {
            connection_id,
            pending: BTreeMap::new(),
            pairing_ttl,
        }
    }

    /// Feed one parsed unit. Returns a witness immediately if this unit
    /// completes a pair; otherwise the half is buffered.
    pub fn accept(&mut self, unit: ParsedUnit) -> Option<Witness> {
        let side = match to_side(&unit.kind, unit.observed_at) {
            Some(side) => side,
            None => return None, // TLS/TCP metadata and unrecognized units don't pair
        };
        let is_request = matches!(unit.direction, Direction::Outbound);

        let entry = self.pending.entry(unit.seq).or_insert_with(|| PendingEntry {
            halves: VecDeque::new(),
            first_seen: Instant::now(),
        });

        // Look for a complementary half already queued at this seq (FIFO).
        let complement_index = entry.halves.iter().position(|h| {
            matches!(
                (h, is_request),
                (PendingHalf::Request(_), false) | (PendingHalf::Response(_), true)
            )
        });

        if let Some(idx) = complement_index {
            let complement = entry.halves.remove(idx).expect("checked by position");
            let witness = self.build_witness(is_request, side, complement);
            if entry.halves.is_empty() {
                self.pending.remove(&unit.seq);
            }
            return Some(witness);
        }

        entry.halves.push_back(if is_request {
            PendingHalf::Request(side)
        } else {
            PendingHalf::Response(side)
        });
        None
    }

    fn build_witness(&self, new_is_request: bool, new_side: WitnessSide, complement: PendingHalf) -> Witness {
        let (request, response) = if new_is_request {
            match complement {
                PendingHalf::Response(resp) => (Some(new_side), Some(resp)),
                PendingHalf::Request(_) => unreachable!("complement matched opposite kind"),
            }
        } else {
            match complement {
                PendingHalf::Request(req) => (Some(req), Some(new_side)),
                PendingHalf::Response(_) => unreachable!("complement matched opposite kind"),
            }
        };

        Witness {
            id: Witness::new_id(),
            connection_id_display: self.connection_id.to_string(),
            trace_id: None,
            observed_at: Utc::now(),
            request,
            response,
            one_sided: false,
            tcp_metadata: None,
            tls_handshake: None,
        }
    }

    /// Flush any halves older than the pairing TTL as one-sided witnesses.
    /// Called periodically by the owning task, not on every `accept`.
    pub fn flush_expired(&mut self) -> Vec<Witness> {
        let ttl = self.pairing_ttl;
        let mut expired_seqs = Vec::new();
        for (seq, entry) in self.pending.iter() {
            if entry.first_seen.elapsed() >= ttl {
                expired_seqs.push(*seq);
            }
        }

        let mut flushed = Vec::new();
        for seq in expired_seqs {
            if let Some(entry) = self.pending.remove(&seq) {
                for half in entry.halves {
                    flushed.push(self.one_sided_witness(half));
                }
            }
        }
        flushed
    }

    fn one_sided_witness(&self, half: PendingHalf) -> Witness {
        let (request, response) = match half {
            PendingHalf::Request(req) => (Some(req), None),
            PendingHalf::Response(resp) => (None, Some(resp)),
        };
        Witness {
            id: Witness::new_id(),
            connection_id_display: self.connection_id.to_string(),
            trace_id: None,
            observed_at: Utc::now(),
            request,
            response,
            one_sided: true,
            tcp_metadata: None,
            tls_handshake: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn to_side(kind: &ParsedUnitKind, observed_at: chrono::DateTime<Utc>) -> Option<WitnessSide> {
    match kind {
        ParsedUnitKind::HttpRequest(req) => Some(WitnessSide {
            seq: 0,
            observed_at,
            method_or_status: req.method.clone(),
            path: Some(req.path.clone()),
            headers: req.headers.clone(),
            body: req.body.clone(),
            truncated: req.truncated,
        }),
        ParsedUnitKind::HttpResponse(resp) => Some(WitnessSide {
            seq: 0,
            observed_at,
            method_or_status: resp.status.to_string(),
            path: None,
            headers: resp.headers.clone(),
            body: resp.body.clone(),
            truncated: resp.truncated,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::witness::model::{Headers, HttpRequest, HttpResponse};

    fn conn() -> ConnectionID {
        ConnectionID::new(
            "127.0.0.1".parse().unwrap(),
            5555,
            "127.0.0.1".parse().unwrap(),
            443,
        )
    }

    fn request_unit(seq: u32) -> ParsedUnit {
        ParsedUnit {
            connection_id: conn(),
            direction: Direction::Outbound,
            seq,
            observed_at: Utc::now(),
            kind: ParsedUnitKind::HttpRequest(HttpRequest {
                method: "GET".into(),
                path: "/".into(),
                version: "HTTP/1.1".into(),
                headers: Headers::default(),
                body: vec![],
                truncated: false,
            }),
        }
    }

    fn response_unit(seq: u32) -> ParsedUnit {
        ParsedUnit {
            connection_id: conn(),
            direction: Direction::Inbound,
            seq,
            observed_at: Utc::now(),
            kind: ParsedUnitKind::HttpResponse(HttpResponse {
                status: 200,
                version: "HTTP/1.1".into(),
                headers: Headers::default(),
                body: vec![],
                truncated: false,
            }),
        }
    }

    #[test]
    fn pairs_request_then_response() {
        let mut pairer = FlowPairer::new(conn(), Duration::from_secs(30));
        assert!(pairer.accept(request_unit(1)).is_none());
        let witness = pairer.accept(response_unit(1)).expect("should pair");
        assert!(!witness.one_sided);
        assert!(witness.request.is_some() && witness.response.is_some());
        assert!(pairer.is_empty());
    }

    #[test]
    fn pipelined_same_seq_pairs_fifo() {
        let mut pairer = FlowPairer::new(conn(), Duration::from_secs(30));
        assert!(pairer.accept(request_unit(1)).is_none());
        assert!(pairer.accept(request_unit(1)).is_none());
        let first = pairer.accept(response_unit(1)).expect("pairs with first request");
        let second = pairer.accept(response_unit(1)).expect("pairs with second request");
        assert!(!first.one_sided && !second.one_sided);
        assert!(pairer.is_empty());
    }

    #[test]
    fn expired_half_flushes_one_sided() {
        let mut pairer = FlowPairer::new(conn(), Duration::from_millis(0));
        assert!(pairer.accept(request_unit(1)).is_none());
        std::thread::sleep(Duration::from_millis(2));
        let flushed = pairer.flush_expired();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].one_sided);
    }

    use proptest::prelude::*;

    proptest! {
        /// A witness is emitted at most once per pair: for any shuffled
        /// interleaving of N request/response halves sharing distinct
        /// seqs, exactly N two-sided witnesses come out and the pairer
        /// ends with no pending halves, regardless of arrival order.
        #[test]
        fn every_seq_pairs_exactly_once_under_any_arrival_order(
            count in 1usize..12,
            shuffle_seed in any::<u64>(),
        ) {
            let mut units: Vec<ParsedUnit> = Vec::new();
            for seq in 0..count as u32 {
                units.push(request_unit(seq));
                units.push(response_unit(seq));
            }

            let mut state = shuffle_seed | 1;
            for i in (1..units.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state % (i as u64 + 1)) as usize;
                units.swap(i, j);
            }

            let mut pairer = FlowPairer::new(conn(), Duration::from_secs(30));
            let mut witnesses = Vec::new();
            for unit in units {
                if let Some(witness) = pairer.accept(unit) {
                    witnesses.push(witness);
                }
            }

            prop_assert_eq!(witnesses.len(), count);
            prop_assert!(witnesses.iter().all(|w| !w.one_sided));
            prop_assert!(pairer.is_empty());
        }
    }
}
