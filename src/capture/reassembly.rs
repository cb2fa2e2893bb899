//! StreamReassembler: per-(ConnectionID, direction) out-of-order buffering.
//!
//! Segments arrive keyed by their stream-relative sequence number. A segment
//! that fills the next expected byte range is appended to the ready stream
//! immediately; anything ahead of the gap is held in a `BTreeMap` until the
//! gap fills or `stream_timeout` elapses, at which point the parser is
//! advanced past the gap (a "desync", counted but not an error).

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::witness::{ConnectionID, Direction, StreamSegment};

struct DirectionBuffer {
    next_seq: u32,
    out_of_order: BTreeMap<u32, Bytes>,
    ready: BytesMut,
    buffered_bytes: usize,
    last_progress: Instant,
    desync_count: u64,
}

impl DirectionBuffer {
    fn new(initial_seq: u32) -> Self {
        Self {
            next_seq: initial_seq,
            out_of_order: BTreeMap::new(),
            ready: BytesMut::new(),
            buffered_bytes: 0,
            last_progress: Instant::now(),
            desync_count: 0,
        }
    }
}

#[derive(Clone, Copy)]
pub struct ReassemblerLimits {
    pub max_buffered_bytes_per_connection: usize,
    pub max_buffered_bytes_total: usize,
    pub stream_timeout: Duration,
}

impl Default for ReassemblerLimits {
    fn default() -> Self {
        Self {
            max_buffered_bytes_per_connection: 4 * 1024 * 1024,
            max_buffered_bytes_total: 256 * 1024 * 1024,
            stream_timeout: Duration::from_secs(60),
        }
    }
}

/// Owns reassembly state for every connection this capture task sees. A
/// `StreamReassembler` instance belongs to exactly one producer task; it is
/// never shared across tasks.
pub struct StreamReassembler {
    buffers: HashMap<(ConnectionID, Direction), DirectionBuffer>,
    limits: ReassemblerLimits,
    total_buffered_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Buffered,
    Dropped,
}

impl StreamReassembler {
    pub fn new(limits: ReassemblerLimits) -> Self {
        Self {
            buffers: HashMap::new(),
            limits,
            total_buffered_bytes: 0,
        }
    }

    /// Feed one captured segment. Returns `Dropped` if the connection or
    /// global buffer cap was hit (segment discarded, counted by the caller).
    pub fn feed(&mut self, segment: StreamSegment) -> FeedOutcome {
        let key = (segment.connection_id, segment.direction);
        let seg_len = segment.data.len();

        if self.total_buffered_bytes + seg_len > self.limits.max_buffered_bytes_total {
            return FeedOutcome::Dropped;
        }

        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| DirectionBuffer::new(segment.seq));

        if buffer.buffered_bytes + seg_len > self.limits.max_buffered_bytes_per_connection {
            return FeedOutcome::Dropped;
        }

        if segment.seq == buffer.next_seq {
            buffer.ready.extend_from_slice(&segment.data);
            buffer.next_seq = buffer.next_seq.wrapping_add(seg_len as u32);
            buffer.last_progress = Instant::now();
            Self::drain_contiguous(buffer);
        } else if segment.seq > buffer.next_seq {
            buffer.buffered_bytes += seg_len;
            self.total_buffered_bytes += seg_len;
            buffer.out_of_order.insert(segment.seq, Bytes::from(segment.data));
        } else {
            // Fully-retransmitted or overlapping-old data; ignore rather
            // than corrupt the already-delivered stream.
        }

        FeedOutcome::Buffered
    }

    fn drain_contiguous(buffer: &mut DirectionBuffer) {
        while let Some((&seq, _)) = buffer.out_of_order.iter().next() {
            if seq != buffer.next_seq {
                break;
            }
            let data = buffer.out_of_order.remove(&seq).expect("key just observed");
            buffer.buffered_bytes -= data.len();
            buffer.next_seq = buffer.next_seq.wrapping_add(data.len() as u32);
            buffer.ready.extend_from_slice(&data);
        }
    }

    /// Advance any connection stuck behind a gap for longer than
    /// `stream_timeout`, skipping to the earliest buffered segment past the
    /// gap. Returns the number of streams desynced this pass.
    pub fn advance_stale_gaps(&mut self) -> u64 {
        let mut advanced = 0;
        for buffer in self.buffers.values_mut() {
            if buffer.out_of_order.is_empty() {
                continue;
            }
            if buffer.last_progress.elapsed() < self.limits.stream_timeout {
                continue;
            }
            if let Some((&seq, _)) = buffer.out_of_order.iter().next() {
                buffer.next_seq = seq;
                buffer.desync_count += 1;
                buffer.last_progress = Instant::now();
                Self::drain_contiguous(buffer);
                advanced += 1;
            }
        }
        advanced
    }

    /// Take and clear whatever bytes are ready for delivery to the parser
    /// for a given connection/direction.
    pub fn take_ready(&mut self, connection_id: ConnectionID, direction: Direction) -> Bytes {
        match self.buffers.get_mut(&(connection_id, direction)) {
            Some(buffer) => std::mem::take(&mut buffer.ready).freeze(),
            None => Bytes::new(),
        }
    }

    pub fn drop_connection(&mut self, connection_id: ConnectionID) {
        for direction in [Direction::Outbound, Direction::Inbound] {
            if let Some(buffer) = self.buffers.remove(&(connection_id, direction)) {
                self.total_buffered_bytes -= buffer.buffered_bytes;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn conn() -> ConnectionID {
        ConnectionID::new(
            "127.0.0.1".parse().unwrap(),
            1234,
            "127.0.0.1".parse().unwrap(),
            443,
        )
    }

    fn seg(seq: u32, data: &[u8]) -> StreamSegment {
        StreamSegment {
            connection_id: conn(),
            direction: Direction::Outbound,
            seq,
            data: data.to_vec(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn in_order_segments_are_immediately_ready() {
        let mut reassembler = StreamReassembler::new(ReassemblerLimits::default());
        reassembler.feed(seg(0, b"hello "));
        reassembler.feed(seg(6, b"world"));
        let ready = reassembler.take_ready(conn(), Direction::Outbound);
        assert_eq!(ready.as_ref(), b"hello world".as_ref());
    }

    #[test]
    fn out_of_order_segment_buffers_until_gap_fills() {
        let mut reassembler = StreamReassembler::new(ReassemblerLimits::default());
        reassembler.feed(seg(6, b"world"));
        assert!(reassembler.take_ready(conn(), Direction::Outbound).is_empty());
        reassembler.feed(seg(0, b"hello "));
        let ready = reassembler.take_ready(conn(), Direction::Outbound);
        assert_eq!(ready.as_ref(), b"hello world".as_ref());
    }

    #[test]
    fn stale_gap_advances_past_missing_data() {
        let mut limits = ReassemblerLimits::default();
        limits.stream_timeout = Duration::from_millis(0);
        let mut reassembler = StreamReassembler::new(limits);
        reassembler.feed(seg(100, b"later"));
        std::thread::sleep(Duration::from_millis(2));
        let advanced = reassembler.advance_stale_gaps();
        assert_eq!(advanced, 1);
        let ready = reassembler.take_ready(conn(), Direction::Outbound);
        assert_eq!(ready.as_ref(), b"later".as_ref());
    }

    use proptest::prelude::*;

    proptest! {
        /// Whatever order a contiguous stream's segments arrive in, the
        /// bytes a consumer sees via `take_ready` are the same strictly
        /// monotonic, non-overlapping concatenation once every segment has
        /// been fed -- out-of-order buffering is invisible to the parser.
        #[test]
        fn reassembly_is_order_independent(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..8usize), 1..6usize),
            shuffle_seed in any::<u64>(),
        ) {
            let mut segments = Vec::new();
            let mut expected = Vec::new();
            let mut seq = 0u32;
            for chunk in &chunks {
                segments.push(seg(seq, chunk));
                expected.extend_from_slice(chunk);
                seq += chunk.len() as u32;
            }

            // Deterministic Fisher-Yates shuffle driven by the proptest-owned seed.
            let mut state = shuffle_seed | 1;
            for i in (1..segments.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state % (i as u64 + 1)) as usize;
                segments.swap(i, j);
            }

            let mut reassembler = StreamReassembler::new(ReassemblerLimits::default());
            for segment in segments {
                reassembler.feed(segment);
            }
            let ready = reassembler.take_ready(conn(), Direction::Outbound);
            prop_assert_eq!(ready.as_ref(), expected.as_slice());
        }

        /// Segments fed to a fresh `StreamState`-backed stream are consumed
        /// in strictly increasing `seq` order regardless of arrival order --
        /// the reassembler never rewinds `next_seq` once bytes are ready.
        #[test]
        fn next_seq_is_strictly_increasing_after_each_in_order_feed(
            chunk_lens in proptest::collection::vec(1usize..16, 1..8usize),
        ) {
            let mut reassembler = StreamReassembler::new(ReassemblerLimits::default());
            let mut seq = 0u32;
            let mut last_ready_len = 0usize;
            for len in chunk_lens {
                let data = vec![0xABu8; len];
                reassembler.feed(seg(seq, &data));
                seq += len as u32;
                let ready = reassembler.take_ready(conn(), Direction::Outbound);
                prop_assert_eq!(ready.len(), len);
                prop_assert!(ready.len() + last_ready_len >= last_ready_len);
                last_ready_len = ready.len();
            }
        }
    }
}
