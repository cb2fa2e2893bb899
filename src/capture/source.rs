//! PacketSource: live or offline packet capture via libpcap.
//!
//! libpcap reads are blocking, so each source runs its read loop on a
//! dedicated blocking thread (`tokio::task::spawn_blocking`) and forwards
//! captured frames to the async side over a bounded channel, the same
//! shape used elsewhere in this codebase for bridging a blocking worker
//! into the async world.

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::CaptureError;
use crate::witness::ConnectionID;

/// One captured frame's TCP payload plus enough header context to attribute
/// it to a connection. `connection_id` is the frame's as-observed (src,
/// dst) tuple, not yet canonicalized. Canonicalization and direction are
/// derived downstream by `TcpTracker::observe`, which is the component
/// that holds the per-flow "which side sent the SYN first" state needed
/// to tell the two directions of one connection apart.
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub connection_id: ConnectionID,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum CaptureSourceKind {
    /// Live capture on a named interface with a BPF filter string.
    Live { interface: String, bpf_filter: String },
    /// Offline capture from a `.pcap`/`.pcapng` file.
    OfflineFile { path: String },
}

/// A single capture producer. Implementations own exactly one libpcap
/// handle and push `RawSegment`s onto `tx` until the source closes or the
/// task is cancelled.
pub struct PacketSource {
    kind: CaptureSourceKind,
}

impl PacketSource {
    pub fn new(kind: CaptureSourceKind) -> Self {
        Self { kind }
    }

    pub fn name(&self) -> String {
        match &self.kind {
            CaptureSourceKind::Live { interface, .. } => interface.clone(),
            CaptureSourceKind::OfflineFile { path } => path.clone(),
        }
    }

    /// Run the capture loop, pushing segments to `tx` until the source
    /// closes, the receiver is dropped, or a fatal pcap error occurs.
    pub async fn run(self, tx: mpsc::Sender<RawSegment>) -> Result<(), CaptureError> {
        let name = self.name();
        let kind = self.kind;
        tokio::task::spawn_blocking(move || Self::blocking_loop(kind, tx))
            .await
            .map_err(|_| CaptureError::SourceClosed {
                source_name: name,
            })?
    }

    fn blocking_loop(kind: CaptureSourceKind, tx: mpsc::Sender<RawSegment>) -> Result<(), CaptureError> {
        let source_name = match &kind {
            CaptureSourceKind::Live { interface, .. } => interface.clone(),
            CaptureSourceKind::OfflineFile { path } => path.clone(),
        };

        let mut capture = match &kind {
            CaptureSourceKind::Live { interface, bpf_filter } => {
                let mut cap = pcap::Capture::from_device(interface.as_str())
                    .map_err(|e| CaptureError::OpenFailed {
                        source_name: source_name.clone(),
                        reason: e.to_string(),
                    })?
                    .promisc(true)
                    .snaplen(65535)
                    .timeout(1000)
                    .open()
                    .map_err(|e| CaptureError::OpenFailed {
                        source_name: source_name.clone(),
                        reason: e.to_string(),
                    })?;
                cap.filter(bpf_filter, true).map_err(|e| CaptureError::InvalidFilter {
                    filter: bpf_filter.clone(),
                    reason: e.to_string(),
                })?;
                cap
            }
            CaptureSourceKind::OfflineFile { path } => {
                pcap::Capture::from_file(path).map_err(|e| CaptureError::OfflineRead(e.to_string()))?
            }
        };

        let mut retry_backoff = Duration::from_millis(50);
        loop {
            match capture.next_packet() {
                Ok(packet) => {
                    retry_backoff = Duration::from_millis(50);
                    if let Some(segment) = parse_tcp_frame(packet.data) {
                        if tx.blocking_send(segment).is_err() {
                            // Receiver gone: normal shutdown path.
                            return Ok(());
                        }
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return Ok(()),
                Err(_) => {
                    std::thread::sleep(retry_backoff);
                    retry_backoff = (retry_backoff * 2).min(Duration::from_secs(2));
                }
            }
        }
    }
}

/// Minimal Ethernet/IPv4-or-IPv6/TCP parser: pulls out the five-tuple, the
/// relevant flags, the relative sequence number, and the payload slice.
/// Deliberately does not attempt IP fragmentation reassembly or IPv6
/// extension headers beyond the fixed header — those frames are skipped.
fn parse_tcp_frame(frame: &[u8]) -> Option<RawSegment> {
    const ETH_HEADER_LEN: usize = 14;
    if frame.len() < ETH_HEADER_LEN + 20 {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

    let (src_ip, dst_ip, ip_header_len, protocol, ip_payload_start): (IpAddr, IpAddr, usize, u8, usize) =
        match ethertype {
            0x0800 => {
                let ip = &frame[ETH_HEADER_LEN..];
                if ip.len() < 20 {
                    return None;
                }
                let ihl = (ip[0] & 0x0f) as usize * 4;
                let protocol = ip[9];
                let src = IpAddr::from([ip[12], ip[13], ip[14], ip[15]]);
                let dst = IpAddr::from([ip[16], ip[17], ip[18], ip[19]]);
                (src, dst, ihl, protocol, ETH_HEADER_LEN + ihl)
            }
            0x86DD => {
                let ip = &frame[ETH_HEADER_LEN..];
                if ip.len() < 40 {
                    return None;
                }
                let protocol = ip[6];
                let mut src_bytes = [0u8; 16];
                let mut dst_bytes = [0u8; 16];
                src_bytes.copy_from_slice(&ip[8..24]);
                dst_bytes.copy_from_slice(&ip[24..40]);
                (
                    IpAddr::from(src_bytes),
                    IpAddr::from(dst_bytes),
                    40,
                    protocol,
                    ETH_HEADER_LEN + 40,
                )
            }
            _ => return None,
        };

    if protocol != 6 {
        return None; // not TCP
    }
    let _ = ip_header_len;

    let tcp = frame.get(ip_payload_start..)?;
    if tcp.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    let data_offset = ((tcp[12] >> 4) as usize) * 4;
    let flags = tcp[13];

    let payload_start = ip_payload_start + data_offset;
    let payload = frame.get(payload_start..).unwrap_or(&[]).to_vec();

    Some(RawSegment {
        connection_id: ConnectionID::new(src_ip, src_port, dst_ip, dst_port),
        seq,
        syn: flags & 0x02 != 0,
        fin: flags & 0x01 != 0,
        rst: flags & 0x04 != 0,
        ack: flags & 0x10 != 0,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frame_is_rejected() {
        assert!(parse_tcp_frame(&[0u8; 10]).is_none());
    }
}
