//! Capture-subsystem configuration: interface selection, BPF filter, and
//! the reassembly/parsing limits that bound memory use per connection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interface to capture on. `None` means "let the agent pick the
    /// first non-loopback interface it can open".
    pub interface: Option<String>,
    pub offline_file: Option<String>,
    pub bpf_filter: String,
    pub parse_tls_handshakes: bool,
    pub max_http_length: usize,
    pub max_buffered_bytes_per_connection: usize,
    pub max_buffered_bytes_total: usize,
    pub stream_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            offline_file: None,
            bpf_filter: "tcp".to_string(),
            parse_tls_handshakes: true,
            max_http_length: 1024 * 1024,
            max_buffered_bytes_per_connection: 4 * 1024 * 1024,
            max_buffered_bytes_total: 256 * 1024 * 1024,
            stream_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub interface: Option<String>,
    pub offline_file: Option<String>,
    pub bpf_filter: Option<String>,
    pub parse_tls_handshakes: Option<bool>,
    pub max_http_length: Option<usize>,
    pub max_buffered_bytes_per_connection: Option<usize>,
    pub max_buffered_bytes_total: Option<usize>,
    pub stream_timeout_secs: Option<u64>,
}
