//! DaemonCoordinator configuration: the localhost control-plane listen
//! address and the long-poll/heartbeat timing it uses against the remote
//! control plane.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub bind_addr: SocketAddr,
    pub control_plane_url: String,
    pub heartbeat_interval_secs: u64,
    pub long_poll_timeout_secs: u64,
    /// How long a failed LongPollService/LongPollTrace RPC sleeps before
    /// re-enqueuing itself (LONG_POLL_INTERVAL).
    pub long_poll_retry_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9870".parse().expect("valid default addr"),
            control_plane_url: "https://app.akita.example.com".to_string(),
            heartbeat_interval_secs: 30,
            long_poll_timeout_secs: 60,
            long_poll_retry_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonFileConfig {
    pub bind_addr: Option<String>,
    pub control_plane_url: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub long_poll_timeout_secs: Option<u64>,
    pub long_poll_retry_interval_secs: Option<u64>,
}
