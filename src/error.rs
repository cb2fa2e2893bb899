//! Typed error kinds shared across subsystems.
//!
//! Each subsystem gets its own `thiserror` enum so callers can match on
//! `kind()` instead of downcasting a dynamic error. `anyhow` is still used at
//! the CLI/binary boundary where a human just needs a message and a cause
//! chain (see `main.rs`, `cli.rs`).

use std::fmt;

/// Errors raised by packet capture and TCP reassembly.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open capture source {source_name}: {reason}")]
    OpenFailed { source_name: String, reason: String },

    #[error("capture source {source_name} closed unexpectedly")]
    SourceClosed { source_name: String },

    #[error("invalid BPF filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("offline capture file could not be read: {0}")]
    OfflineRead(String),
}

/// Errors raised while recognizing L7 protocol units from a byte stream.
/// Parse errors are almost always sampled and swallowed rather than
/// propagated; this type exists for the few call sites that do need to stop.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message exceeded max length ({actual} > {limit})")]
    TooLarge { actual: usize, limit: usize },

    #[error("malformed {protocol} message: {reason}")]
    Malformed { protocol: &'static str, reason: String },

    #[error("stream desynchronized, resyncing")]
    Desynced,
}

/// Errors raised by the backend collector's upload path.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("http error from collector backend: status={status} body={body}")]
    Http { status: u16, body: String },

    #[error("transport error talking to collector backend: {0}")]
    Transport(String),

    #[error("batch exceeded retry deadline and was dropped")]
    RetriesExhausted,

    #[error("compression failed: {0}")]
    Compression(String),
}

impl CollectorError {
    /// Whether this error should trigger a retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollectorError::Http { status, .. } => *status >= 500 || *status == 429,
            CollectorError::Transport(_) => true,
            CollectorError::RetriesExhausted => false,
            CollectorError::Compression(_) => false,
        }
    }
}

/// Errors raised by the daemon coordinator's control plane.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("http error from control plane: status={status} body={body}")]
    Http { status: u16, body: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("resource not found")]
    NotFound,

    #[error("registry entry not found for {0}")]
    UnknownService(String),

    #[error("transport error talking to control plane: {0}")]
    Transport(String),
}

impl DaemonError {
    pub fn kind(&self) -> DaemonErrorKind {
        match self {
            DaemonError::Http { status, .. } if *status == 401 || *status == 403 => {
                DaemonErrorKind::Unauthorized
            }
            DaemonError::Unauthorized(_) => DaemonErrorKind::Unauthorized,
            DaemonError::Http { status, .. } if *status == 404 => DaemonErrorKind::NotFound,
            DaemonError::NotFound => DaemonErrorKind::NotFound,
            DaemonError::UnknownService(_) => DaemonErrorKind::NotFound,
            _ => DaemonErrorKind::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonErrorKind {
    Unauthorized,
    NotFound,
    Transient,
}

/// Errors raised while converting a HAR file into witnesses.
#[derive(Debug, thiserror::Error)]
pub enum HarError {
    #[error("failed to read HAR file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse HAR JSON: {0}")]
    Parse(String),

    #[error("entry {index} has an unparseable startedDateTime {value:?}")]
    BadTimestamp { index: usize, value: String },
}

/// Configuration load/parse errors. Fatal before the main loop starts,
/// non-fatal (feature auto-disabled) once the agent is already running.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine a home/config directory on this platform")]
    NoHomeDir,

    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("failed to write config file {path}: {reason}")]
    Write { path: String, reason: String },
}

/// Process exit codes, per the external-interface contract: 0 success,
/// 1 generic failure, 2 configuration/usage failure.
#[derive(Debug, Clone)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self {
            code: 2,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExitError {}
