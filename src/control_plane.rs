//! Outbound HTTP client for the remote control plane: trace creation,
//! the two long-poll RPCs the daemon coordinator drives its registry
//! from, batch witness upload, heartbeat, and spec fetch.
//!
//! Kept separate from `collector`, which uploads witness batches to the
//! simpler ingestion endpoint — this client speaks the richer
//! service/trace lifecycle protocol the daemon needs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::witness::Witness;

pub struct ControlPlaneClient {
    base_url: String,
    client: reqwest::Client,
    api_key_id: Option<String>,
    api_key_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateTraceRequest<'a> {
    service_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct CreateTraceResponse {
    pub trace_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ActiveTracesResponse {
    pub active_trace_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TraceActiveResponse {
    pub active: bool,
}

#[derive(Debug, Serialize)]
struct WitnessBatchRequest<'a> {
    witnesses: &'a [Witness],
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    client_id: &'a str,
}

impl ControlPlaneClient {
    /// `long_poll_timeout_secs` should exceed the server's long-poll hold
    /// time (configured separately on the control plane) so a held-open
    /// long-poll response isn't mistaken for a stalled connection.
    pub fn new(
        base_url: impl Into<String>,
        api_key_id: Option<String>,
        api_key_secret: Option<String>,
        long_poll_timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(long_poll_timeout_secs + 10))
            .build()
            .expect("failed to build control-plane http client");
        Self {
            base_url: base_url.into(),
            client,
            api_key_id,
            api_key_secret,
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.api_key_id, &self.api_key_secret) {
            (Some(id), Some(secret)) => builder.basic_auth(id, Some(secret)),
            _ => builder,
        }
    }

    pub async fn create_trace(&self, service_id: &str) -> Result<CreateTraceResponse, DaemonError> {
        let url = format!("{}/services/{}/traces", self.base_url, service_id);
        let resp = self
            .authed(self.client.post(&url).json(&CreateTraceRequest { service_id }))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        handle_response(resp).await
    }

    /// Long-poll for the active-trace set of a service to differ from
    /// `known_trace_ids`. Blocks for up to the server's hold time.
    pub async fn long_poll_active_traces(
        &self,
        service_id: &str,
        known_trace_ids: &[String],
    ) -> Result<ActiveTracesResponse, DaemonError> {
        let url = format!("{}/services/{}/active-traces", self.base_url, service_id);
        let resp = self
            .authed(self.client.get(&url).query(&[("known", known_trace_ids.join(","))]))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        handle_response(resp).await
    }

    /// Long-poll for a single trace's active flag to flip.
    pub async fn long_poll_trace_active(&self, trace_id: &str) -> Result<TraceActiveResponse, DaemonError> {
        let url = format!("{}/traces/{}/active", self.base_url, trace_id);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        handle_response(resp).await
    }

    pub async fn upload_witnesses(
        &self,
        service_id: &str,
        trace_id: &str,
        witnesses: &[Witness],
    ) -> Result<(), DaemonError> {
        let url = format!("{}/services/{}/traces/{}/witnesses", self.base_url, service_id, trace_id);
        let resp = self
            .authed(self.client.post(&url).json(&WitnessBatchRequest { witnesses }))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(classify_error(status.as_u16(), resp.text().await.unwrap_or_default()))
    }

    pub async fn heartbeat(&self, client_id: &str) -> Result<(), DaemonError> {
        let url = format!("{}/daemon/heartbeat", self.base_url);
        let resp = self
            .authed(self.client.post(&url).json(&HeartbeatRequest { client_id }))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(classify_error(status.as_u16(), resp.text().await.unwrap_or_default()))
    }

    /// Fetch the server's inferred API spec for one service/trace pair.
    pub async fn fetch_spec(&self, service_id: &str, trace_id: &str) -> Result<serde_json::Value, DaemonError> {
        let url = format!("{}/services/{}/spec/{}", self.base_url, service_id, trace_id);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        handle_response(resp).await
    }
}

async fn handle_response<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, DaemonError> {
    let status = resp.status();
    if status.is_success() {
        resp.json::<T>().await.map_err(|e| DaemonError::Transport(e.to_string()))
    } else {
        Err(classify_error(status.as_u16(), resp.text().await.unwrap_or_default()))
    }
}

fn classify_error(status: u16, body: String) -> DaemonError {
    match status {
        401 => DaemonError::Unauthorized(body),
        403 => DaemonError::Unauthorized(body),
        404 => DaemonError::NotFound,
        _ => DaemonError::Http { status, body },
    }
}
