//! HAR 1.2 ingestion: converts a HAR log's entries directly into
//! `Witness`es. A conversion path rather than its own capture source --
//! unlike live/offline pcap capture, a HAR entry already carries a paired
//! request and response, so it bypasses `StreamReassembler`/`L7Parser`/
//! `FlowPairer` entirely and is handed straight to the `FilterChain`.
//!
//! Timing reconstruction follows the HAR `timings` object: walking
//! `blocked -> dns -> connect -> ssl -> send` from `startedDateTime` gives
//! the moment the request finished going out; `wait -> receive` from there
//! gives the moment the response finished coming back. `WitnessSide` has a
//! single `observed_at`, so only those two boundary timestamps (request
//! sent, response received) are kept, matching what the live-capture path
//! records at the moment `L7Parser` finishes recognizing each half.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::HarError;
use crate::witness::{Headers, Witness, WitnessSide};

#[derive(Debug, Deserialize)]
struct HarRoot {
    log: HarLog,
}

#[derive(Debug, Deserialize)]
struct HarLog {
    entries: Vec<HarEntry>,
}

#[derive(Debug, Deserialize)]
struct HarEntry {
    #[serde(rename = "startedDateTime")]
    started_date_time: String,
    request: HarRequest,
    response: HarResponse,
    #[serde(default)]
    timings: HarTimings,
    /// Akita's HAR extension; custom HAR fields are conventionally
    /// prefixed with an underscore.
    #[serde(rename = "_akita_ext", default)]
    akita_ext: Option<AkitaExt>,
}

#[derive(Debug, Deserialize, Default)]
struct AkitaExt {
    #[serde(default = "default_true")]
    outbound: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct HarRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(rename = "postData", default)]
    post_data: Option<HarPostData>,
}

#[derive(Debug, Deserialize)]
struct HarResponse {
    status: u16,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(default)]
    content: Option<HarContent>,
}

#[derive(Debug, Deserialize)]
struct HarHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct HarPostData {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HarContent {
    #[serde(default)]
    text: Option<String>,
}

/// Millisecond timing breakdown. HAR permits `-1` for "not applicable",
/// normalized to zero here since only the wall-clock offsets matter.
#[derive(Debug, Deserialize, Default)]
struct HarTimings {
    #[serde(default)]
    blocked: f64,
    #[serde(default)]
    dns: f64,
    #[serde(default)]
    connect: f64,
    #[serde(default)]
    ssl: f64,
    #[serde(default)]
    send: f64,
    #[serde(default)]
    wait: f64,
    #[serde(default)]
    receive: f64,
}

fn non_negative(v: f64) -> f64 {
    v.max(0.0)
}

/// Read a `.har` file and convert every entry into a `Witness`, in file
/// order. Entries with an unparseable `startedDateTime` are skipped and
/// logged rather than failing the whole file.
pub fn parse_har_file(path: &Path) -> Result<Vec<Witness>, HarError> {
    let raw = std::fs::read_to_string(path).map_err(|e| HarError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let root: HarRoot = serde_json::from_str(&raw).map_err(|e| HarError::Parse(e.to_string()))?;

    let mut witnesses = Vec::with_capacity(root.log.entries.len());
    for (index, entry) in root.log.entries.into_iter().enumerate() {
        match convert_entry(index, entry) {
            Ok(witness) => witnesses.push(witness),
            Err(e) => tracing::warn!(error = %e, index, "skipping unconvertible HAR entry"),
        }
    }
    Ok(witnesses)
}

/// Decode one newline-delimited HAR entry (not a full `{"log":{"entries":
/// [...]}}` document, just the bare entry object) as submitted to the
/// daemon's trace-events endpoint. `index` is only used for error messages.
pub fn convert_har_entry_line(index: usize, line: &str) -> Result<Witness, HarError> {
    let entry: HarEntry = serde_json::from_str(line).map_err(|e| HarError::Parse(e.to_string()))?;
    convert_entry(index, entry)
}

fn convert_entry(index: usize, entry: HarEntry) -> Result<Witness, HarError> {
    let started: DateTime<Utc> = DateTime::parse_from_rfc3339(&entry.started_date_time)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| HarError::BadTimestamp {
            index,
            value: entry.started_date_time.clone(),
        })?;

    let t = &entry.timings;
    let request_sent_offset_ms = non_negative(t.blocked)
        + non_negative(t.dns)
        + non_negative(t.connect)
        + non_negative(t.ssl)
        + non_negative(t.send);
    let response_received_offset_ms = request_sent_offset_ms + non_negative(t.wait) + non_negative(t.receive);

    let request_sent_at = started + chrono::Duration::milliseconds(request_sent_offset_ms as i64);
    let response_received_at = started + chrono::Duration::milliseconds(response_received_offset_ms as i64);

    let mut request_headers = Headers::default();
    for h in &entry.request.headers {
        request_headers.push(h.name.clone(), h.value.clone());
    }
    let request_body = entry
        .request
        .post_data
        .as_ref()
        .and_then(|p| p.text.clone())
        .map(String::into_bytes)
        .unwrap_or_default();
    let path = entry
        .request
        .url
        .split_once('?')
        .map(|(p, _)| p)
        .unwrap_or(entry.request.url.as_str());

    let request = WitnessSide {
        seq: 0,
        observed_at: request_sent_at,
        method_or_status: entry.request.method.clone(),
        path: Some(path.to_string()),
        headers: request_headers,
        body: request_body,
        truncated: false,
    };

    let mut response_headers = Headers::default();
    for h in &entry.response.headers {
        response_headers.push(h.name.clone(), h.value.clone());
    }
    let response_body = entry
        .response
        .content
        .as_ref()
        .and_then(|c| c.text.clone())
        .map(String::into_bytes)
        .unwrap_or_default();

    let response = WitnessSide {
        seq: 0,
        observed_at: response_received_at,
        method_or_status: entry.response.status.to_string(),
        path: None,
        headers: response_headers,
        body: response_body,
        truncated: false,
    };

    let outbound = entry.akita_ext.map(|ext| ext.outbound).unwrap_or(true);
    let connection_id_display = format!("har:{}:{}", if outbound { "out" } else { "in" }, index);

    Ok(Witness {
        id: Witness::new_id(),
        connection_id_display,
        trace_id: None,
        observed_at: started,
        request: Some(request),
        response: Some(response),
        one_sided: false,
        tcp_metadata: None,
        tls_handshake: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_har() -> String {
        r#"{
          "log": {
            "entries": [
              {
                "startedDateTime": "2026-01-01T00:00:00.000Z",
                "request": {
                  "method": "GET",
                  "url": "https://api.example.com/v1/items?page=2",
                  "headers": [{"name": "Host", "value": "api.example.com"}]
                },
                "response": {
                  "status": 200,
                  "headers": [{"name": "Content-Type", "value": "application/json"}],
                  "content": {"text": "{\"ok\":true}"}
                },
                "timings": {
                  "blocked": 1, "dns": 1, "connect": 5, "ssl": 10,
                  "send": 0, "wait": 50, "receive": 5
                },
                "_akita_ext": {"outbound": true}
              }
            ]
          }
        }"#
        .to_string()
    }

    #[test]
    fn converts_entry_into_paired_witness_with_reconstructed_timestamps() {
        let tmp = std::env::temp_dir().join(format!("akita-har-test-{}.har", std::process::id()));
        std::fs::File::create(&tmp).unwrap().write_all(sample_har().as_bytes()).unwrap();

        let witnesses = parse_har_file(&tmp).expect("valid HAR parses");
        std::fs::remove_file(&tmp).ok();

        assert_eq!(witnesses.len(), 1);
        let w = &witnesses[0];
        assert!(!w.one_sided);
        let req = w.request.as_ref().unwrap();
        let resp = w.response.as_ref().unwrap();
        assert_eq!(req.method_or_status, "GET");
        assert_eq!(req.path.as_deref(), Some("https://api.example.com/v1/items"));
        assert_eq!(resp.method_or_status, "200");
        assert!(resp.observed_at > req.observed_at);
        assert_eq!(w.latency_ms(), Some((resp.observed_at - req.observed_at).num_milliseconds()));
    }

    #[test]
    fn convert_har_entry_line_decodes_one_bare_entry() {
        let line = r#"{
            "startedDateTime": "2026-01-01T00:00:00.000Z",
            "request": {"method": "POST", "url": "https://api.example.com/v1/items", "headers": []},
            "response": {"status": 201, "headers": []},
            "timings": {"blocked": 0, "dns": 0, "connect": 0, "ssl": 0, "send": 0, "wait": 2, "receive": 0}
        }"#;
        let witness = convert_har_entry_line(0, line).expect("valid entry line parses");
        assert_eq!(witness.request.unwrap().method_or_status, "POST");
        assert_eq!(witness.response.unwrap().method_or_status, "201");
    }

    #[test]
    fn convert_har_entry_line_rejects_malformed_json() {
        assert!(convert_har_entry_line(0, "not json").is_err());
    }

    #[test]
    fn missing_akita_ext_defaults_to_outbound() {
        let body = r#"{
          "log": {
            "entries": [
              {
                "startedDateTime": "2026-01-01T00:00:00.000Z",
                "request": {"method": "GET", "url": "https://api.example.com/x", "headers": []},
                "response": {"status": 200, "headers": []},
                "timings": {"blocked": 0, "dns": 0, "connect": 0, "ssl": 0, "send": 0, "wait": 1, "receive": 0}
              }
            ]
          }
        }"#;
        let tmp = std::env::temp_dir().join(format!("akita-har-test-noext-{}.har", std::process::id()));
        std::fs::File::create(&tmp).unwrap().write_all(body.as_bytes()).unwrap();

        let witnesses = parse_har_file(&tmp).expect("valid HAR parses");
        std::fs::remove_file(&tmp).ok();

        assert!(witnesses[0].connection_id_display.starts_with("har:out:"));
    }
}
