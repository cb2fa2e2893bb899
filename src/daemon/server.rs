//! The daemon's localhost HTTP surface: in-process clients register
//! themselves and submit trace events over plain HTTP rather than sharing
//! the coordinator's channel directly, mirroring the way the teacher
//! exposes its proxy state over axum rather than letting callers reach
//! into `ProxyState` by hand.

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::har;
use crate::witness::Witness;

use super::{ActiveTraceDiff, DaemonHandle, TraceEventsResult};

#[derive(Debug, Deserialize)]
pub struct MiddlewareRegistration {
    pub client_name: String,
    #[serde(default)]
    pub active_trace_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TraceEventsQuery {
    pub client_name: String,
}

/// Registers (or re-registers) `client_name` against `service_name`, long-
/// polling until the daemon's active-trace set differs from what the
/// client already knows about.
async fn register_middleware(
    State(handle): State<DaemonHandle>,
    Path(service_name): Path<String>,
    Json(body): Json<MiddlewareRegistration>,
) -> Json<ActiveTraceDiff> {
    let diff = handle
        .register_client(body.client_name, service_name, body.active_trace_ids)
        .await;
    Json(diff)
}

/// Splits a trace-events request body into decoded witnesses, a count of
/// lines that failed to decode, and whether the stream's `{}` end-of-stream
/// marker was seen. Pulled out of the handler so the NDJSON framing logic
/// can be exercised without standing up an axum server.
fn parse_trace_event_lines(body: &str) -> (Vec<Witness>, usize, bool) {
    let mut witnesses = Vec::new();
    let mut malformed = 0usize;
    let mut no_more_events = false;

    for (index, line) in body.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "{}" {
            no_more_events = true;
            break;
        }
        match har::convert_har_entry_line(index, trimmed) {
            Ok(witness) => witnesses.push(witness),
            Err(e) => {
                malformed += 1;
                debug!(error = %e, index, "unparseable trace-event line");
            }
        }
    }

    (witnesses, malformed, no_more_events)
}

/// Accepts newline-delimited HAR entries for `trace_name`, one JSON object
/// per line, terminated by an empty `{}` object marking end of stream.
async fn submit_trace_events(
    State(handle): State<DaemonHandle>,
    Path((service_name, trace_name)): Path<(String, String)>,
    Query(query): Query<TraceEventsQuery>,
    body: String,
) -> Result<Json<TraceEventsResult>, StatusCode> {
    let (witnesses, malformed, no_more_events) = parse_trace_event_lines(&body);

    match handle
        .trace_events(query.client_name, service_name, trace_name, witnesses, malformed, no_more_events)
        .await
    {
        Some(result) => Ok(Json(result)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Run the daemon's localhost control surface until `shutdown_rx` fires.
pub async fn run(
    bind_addr: SocketAddr,
    handle: DaemonHandle,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/v1/services/:service_name/middleware", post(register_middleware))
        .route(
            "/v1/services/:service_name/traces/:trace_name/events",
            post(submit_trace_events),
        )
        .with_state(handle);

    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "daemon control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await?;

    info!("daemon control surface shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_ignored_between_entries() {
        let body = "\n   \n";
        let (witnesses, malformed, no_more_events) = parse_trace_event_lines(body);
        assert!(witnesses.is_empty());
        assert_eq!(malformed, 0);
        assert!(!no_more_events);
    }

    #[test]
    fn malformed_line_is_counted_and_skipped() {
        let body = "not json\n{}";
        let (witnesses, malformed, no_more_events) = parse_trace_event_lines(body);
        assert!(witnesses.is_empty());
        assert_eq!(malformed, 1);
        assert!(no_more_events);
    }

    #[test]
    fn empty_object_marks_end_of_stream_and_stops_parsing() {
        let entry = r#"{"startedDateTime": "2026-01-01T00:00:00.000Z", "request": {"method": "GET", "url": "https://api.example.com/x", "headers": []}, "response": {"status": 200, "headers": []}, "timings": {"blocked": 0, "dns": 0, "connect": 0, "ssl": 0, "send": 0, "wait": 1, "receive": 0}}"#;
        let body = format!("{entry}\n{{}}\n{entry}");
        let (witnesses, malformed, no_more_events) = parse_trace_event_lines(&body);
        assert_eq!(witnesses.len(), 1);
        assert_eq!(malformed, 0);
        assert!(no_more_events);
    }

    #[test]
    fn well_formed_entries_decode_in_order() {
        let entry = |method: &str| {
            format!(
                r#"{{"startedDateTime": "2026-01-01T00:00:00.000Z", "request": {{"method": "{method}", "url": "https://api.example.com/x", "headers": []}}, "response": {{"status": 200, "headers": []}}, "timings": {{"blocked": 0, "dns": 0, "connect": 0, "ssl": 0, "send": 0, "wait": 1, "receive": 0}}}}"#
            )
        };
        let body = format!("{}\n{}", entry("GET"), entry("POST"));
        let (witnesses, malformed, no_more_events) = parse_trace_event_lines(&body);
        assert_eq!(witnesses.len(), 2);
        assert_eq!(malformed, 0);
        assert!(!no_more_events);
        assert_eq!(witnesses[0].request.as_ref().unwrap().method_or_status, "GET");
        assert_eq!(witnesses[1].request.as_ref().unwrap().method_or_status, "POST");
    }
}
