//! DaemonCoordinator: the single-threaded actor multiplexing local clients
//! onto server-managed traces.
//!
//! Exactly one task, the event loop spawned by `DaemonCoordinator::spawn`,
//! ever mutates the service/trace/client registry. Everything else
//! (the axum surface in `server`, heartbeat/long-poll helper tasks) talks
//! to it by sending a `DaemonEvent` and awaiting a reply over a oneshot
//! channel, the same "helper tasks re-enqueue, the loop never awaits
//! another task's state directly" discipline the ambient stack uses for
//! its other single-writer components.
//!
//! Two long-poll flows share the registry but stay on separate event
//! variants: `RegisterClient` serves in-process clients polling the
//! daemon's localhost surface for their trace diff, while
//! `LongPollService`/`LongPollTrace` are the daemon's own outbound polls
//! against the remote control plane, driven by the tasks spawned in
//! `spawn_long_poll_service_round`/`spawn_long_poll_trace_round`.

pub mod server;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::control_plane::ControlPlaneClient;
use crate::witness::{ClientRegistration, Service, Trace, Witness};

/// The delta a registered client (or a waiter parked against one) is told
/// to apply: start collecting `activated` traces, stop `deactivated` ones.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ActiveTraceDiff {
    pub activated: Vec<String>,
    pub deactivated: Vec<String>,
}

/// Per-request accounting returned from a `TraceEvents` submission.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TraceEventsResult {
    pub parsed: usize,
    pub drops: usize,
}

/// Tagged events accepted by the coordinator's event loop.
pub enum DaemonEvent {
    /// Sent every `heartbeat_interval`; drives one outbound heartbeat RPC
    /// and reschedules itself, win or lose.
    Heartbeat,
    RegisterClient {
        client_id: String,
        service_name: String,
        known_active_traces: Vec<String>,
        reply: oneshot::Sender<ActiveTraceDiff>,
    },
    /// A read-only peek at a service's current active-trace set, used by
    /// tests and local introspection; never parks, never mutates state.
    QueryActiveTraces {
        service_id: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Kicks off one round of the outbound long-poll against the control
    /// plane for `service_id`'s active-trace set.
    LongPollService {
        service_id: String,
    },
    StartTraces {
        service_id: String,
        trace_ids: Vec<String>,
    },
    /// Kicks off one round of the outbound long-poll against the control
    /// plane for `trace_id`'s active flag.
    LongPollTrace {
        service_id: String,
        trace_id: String,
    },
    EndTrace {
        trace_id: String,
    },
    ChangeActiveTraces {
        service_id: String,
        activate: Vec<String>,
        deactivate: Vec<String>,
    },
    TraceEvents {
        client_id: String,
        service_id: String,
        trace_id: String,
        witnesses: Vec<Witness>,
        /// Lines the HTTP layer couldn't decode as a HAR entry at all;
        /// folded into the `drops` count alongside sink-full drops.
        malformed: usize,
        no_more_events: bool,
        reply: oneshot::Sender<Option<TraceEventsResult>>,
    },
    UnregisterClientFromTrace {
        client_id: String,
        trace_id: String,
    },
}

struct Registry {
    services: HashMap<String, Service>,
    clients: HashMap<String, ClientRegistration>,
    clients_per_trace: HashMap<String, HashSet<String>>,
    service_waiters: HashMap<String, Vec<oneshot::Sender<Vec<String>>>>,
    register_waiters: HashMap<String, Vec<(String, Vec<String>, oneshot::Sender<ActiveTraceDiff>)>>,
    trace_waiters: HashMap<String, Vec<(bool, oneshot::Sender<bool>)>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            services: HashMap::new(),
            clients: HashMap::new(),
            clients_per_trace: HashMap::new(),
            service_waiters: HashMap::new(),
            register_waiters: HashMap::new(),
            trace_waiters: HashMap::new(),
        }
    }

    fn active_trace_ids(&self, service_id: &str) -> Vec<String> {
        self.services
            .get(service_id)
            .map(|s| {
                let mut ids: Vec<String> = s
                    .traces
                    .values()
                    .filter(|t| t.active)
                    .map(|t| t.trace_id.clone())
                    .collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    fn diff_against(&self, service_id: &str, known: &[String]) -> ActiveTraceDiff {
        let current: HashSet<String> = self.active_trace_ids(service_id).into_iter().collect();
        let known_set: HashSet<String> = known.iter().cloned().collect();
        let mut activated: Vec<String> = current.difference(&known_set).cloned().collect();
        let mut deactivated: Vec<String> = known_set.difference(&current).cloned().collect();
        activated.sort();
        deactivated.sort();
        ActiveTraceDiff { activated, deactivated }
    }

    fn notify_service_waiters(&mut self, service_id: &str) {
        let current = self.active_trace_ids(service_id);
        if let Some(waiters) = self.service_waiters.remove(service_id) {
            for waiter in waiters {
                let _ = waiter.send(current.clone());
            }
        }
    }

    /// Re-evaluate every registration parked against `service_id`, resolving
    /// the ones whose diff is no longer empty.
    fn notify_register_waiters(&mut self, service_id: &str) {
        let Some(waiters) = self.register_waiters.remove(service_id) else {
            return;
        };
        for (client_id, known, reply) in waiters {
            let diff = self.diff_against(service_id, &known);
            if diff.activated.is_empty() && diff.deactivated.is_empty() {
                self.register_waiters
                    .entry(service_id.to_string())
                    .or_default()
                    .push((client_id, known, reply));
                continue;
            }
            self.apply_diff_to_client(&client_id, &diff);
            let _ = reply.send(diff);
        }
    }

    fn apply_diff_to_client(&mut self, client_id: &str, diff: &ActiveTraceDiff) {
        if let Some(client) = self.clients.get_mut(client_id) {
            let mut ids: HashSet<String> = client.active_trace_ids.drain(..).collect();
            for id in &diff.activated {
                ids.insert(id.clone());
            }
            for id in &diff.deactivated {
                ids.remove(id);
            }
            client.active_trace_ids = ids.into_iter().collect();
            client.active_trace_ids.sort();
        }
    }

    fn notify_trace_waiters(&mut self, trace_id: &str, active: bool) {
        if let Some(waiters) = self.trace_waiters.remove(trace_id) {
            for (want_active, waiter) in waiters {
                if want_active == active {
                    let _ = waiter.send(active);
                } else {
                    self.trace_waiters
                        .entry(trace_id.to_string())
                        .or_default()
                        .push((want_active, waiter));
                }
            }
        }
    }
}

/// Cheap, cloneable handle used by callers (the axum surface, the CLI) to
/// talk to the coordinator's event loop.
#[derive(Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonEvent>,
}

impl DaemonHandle {
    pub async fn register_client(
        &self,
        client_id: impl Into<String>,
        service_name: impl Into<String>,
        known_active_traces: Vec<String>,
    ) -> ActiveTraceDiff {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(DaemonEvent::RegisterClient {
                client_id: client_id.into(),
                service_name: service_name.into(),
                known_active_traces,
                reply,
            })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn query_active_traces(&self, service_id: impl Into<String>) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(DaemonEvent::QueryActiveTraces { service_id: service_id.into(), reply })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn start_traces(&self, service_id: impl Into<String>, trace_ids: Vec<String>) {
        let _ = self
            .tx
            .send(DaemonEvent::StartTraces { service_id: service_id.into(), trace_ids })
            .await;
    }

    pub async fn end_trace(&self, trace_id: impl Into<String>) {
        let _ = self.tx.send(DaemonEvent::EndTrace { trace_id: trace_id.into() }).await;
    }

    pub async fn change_active_traces(
        &self,
        service_id: impl Into<String>,
        activate: Vec<String>,
        deactivate: Vec<String>,
    ) {
        let _ = self
            .tx
            .send(DaemonEvent::ChangeActiveTraces {
                service_id: service_id.into(),
                activate,
                deactivate,
            })
            .await;
    }

    /// Submit one batch of already-decoded witnesses for `trace_id` on
    /// behalf of `client_id`. `malformed` counts lines the HTTP layer
    /// couldn't even decode as a HAR entry. Returns `None` if the
    /// service/trace pair is unknown.
    pub async fn trace_events(
        &self,
        client_id: impl Into<String>,
        service_id: impl Into<String>,
        trace_id: impl Into<String>,
        witnesses: Vec<Witness>,
        malformed: usize,
        no_more_events: bool,
    ) -> Option<TraceEventsResult> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(DaemonEvent::TraceEvents {
                client_id: client_id.into(),
                service_id: service_id.into(),
                trace_id: trace_id.into(),
                witnesses,
                malformed,
                no_more_events,
                reply,
            })
            .await;
        rx.await.unwrap_or(None)
    }

    pub async fn unregister_client_from_trace(&self, client_id: impl Into<String>, trace_id: impl Into<String>) {
        let _ = self
            .tx
            .send(DaemonEvent::UnregisterClientFromTrace {
                client_id: client_id.into(),
                trace_id: trace_id.into(),
            })
            .await;
    }
}

/// Everything a spawned helper task (long-poll round, heartbeat round)
/// needs to do its RPC and re-enqueue a follow-up event, without touching
/// the registry directly.
struct DaemonContext {
    tx: mpsc::Sender<DaemonEvent>,
    control_plane: Arc<ControlPlaneClient>,
    heartbeat_interval: Duration,
    long_poll_retry_interval: Duration,
}

pub struct DaemonCoordinator;

impl DaemonCoordinator {
    /// Spawn the event loop and return a handle to it plus a sink the loop
    /// forwards `TraceEvents` witnesses onto (consumed by the engine to
    /// feed the active `BackendCollector` for that trace).
    pub fn spawn(
        witness_sink: mpsc::Sender<(String, Witness)>,
        control_plane: Arc<ControlPlaneClient>,
        heartbeat_interval: Duration,
        long_poll_retry_interval: Duration,
    ) -> (DaemonHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let handle = DaemonHandle { tx: tx.clone() };
        let ctx = DaemonContext {
            tx: tx.clone(),
            control_plane,
            heartbeat_interval,
            long_poll_retry_interval,
        };
        let _ = tx.try_send(DaemonEvent::Heartbeat);

        let join = tokio::spawn(async move {
            let mut registry = Registry::new();
            while let Some(event) = rx.recv().await {
                handle_event(&mut registry, event, &witness_sink, &ctx).await;
            }
        });

        (handle, join)
    }
}

async fn handle_event(
    registry: &mut Registry,
    event: DaemonEvent,
    witness_sink: &mpsc::Sender<(String, Witness)>,
    ctx: &DaemonContext,
) {
    match event {
        DaemonEvent::Heartbeat => {
            spawn_heartbeat_round(ctx);
        }
        DaemonEvent::RegisterClient { client_id, service_name, known_active_traces, reply } => {
            let is_new_service = !registry.services.contains_key(&service_name);
            registry.services.entry(service_name.clone()).or_insert_with(|| Service {
                service_id: service_name.clone(),
                traces: HashMap::new(),
            });

            let diff = registry.diff_against(&service_name, &known_active_traces);
            registry
                .clients
                .entry(client_id.clone())
                .or_insert_with(|| ClientRegistration {
                    client_id: client_id.clone(),
                    service_name: service_name.clone(),
                    registered_at: chrono::Utc::now(),
                    active_trace_ids: Vec::new(),
                })
                .active_trace_ids = known_active_traces.clone();

            if diff.activated.is_empty() && diff.deactivated.is_empty() {
                registry
                    .register_waiters
                    .entry(service_name.clone())
                    .or_default()
                    .push((client_id, known_active_traces, reply));
            } else {
                registry.apply_diff_to_client(&client_id, &diff);
                let _ = reply.send(diff);
            }

            if is_new_service {
                spawn_long_poll_service_round(ctx, service_name, Vec::new());
            }
        }
        DaemonEvent::QueryActiveTraces { service_id, reply } => {
            let _ = reply.send(registry.active_trace_ids(&service_id));
        }
        DaemonEvent::LongPollService { service_id } => {
            let known = registry.active_trace_ids(&service_id);
            spawn_long_poll_service_round(ctx, service_id, known);
        }
        DaemonEvent::StartTraces { service_id, trace_ids } => {
            let service = registry.services.entry(service_id.clone()).or_insert_with(|| Service {
                service_id: service_id.clone(),
                traces: HashMap::new(),
            });
            for trace_id in &trace_ids {
                service.traces.insert(
                    trace_id.clone(),
                    Trace { trace_id: trace_id.clone(), service_id: service_id.clone(), active: true },
                );
            }
            registry.notify_service_waiters(&service_id);
            registry.notify_register_waiters(&service_id);
            for trace_id in &trace_ids {
                spawn_long_poll_trace_round(ctx, service_id.clone(), trace_id.clone());
            }
            let _ = ctx.tx.try_send(DaemonEvent::LongPollService { service_id });
        }
        DaemonEvent::LongPollTrace { service_id, trace_id } => {
            spawn_long_poll_trace_round(ctx, service_id, trace_id);
        }
        DaemonEvent::EndTrace { trace_id } => {
            for service in registry.services.values_mut() {
                if let Some(trace) = service.traces.get_mut(&trace_id) {
                    trace.active = false;
                }
            }
            registry.notify_trace_waiters(&trace_id, false);
            if let Some(service_id) = find_service_for_trace(registry, &trace_id) {
                registry.notify_service_waiters(&service_id);
                registry.notify_register_waiters(&service_id);
            }
            maybe_retire_trace(registry, &trace_id);
        }
        DaemonEvent::ChangeActiveTraces { service_id, activate, deactivate } => {
            let deactivate_set: HashSet<&String> = deactivate.iter().collect();

            if let Some(service) = registry.services.get_mut(&service_id) {
                for trace_id in &activate {
                    let ends_inactive = deactivate_set.contains(trace_id);
                    if ends_inactive {
                        debug!(trace_id, "trace listed in both activate and deactivate; ending inactive");
                    }
                    let entry = service.traces.entry(trace_id.clone()).or_insert_with(|| Trace {
                        trace_id: trace_id.clone(),
                        service_id: service_id.clone(),
                        active: false,
                    });
                    entry.active = !ends_inactive;
                }
                for trace_id in &deactivate {
                    if let Some(trace) = service.traces.get_mut(trace_id) {
                        trace.active = false;
                    }
                }
            }

            for trace_id in activate.iter().chain(deactivate.iter()) {
                let active = registry
                    .services
                    .get(&service_id)
                    .and_then(|s| s.traces.get(trace_id))
                    .map(|t| t.active)
                    .unwrap_or(false);
                registry.notify_trace_waiters(trace_id, active);
            }
            registry.notify_service_waiters(&service_id);
            registry.notify_register_waiters(&service_id);
            for trace_id in deactivate {
                maybe_retire_trace(registry, &trace_id);
            }
        }
        DaemonEvent::TraceEvents {
            client_id,
            service_id,
            trace_id,
            witnesses,
            malformed,
            no_more_events,
            reply,
        } => {
            let trace_known = registry
                .services
                .get(&service_id)
                .map(|s| s.traces.contains_key(&trace_id))
                .unwrap_or(false);
            if !trace_known {
                let _ = reply.send(None);
                return;
            }

            registry.clients.entry(client_id.clone()).or_insert_with(|| ClientRegistration {
                client_id: client_id.clone(),
                service_name: service_id.clone(),
                registered_at: chrono::Utc::now(),
                active_trace_ids: vec![trace_id.clone()],
            });
            registry
                .clients_per_trace
                .entry(trace_id.clone())
                .or_default()
                .insert(client_id.clone());

            let parsed = witnesses.len();
            let mut drops = malformed;
            for witness in witnesses {
                if witness_sink.try_send((trace_id.clone(), witness)).is_err() {
                    drops += 1;
                }
            }

            let _ = reply.send(Some(TraceEventsResult { parsed, drops }));

            if no_more_events {
                if let Some(set) = registry.clients_per_trace.get_mut(&trace_id) {
                    set.remove(&client_id);
                }
                maybe_retire_trace(registry, &trace_id);
            }
        }
        DaemonEvent::UnregisterClientFromTrace { client_id, trace_id } => {
            debug!(client_id, trace_id, "client unregistered from trace");
            if let Some(set) = registry.clients_per_trace.get_mut(&trace_id) {
                set.remove(&client_id);
            }
            maybe_retire_trace(registry, &trace_id);
        }
    }
}

/// Once a trace has been marked inactive and no client remains registered
/// against it, drop it from its service entirely.
fn maybe_retire_trace(registry: &mut Registry, trace_id: &str) {
    let no_clients_left = registry
        .clients_per_trace
        .get(trace_id)
        .map(|s| s.is_empty())
        .unwrap_or(true);
    let inactive = registry
        .services
        .values()
        .find_map(|s| s.traces.get(trace_id))
        .map(|t| !t.active)
        .unwrap_or(true);
    if inactive && no_clients_left {
        registry.clients_per_trace.remove(trace_id);
        for service in registry.services.values_mut() {
            service.traces.remove(trace_id);
        }
    }
}

fn find_service_for_trace(registry: &Registry, trace_id: &str) -> Option<String> {
    registry
        .services
        .values()
        .find(|s| s.traces.contains_key(trace_id))
        .map(|s| s.service_id.clone())
}

/// Spawn one round of the outbound active-trace long-poll for `service_id`.
/// On a successful reply, newly-activated trace ids are folded into a
/// `StartTraces` event; on failure, sleeps and re-enqueues `LongPollService`
/// itself.
fn spawn_long_poll_service_round(ctx: &DaemonContext, service_id: String, known: Vec<String>) {
    let tx = ctx.tx.clone();
    let control_plane = ctx.control_plane.clone();
    let retry_interval = ctx.long_poll_retry_interval;
    tokio::spawn(async move {
        match control_plane.long_poll_active_traces(&service_id, &known).await {
            Ok(resp) => {
                let known_set: HashSet<&String> = known.iter().collect();
                let newly_activated: Vec<String> = resp
                    .active_trace_ids
                    .into_iter()
                    .filter(|id| !known_set.contains(id))
                    .collect();
                let _ = tx
                    .send(DaemonEvent::StartTraces { service_id, trace_ids: newly_activated })
                    .await;
            }
            Err(e) => {
                debug!(error = %e, service_id, "long-poll active-traces failed, retrying");
                tokio::time::sleep(retry_interval).await;
                let _ = tx.send(DaemonEvent::LongPollService { service_id }).await;
            }
        }
    });
}

/// Spawn one round of the outbound trace-active long-poll for `trace_id`.
/// Resolves to `EndTrace` once the control plane reports it inactive;
/// otherwise re-polls, on success immediately and on failure after a sleep.
fn spawn_long_poll_trace_round(ctx: &DaemonContext, service_id: String, trace_id: String) {
    let tx = ctx.tx.clone();
    let control_plane = ctx.control_plane.clone();
    let retry_interval = ctx.long_poll_retry_interval;
    tokio::spawn(async move {
        match control_plane.long_poll_trace_active(&trace_id).await {
            Ok(resp) if !resp.active => {
                let _ = tx.send(DaemonEvent::EndTrace { trace_id }).await;
            }
            Ok(_) => {
                let _ = tx.send(DaemonEvent::LongPollTrace { service_id, trace_id }).await;
            }
            Err(e) => {
                debug!(error = %e, trace_id, "long-poll trace-active failed, retrying");
                tokio::time::sleep(retry_interval).await;
                let _ = tx.send(DaemonEvent::LongPollTrace { service_id, trace_id }).await;
            }
        }
    });
}

fn spawn_heartbeat_round(ctx: &DaemonContext) {
    let tx = ctx.tx.clone();
    let control_plane = ctx.control_plane.clone();
    let interval = ctx.heartbeat_interval;
    tokio::spawn(async move {
        if let Err(e) = control_plane.heartbeat("daemon").await {
            warn!(error = %e, "daemon heartbeat failed");
        }
        tokio::time::sleep(interval).await;
        let _ = tx.send(DaemonEvent::Heartbeat).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_control_plane() -> Arc<ControlPlaneClient> {
        Arc::new(ControlPlaneClient::new("http://127.0.0.1:1", None, None, 60))
    }

    fn spawn_test_coordinator(
        witness_sink: mpsc::Sender<(String, Witness)>,
    ) -> (DaemonHandle, tokio::task::JoinHandle<()>) {
        DaemonCoordinator::spawn(
            witness_sink,
            test_control_plane(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn register_then_start_traces_reports_active_set() {
        let (sink, _rx) = mpsc::channel(16);
        let (handle, _join) = spawn_test_coordinator(sink);

        handle.start_traces("svc-a", vec!["t1".to_string()]).await;
        let active = handle.query_active_traces("svc-a").await;
        assert_eq!(active, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn activate_and_deactivate_overlap_ends_inactive() {
        let (sink, _rx) = mpsc::channel(16);
        let (handle, _join) = spawn_test_coordinator(sink);

        handle.start_traces("svc-a", vec!["t1".to_string()]).await;
        handle
            .change_active_traces("svc-a", vec!["t1".to_string()], vec!["t1".to_string()])
            .await;

        // "t1" was listed in both activate and deactivate; the active set
        // should no longer contain it.
        let active = handle.query_active_traces("svc-a").await;
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn register_client_gets_immediate_diff_when_known_set_is_stale() {
        let (sink, _rx) = mpsc::channel(16);
        let (handle, _join) = spawn_test_coordinator(sink);

        handle.start_traces("svc-a", vec!["t1".to_string(), "t2".to_string()]).await;

        let diff = handle
            .register_client("client-1", "svc-a", vec!["t1".to_string()])
            .await;
        assert_eq!(diff.activated, vec!["t2".to_string()]);
        assert!(diff.deactivated.is_empty());
    }

    #[tokio::test]
    async fn register_client_parks_then_resolves_on_start_traces() {
        let (sink, _rx) = mpsc::channel(16);
        let (handle, _join) = spawn_test_coordinator(sink);

        handle.start_traces("svc-a", vec!["t1".to_string()]).await;

        let handle_clone = handle.clone();
        let parked = tokio::spawn(async move {
            handle_clone
                .register_client("client-1", "svc-a", vec!["t1".to_string()])
                .await
        });

        // Give the registration a moment to park before the diff arrives.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.start_traces("svc-a", vec!["t2".to_string()]).await;

        let diff = parked.await.expect("registration task completed");
        assert_eq!(diff.activated, vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn trace_events_rejects_unknown_trace() {
        let (sink, _rx) = mpsc::channel(16);
        let (handle, _join) = spawn_test_coordinator(sink);

        let result = handle
            .trace_events("client-1", "svc-a", "missing-trace", Vec::new(), 0, false)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn trace_events_forwarded_and_counted() {
        let (sink, mut rx) = mpsc::channel(16);
        let (handle, _join) = spawn_test_coordinator(sink);
        handle.start_traces("svc-a", vec!["t1".to_string()]).await;

        let witness = Witness {
            id: Witness::new_id(),
            connection_id_display: "x".into(),
            trace_id: None,
            observed_at: chrono::Utc::now(),
            request: None,
            response: None,
            one_sided: true,
            tcp_metadata: None,
            tls_handshake: None,
        };
        let result = handle
            .trace_events("client-1", "svc-a", "t1", vec![witness], 1, false)
            .await
            .expect("known trace accepted");
        assert_eq!(result.parsed, 1);
        assert_eq!(result.drops, 1);

        let (trace_id, _w) = rx.recv().await.expect("forwarded witness");
        assert_eq!(trace_id, "t1");
    }

    #[tokio::test]
    async fn end_of_stream_retires_an_inactive_trace_with_no_other_clients() {
        let (sink, _rx) = mpsc::channel(16);
        let (handle, _join) = spawn_test_coordinator(sink);
        handle.start_traces("svc-a", vec!["t1".to_string()]).await;
        handle
            .trace_events("client-1", "svc-a", "t1", Vec::new(), 0, false)
            .await;
        handle.end_trace("t1").await;

        handle
            .trace_events("client-1", "svc-a", "t1", Vec::new(), 0, true)
            .await;

        // The trace was inactive and had exactly one registered client,
        // which just sent its end-of-stream marker; it should be gone.
        let result = handle
            .trace_events("client-1", "svc-a", "t1", Vec::new(), 0, false)
            .await;
        assert!(result.is_none());
    }

    use proptest::prelude::*;

    proptest! {
        /// A single `ChangeActiveTraces` diff converges to the same active
        /// set no matter how its activate/deactivate lists overlap or in
        /// what order their ids are listed: deactivate always wins, so the
        /// result is exactly (previously-active ∪ activate) \ deactivate.
        #[test]
        fn change_active_traces_converges_regardless_of_list_order(
            activate_ids in proptest::collection::hash_set("t[0-9]", 1..6),
            deactivate_ids in proptest::collection::hash_set("t[0-9]", 1..6),
            shuffle_seed in any::<u64>(),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let (sink, _rx) = mpsc::channel(16);
                let (handle, _join) = spawn_test_coordinator(sink);

                let mut activate: Vec<String> = activate_ids.into_iter().collect();
                let mut deactivate: Vec<String> = deactivate_ids.into_iter().collect();

                let mut state = shuffle_seed | 1;
                let mut shuffle = |v: &mut Vec<String>| {
                    for i in (1..v.len()).rev() {
                        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                        let j = (state % (i as u64 + 1)) as usize;
                        v.swap(i, j);
                    }
                };
                shuffle(&mut activate);
                shuffle(&mut deactivate);

                handle
                    .change_active_traces("svc-a", activate.clone(), deactivate.clone())
                    .await;

                let active: HashSet<String> = handle.query_active_traces("svc-a").await.into_iter().collect();

                let deactivate_set: HashSet<String> = deactivate.into_iter().collect();
                let expected: HashSet<String> = activate
                    .into_iter()
                    .filter(|id| !deactivate_set.contains(id))
                    .collect();

                prop_assert_eq!(active, expected);
            });
        }
    }
}
