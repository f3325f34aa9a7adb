//! The Realtime Hub: subscriptions, backlog, fan-out, liveness.
//!
//! Process-wide singleton. All subscription state lives behind one lock; the
//! per-connection outbound queues are the only thing touched outside it.
//! Connections never point at request state directly: two index maps
//! (`by_request`, `by_connection`) are the sole join between them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::realtime::backlog::Backlog;
use crate::realtime::connection::{Outbound, PushOutcome};
use crate::realtime::protocol::{ServerMessage, close};
use crate::store::{Job, JobStatus, JobStore, RealtimeLink};

/// Authenticated identity bound to a connection at upgrade time.
#[derive(Debug, Clone)]
pub struct ConnIdentity {
    pub session_id: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    AwaitingPong,
}

struct ConnEntry {
    outbound: Arc<Outbound>,
    #[allow(dead_code)]
    identity: ConnIdentity,
    liveness: Liveness,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, ConnEntry>,
    /// request_id -> (connection -> subscribed_at)
    by_request: HashMap<String, HashMap<Uuid, Instant>>,
    /// connection -> request_ids
    by_connection: HashMap<Uuid, HashSet<String>>,
    backlogs: HashMap<String, Backlog>,
}

pub struct RealtimeHub {
    cfg: RealtimeConfig,
    backlog_ttl: Duration,
    state: Mutex<HubState>,
    store: tokio::sync::RwLock<Option<Arc<JobStore>>>,
    /// Fired with a request id whenever its last subscriber goes away.
    abandon_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<String>>>,
}

impl RealtimeHub {
    pub fn new(cfg: RealtimeConfig, backlog_ttl: Duration) -> Self {
        Self {
            cfg,
            backlog_ttl,
            state: Mutex::new(HubState::default()),
            store: tokio::sync::RwLock::new(None),
            abandon_tx: Mutex::new(None),
        }
    }

    /// Register the channel notified when a request loses its last
    /// subscriber (drives orchestrator cancellation for abandoned jobs).
    pub fn set_abandon_listener(&self, tx: tokio::sync::mpsc::UnboundedSender<String>) {
        *self.abandon_tx.lock().expect("hub lock") = Some(tx);
    }

    fn notify_abandoned(&self, request_ids: Vec<String>) {
        if request_ids.is_empty() {
            return;
        }
        let guard = self.abandon_tx.lock().expect("hub lock");
        if let Some(tx) = guard.as_ref() {
            for request_id in request_ids {
                let _ = tx.send(request_id);
            }
        }
    }

    /// Wire in the job store once it exists (hub and store are mutually
    /// linked singletons).
    pub async fn attach_store(&self, store: Arc<JobStore>) {
        *self.store.write().await = Some(store);
    }

    // --- Connection lifecycle ---

    /// Register an authenticated connection. Returns its id and outbound
    /// queue; a `ws_status: connected` frame is already queued.
    pub fn register(&self, identity: ConnIdentity) -> (Uuid, Arc<Outbound>) {
        let client_id = Uuid::new_v4();
        let outbound = Arc::new(Outbound::new(self.cfg.outbound_queue_max));
        outbound.push(ServerMessage::WsStatus {
            state: "connected",
            ts: Utc::now().timestamp_millis(),
        });

        let mut state = self.state.lock().expect("hub lock");
        state.connections.insert(
            client_id,
            ConnEntry {
                outbound: outbound.clone(),
                identity,
                liveness: Liveness::Alive,
            },
        );
        tracing::debug!(%client_id, "ws connection registered");
        (client_id, outbound)
    }

    /// Remove a connection and all of its subscriptions.
    pub fn unregister(&self, client_id: Uuid) {
        let abandoned = {
            let mut state = self.state.lock().expect("hub lock");
            drop_connections(&mut state, &[client_id])
        };
        self.notify_abandoned(abandoned);
        tracing::debug!(%client_id, "ws connection unregistered");
    }

    /// Any inbound frame proves the peer is alive.
    pub fn mark_alive(&self, client_id: Uuid) {
        let mut state = self.state.lock().expect("hub lock");
        if let Some(entry) = state.connections.get_mut(&client_id) {
            entry.liveness = Liveness::Alive;
        }
    }

    // --- Subscriptions ---

    /// Subscribe a connection to a request and replay the backlog.
    ///
    /// Replay is oldest-first. When the job is already terminal and the
    /// backlog has expired, a one-shot terminal frame is synthesized from
    /// the store. Subscribing to a request nobody has seen yet is allowed
    /// (pending subscription) and expires after a bounded window.
    pub async fn subscribe(&self, client_id: Uuid, request_id: &str) -> bool {
        let outbound = {
            let mut state = self.state.lock().expect("hub lock");
            let Some(entry) = state.connections.get(&client_id) else {
                return false;
            };
            let outbound = entry.outbound.clone();

            state
                .by_request
                .entry(request_id.to_string())
                .or_default()
                .insert(client_id, Instant::now());
            state
                .by_connection
                .entry(client_id)
                .or_default()
                .insert(request_id.to_string());

            outbound.push(ServerMessage::Ack {
                request_id: request_id.to_string(),
            });
            if let Some(backlog) = state.backlogs.get(request_id) {
                for frame in backlog.replay() {
                    outbound.push(frame);
                }
                return true;
            }
            outbound
        };

        // No backlog: the job may be terminal with its backlog expired.
        let store = self.store.read().await.clone();
        if let Some(store) = store {
            if let Some(job) = store.get_job(request_id).await {
                if job.status.is_terminal() {
                    outbound.push(terminal_frame(&job));
                }
            }
        }
        true
    }

    pub fn unsubscribe(&self, client_id: Uuid, request_id: &str) {
        let abandoned = {
            let mut state = self.state.lock().expect("hub lock");
            let mut emptied = false;
            if let Some(subs) = state.by_request.get_mut(request_id) {
                subs.remove(&client_id);
                if subs.is_empty() {
                    state.by_request.remove(request_id);
                    emptied = true;
                }
            }
            if let Some(requests) = state.by_connection.get_mut(&client_id) {
                requests.remove(request_id);
            }
            emptied.then(|| vec![request_id.to_string()]).unwrap_or_default()
        };
        self.notify_abandoned(abandoned);
    }

    pub fn has_subscribers(&self, request_id: &str) -> bool {
        let state = self.state.lock().expect("hub lock");
        state
            .by_request
            .get(request_id)
            .is_some_and(|subs| !subs.is_empty())
    }

    // --- Publish & close ---

    /// Append to the backlog and fan out to every live subscriber in FIFO
    /// order. Undeliverable connections are closed, never unwound into the
    /// caller.
    pub fn publish(&self, request_id: &str, msg: ServerMessage) {
        let mut state = self.state.lock().expect("hub lock");

        let capacity = self.cfg.backlog_capacity;
        let ttl = self.backlog_ttl;
        state
            .backlogs
            .entry(request_id.to_string())
            .or_insert_with(|| Backlog::new(capacity, ttl))
            .push(msg.clone());

        let Some(subs) = state.by_request.get(request_id) else {
            return;
        };
        let targets: Vec<Uuid> = subs.keys().copied().collect();
        for client_id in targets {
            let Some(entry) = state.connections.get(&client_id) else {
                continue;
            };
            match entry.outbound.push(msg.clone()) {
                PushOutcome::OverflowCritical => {
                    tracing::warn!(
                        %client_id,
                        request_id,
                        dropped = entry.outbound.dropped_count(),
                        "closing slow consumer, critical frame undeliverable"
                    );
                }
                PushOutcome::DroppedNonCritical => {
                    tracing::debug!(%client_id, request_id, "dropped non-critical frame");
                }
                _ => {}
            }
        }
    }

    /// Publish the terminal frame for a finished job.
    pub fn publish_terminal(&self, job: &Job) {
        self.publish(&job.request_id, terminal_frame(job));
    }

    /// Notify subscribers with a terminal frame and drop the backlog.
    /// Used by explicit job deletion and shutdown, not the normal terminal
    /// path (which keeps the backlog for late subscribers until TTL).
    pub fn close_request(&self, request_id: &str, status: JobStatus) {
        self.publish(
            request_id,
            ServerMessage::Terminal {
                request_id: request_id.to_string(),
                status,
                result: None,
            },
        );
        let mut state = self.state.lock().expect("hub lock");
        state.backlogs.remove(request_id);
        if let Some(subs) = state.by_request.remove(request_id) {
            for client_id in subs.keys() {
                if let Some(requests) = state.by_connection.get_mut(client_id) {
                    requests.remove(request_id);
                }
            }
        }
    }

    // --- Heartbeat & reclamation ---

    /// One heartbeat pass: ping live connections, close peers that never
    /// answered the previous ping, drop expired backlogs, and expire pending
    /// subscriptions to requests that never materialized.
    pub async fn heartbeat_tick(&self) {
        let (pending_candidates, abandoned) = {
            let mut state = self.state.lock().expect("hub lock");

            // Liveness: a connection still AwaitingPong missed a full
            // interval.
            let mut dead = Vec::new();
            for (client_id, entry) in state.connections.iter_mut() {
                match entry.liveness {
                    Liveness::AwaitingPong => {
                        entry.outbound.close(close::INTERNAL, "heartbeat missed");
                        dead.push(*client_id);
                    }
                    Liveness::Alive => {
                        entry.liveness = Liveness::AwaitingPong;
                        entry.outbound.push_ping();
                    }
                }
            }
            let abandoned = drop_connections(&mut state, &dead);

            let now = Instant::now();
            state.backlogs.retain(|_, b| !b.is_expired(now));

            // Subscriptions old enough to be pending-expired, for requests
            // with no backlog (nothing was ever published).
            let ttl = self.cfg.pending_subscription_ttl;
            let mut candidates: Vec<(String, Vec<Uuid>)> = Vec::new();
            for (request_id, subs) in &state.by_request {
                if state.backlogs.contains_key(request_id) {
                    continue;
                }
                let expired: Vec<Uuid> = subs
                    .iter()
                    .filter(|(_, at)| now.duration_since(**at) > ttl)
                    .map(|(id, _)| *id)
                    .collect();
                if !expired.is_empty() {
                    candidates.push((request_id.clone(), expired));
                }
            }
            (candidates, abandoned)
        };
        self.notify_abandoned(abandoned);

        if pending_candidates.is_empty() {
            return;
        }

        // Only expire subscriptions whose job genuinely never existed; a
        // slow pipeline that simply has not published yet keeps its
        // subscribers.
        let store = self.store.read().await.clone();
        for (request_id, clients) in pending_candidates {
            if let Some(store) = &store {
                if store.get_job(&request_id).await.is_some() {
                    continue;
                }
            }
            let mut state = self.state.lock().expect("hub lock");
            for client_id in clients {
                if let Some(subs) = state.by_request.get_mut(&request_id) {
                    subs.remove(&client_id);
                    if subs.is_empty() {
                        state.by_request.remove(&request_id);
                    }
                }
                if let Some(requests) = state.by_connection.get_mut(&client_id) {
                    requests.remove(&request_id);
                }
                if let Some(entry) = state.connections.get(&client_id) {
                    entry.outbound.push(ServerMessage::Nack {
                        request_id: request_id.clone(),
                        reason: "subscription expired".to_string(),
                    });
                }
            }
        }
    }

    /// Drain all connections with `1001` and clear state.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("hub lock");
        for entry in state.connections.values() {
            entry.outbound.close(close::GOING_AWAY, "server shutdown");
        }
        state.connections.clear();
        state.by_request.clear();
        state.by_connection.clear();
        state.backlogs.clear();
        tracing::info!("realtime hub drained");
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().expect("hub lock").connections.len()
    }
}

/// Remove connections from every index; returns the request ids that lost
/// their last subscriber.
fn drop_connections(state: &mut HubState, dead: &[Uuid]) -> Vec<String> {
    let mut abandoned = Vec::new();
    for client_id in dead {
        state.connections.remove(client_id);
        if let Some(requests) = state.by_connection.remove(client_id) {
            for request_id in requests {
                if let Some(subs) = state.by_request.get_mut(&request_id) {
                    subs.remove(client_id);
                    if subs.is_empty() {
                        state.by_request.remove(&request_id);
                        abandoned.push(request_id);
                    }
                }
            }
        }
    }
    abandoned
}

fn terminal_frame(job: &Job) -> ServerMessage {
    ServerMessage::Terminal {
        request_id: job.request_id.clone(),
        status: job.status,
        result: job.result.clone().map(Box::new),
    }
}

/// Spawn the heartbeat loop.
pub fn spawn_heartbeat(hub: Arc<RealtimeHub>) -> tokio::task::JoinHandle<()> {
    let interval = hub.cfg.heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            hub.heartbeat_tick().await;
        }
    })
}

#[async_trait]
impl RealtimeLink for RealtimeHub {
    async fn has_active_subscribers(&self, request_id: &str) -> bool {
        self.has_subscribers(request_id)
    }

    async fn notify_terminal(&self, job: &Job) {
        self.publish_terminal(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::connection::OutFrame;
    use pretty_assertions::assert_eq;

    fn hub() -> RealtimeHub {
        RealtimeHub::new(
            RealtimeConfig {
                heartbeat_interval: Duration::from_secs(30),
                outbound_queue_max: 16,
                pending_subscription_ttl: Duration::from_secs(60),
                backlog_capacity: 8,
            },
            Duration::from_secs(300),
        )
    }

    fn identity() -> ConnIdentity {
        ConnIdentity {
            session_id: "sess-1".to_string(),
            user_id: None,
        }
    }

    fn progress(request_id: &str, n: u8) -> ServerMessage {
        ServerMessage::Progress {
            request_id: request_id.to_string(),
            stage: "gate".to_string(),
            progress: n,
        }
    }

    async fn drain_messages(out: &Outbound, n: usize) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while frames.len() < n {
            match out.next().await {
                OutFrame::Message(m) => frames.push(m),
                OutFrame::Ping => {}
                OutFrame::Close { .. } => break,
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_backlog_replay_in_order() {
        let hub = hub();
        hub.publish("r-1", progress("r-1", 10));
        hub.publish("r-1", progress("r-1", 40));
        hub.publish(
            "r-1",
            ServerMessage::Partial {
                request_id: "r-1".to_string(),
                results: vec![],
            },
        );

        let (client, out) = hub.register(identity());
        assert!(hub.subscribe(client, "r-1").await);

        // connected + ack + three replayed frames
        let frames = drain_messages(&out, 5).await;
        assert!(matches!(frames[0], ServerMessage::WsStatus { .. }));
        assert!(matches!(frames[1], ServerMessage::Ack { .. }));
        match &frames[2] {
            ServerMessage::Progress { progress, .. } => assert_eq!(*progress, 10),
            other => panic!("unexpected {other:?}"),
        }
        match &frames[3] {
            ServerMessage::Progress { progress, .. } => assert_eq!(*progress, 40),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(frames[4], ServerMessage::Partial { .. }));
    }

    #[tokio::test]
    async fn test_live_messages_after_replay() {
        let hub = hub();
        hub.publish("r-1", progress("r-1", 10));

        let (client, out) = hub.register(identity());
        hub.subscribe(client, "r-1").await;
        hub.publish("r-1", progress("r-1", 70));

        let frames = drain_messages(&out, 4).await;
        match &frames[3] {
            ServerMessage::Progress { progress, .. } => assert_eq!(*progress, 70),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = hub();
        let (client, out) = hub.register(identity());
        hub.subscribe(client, "r-1").await;
        hub.unsubscribe(client, "r-1");
        hub.publish("r-1", progress("r-1", 10));

        // connected + ack only; the progress frame was never delivered.
        let frames = drain_messages(&out, 2).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(out.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_has_subscribers_tracks_lifecycle() {
        let hub = hub();
        let (client, _out) = hub.register(identity());
        assert!(!hub.has_subscribers("r-1"));
        hub.subscribe(client, "r-1").await;
        assert!(hub.has_subscribers("r-1"));
        hub.unregister(client);
        assert!(!hub.has_subscribers("r-1"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_fan_out() {
        let hub = hub();
        let (c1, o1) = hub.register(identity());
        let (c2, o2) = hub.register(identity());
        hub.subscribe(c1, "r-1").await;
        hub.subscribe(c2, "r-1").await;

        hub.publish("r-1", progress("r-1", 25));

        for out in [&o1, &o2] {
            let frames = drain_messages(out, 3).await;
            match &frames[2] {
                ServerMessage::Progress { progress, .. } => assert_eq!(*progress, 25),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_connection_subscribes_to_multiple_requests() {
        let hub = hub();
        let (client, out) = hub.register(identity());
        hub.subscribe(client, "r-1").await;
        hub.subscribe(client, "r-2").await;
        hub.publish("r-1", progress("r-1", 10));
        hub.publish("r-2", progress("r-2", 20));

        let frames = drain_messages(&out, 5).await;
        let ids: Vec<Option<&str>> = frames.iter().map(|f| f.request_id()).collect();
        assert!(ids.contains(&Some("r-1")));
        assert!(ids.contains(&Some("r-2")));
    }

    #[tokio::test]
    async fn test_heartbeat_closes_silent_peer() {
        let hub = hub();
        let (client, out) = hub.register(identity());

        // First tick: ping goes out, peer marked AwaitingPong.
        hub.heartbeat_tick().await;
        assert_eq!(hub.connection_count(), 1);
        // Second tick with no pong: closed with 1011.
        hub.heartbeat_tick().await;
        assert_eq!(hub.connection_count(), 0);

        let mut saw_close = false;
        for _ in 0..8 {
            match out.next().await {
                OutFrame::Close { code, .. } => {
                    assert_eq!(code, close::INTERNAL);
                    saw_close = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_close);
        // mark_alive after unregister is a no-op, not a panic.
        hub.mark_alive(client);
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let hub = hub();
        let (client, _out) = hub.register(identity());

        hub.heartbeat_tick().await;
        hub.mark_alive(client);
        hub.heartbeat_tick().await;
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_close_request_sends_terminal_and_clears() {
        let hub = hub();
        let (client, out) = hub.register(identity());
        hub.subscribe(client, "r-1").await;
        hub.publish("r-1", progress("r-1", 10));

        hub.close_request("r-1", JobStatus::DoneFailed);
        assert!(!hub.has_subscribers("r-1"));

        let frames = drain_messages(&out, 4).await;
        match &frames[3] {
            ServerMessage::Terminal { status, .. } => assert_eq!(*status, JobStatus::DoneFailed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abandon_listener_fires_on_last_unsubscribe() {
        let hub = hub();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        hub.set_abandon_listener(tx);

        let (c1, _o1) = hub.register(identity());
        let (c2, _o2) = hub.register(identity());
        hub.subscribe(c1, "r-1").await;
        hub.subscribe(c2, "r-1").await;

        hub.unsubscribe(c1, "r-1");
        assert!(rx.try_recv().is_err(), "one subscriber remains");

        hub.unregister(c2);
        assert_eq!(rx.try_recv().unwrap(), "r-1");
    }

    #[tokio::test]
    async fn test_shutdown_drains_with_going_away() {
        let hub = hub();
        let (_c1, o1) = hub.register(identity());
        hub.shutdown();
        assert_eq!(hub.connection_count(), 0);

        loop {
            match o1.next().await {
                OutFrame::Close { code, .. } => {
                    assert_eq!(code, close::GOING_AWAY);
                    break;
                }
                _ => continue,
            }
        }
    }
}
