//! Process wiring: build every subsystem, link the singletons, run the
//! background loops, serve, and drain on shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::assistant::AssistantState;
use crate::auth::{SessionService, TicketService};
use crate::cancel::CancelHandle;
use crate::config::Config;
use crate::llm::create_llm_provider;
use crate::pipeline::Pipeline;
use crate::provider::GooglePlacesClient;
use crate::ranking::validate_profiles;
use crate::realtime::{RealtimeHub, WsState, spawn_heartbeat, ws_handler};
use crate::store::{JobStore, KvBackend, MemoryBackend, PostgresBackend, sweep::spawn_sweeper};
use crate::web::{AppState, router};

pub struct Engine {
    pub config: Config,
    pub store: Arc<JobStore>,
    pub hub: Arc<RealtimeHub>,
    pub sessions: Arc<SessionService>,
    pub tickets: Arc<TicketService>,
    pub pipeline: Arc<Pipeline>,
    llm: Arc<dyn crate::llm::LlmProvider>,
    cancels: Arc<Mutex<HashMap<String, CancelHandle>>>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build and link every subsystem.
    ///
    /// Ranking profiles are validated first; a broken weight table aborts
    /// startup. `force_memory` pins the in-memory backend regardless of
    /// `DATABASE_URL` (tests, local runs).
    pub async fn init(config: Config, force_memory: bool) -> anyhow::Result<Arc<Self>> {
        validate_profiles().map_err(|e| anyhow::anyhow!("ranking profile table invalid: {e}"))?;

        let backend: Arc<dyn KvBackend> = if !force_memory && config.database.url.is_some() {
            tracing::info!("using postgres kv backend");
            Arc::new(PostgresBackend::new(&config.database).await?)
        } else {
            tracing::info!("using in-memory kv backend");
            Arc::new(MemoryBackend::new())
        };

        let store = Arc::new(JobStore::new(backend.clone(), config.dedup.clone()));
        let hub = Arc::new(RealtimeHub::new(
            config.realtime.clone(),
            config.dedup.job_ttl,
        ));
        store.attach_realtime(hub.clone()).await;
        hub.attach_store(store.clone()).await;

        let llm = create_llm_provider(&config.llm);
        let places = Arc::new(GooglePlacesClient::new(config.provider.clone()));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            hub.clone(),
            llm.clone(),
            places,
            config.pipeline.clone(),
            config.ranking.clone(),
        ));

        let sessions = Arc::new(SessionService::new(backend.clone(), config.auth.clone()));
        let tickets = Arc::new(TicketService::new(backend, config.auth.ws_ticket_ttl));

        let engine = Arc::new(Self {
            config,
            store: store.clone(),
            hub: hub.clone(),
            sessions,
            tickets,
            pipeline,
            llm,
            cancels: Arc::new(Mutex::new(HashMap::new())),
            background: std::sync::Mutex::new(Vec::new()),
        });

        // Background loops: staleness sweep, WS heartbeat, and the
        // abandoned-request canceller.
        let (abandon_tx, abandon_rx) = tokio::sync::mpsc::unbounded_channel();
        hub.set_abandon_listener(abandon_tx);
        let canceller = spawn_abandon_canceller(engine.clone(), abandon_rx);
        let sweeper = spawn_sweeper(store);
        let heartbeat = spawn_heartbeat(hub);
        engine
            .background
            .lock()
            .expect("engine lock")
            .extend([canceller, sweeper, heartbeat]);

        Ok(engine)
    }

    /// The full axum router (HTTP gateway + WebSocket endpoint).
    pub fn router(self: &Arc<Self>) -> axum::Router {
        let app = router(AppState {
            sessions: self.sessions.clone(),
            tickets: self.tickets.clone(),
            store: self.store.clone(),
            pipeline: self.pipeline.clone(),
            assistant: AssistantState {
                store: self.store.clone(),
                llm: self.llm.clone(),
                cfg: self.config.assistant.clone(),
            },
            cancels: self.cancels.clone(),
        });

        let ws = axum::Router::new()
            .route("/ws", axum::routing::get(ws_handler))
            .with_state(WsState {
                hub: self.hub.clone(),
                tickets: self.tickets.clone(),
            });

        app.merge(ws)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .layer(tower_http::cors::CorsLayer::permissive())
    }

    /// Drain subscribers with `1001`, stop background loops.
    pub async fn shutdown(&self) {
        self.hub.shutdown();
        for handle in self.background.lock().expect("engine lock").drain(..) {
            handle.abort();
        }
        tracing::info!("engine stopped");
    }
}

/// Cancel pipelines whose request lost its last watcher while still
/// running. The store consults the hub again before stale-marking, so a
/// re-subscribe in the race window wins.
fn spawn_abandon_canceller(
    engine: Arc<Engine>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request_id) = rx.recv().await {
            if engine.hub.has_subscribers(&request_id) {
                continue;
            }
            let still_running = engine
                .store
                .get_status(&request_id)
                .await
                .is_some_and(|(status, _)| !status.is_terminal());
            if !still_running {
                engine.cancels.lock().await.remove(&request_id);
                continue;
            }
            if let Some(handle) = engine.cancels.lock().await.remove(&request_id) {
                tracing::info!(request_id, "cancelling abandoned pipeline");
                handle.cancel();
            }
        }
    })
}
