//! HTTP gateway: auth endpoints, async search submission, snapshots,
//! assistant SSE, health.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::assistant::{self, AssistantState, Caller, Ownership};
use crate::auth::{Identity, SessionService, TicketService};
use crate::cancel::CancelHandle;
use crate::error::{AuthError, FailureCode};
use crate::pipeline::Pipeline;
use crate::search::{SearchRequest, idempotency_key};
use crate::store::{JobOwner, JobStore, ReuseReason};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub tickets: Arc<TicketService>,
    pub store: Arc<JobStore>,
    pub pipeline: Arc<Pipeline>,
    pub assistant: AssistantState,
    /// Live cancel handles, one per running pipeline.
    pub cancels: Arc<Mutex<HashMap<String, CancelHandle>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/bootstrap", post(bootstrap))
        .route("/auth/ws-ticket", post(ws_ticket))
        .route("/search", post(submit_search))
        .route("/search/{request_id}", get(search_snapshot))
        .route("/stream/assistant/{request_id}", get(assistant_stream))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// --- Error mapping ---

#[derive(Serialize)]
struct ErrorBody {
    code: FailureCode,
    message: String,
}

fn error_response(status: StatusCode, code: FailureCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            code,
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn auth_error(e: AuthError) -> Response {
    match e {
        AuthError::SessionStoreUnavailable { .. } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            FailureCode::SessionStoreUnavailable,
            "session store unavailable",
        ),
        _ => error_response(
            StatusCode::UNAUTHORIZED,
            FailureCode::Unauthorized,
            "authentication required",
        ),
    }
}

// --- Handlers ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapResponse {
    ok: bool,
    session_id: String,
}

async fn bootstrap(State(state): State<AppState>) -> Response {
    match state.sessions.bootstrap().await {
        Ok((session_id, cookie)) => {
            let mut response = Json(BootstrapResponse {
                ok: true,
                session_id,
            })
            .into_response();
            match cookie.parse() {
                Ok(value) => {
                    response.headers_mut().insert(header::SET_COOKIE, value);
                }
                Err(_) => {
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        FailureCode::SessionStoreUnavailable,
                        "cookie encoding failed",
                    );
                }
            }
            response
        }
        Err(e) => auth_error(e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TicketResponse {
    ticket: String,
    ttl_seconds: u64,
}

async fn ws_ticket(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let identity = match state.sessions.resolve_identity(&headers).await {
        Ok(identity) => identity,
        Err(e) => return auth_error(e),
    };
    match state.tickets.issue(&identity).await {
        Ok(ticket) => Json(TicketResponse {
            ticket,
            ttl_seconds: state.tickets.ttl_seconds(),
        })
        .into_response(),
        Err(e) => auth_error(e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchAccepted {
    request_id: String,
    status: crate::store::JobStatus,
    reused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reuse_reason: Option<ReuseReason>,
}

async fn submit_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchRequest>,
) -> Response {
    let identity = match state.sessions.resolve_identity(&headers).await {
        Ok(identity) => identity,
        Err(e) => return auth_error(e),
    };

    let normalized = match body.normalize() {
        Ok(normalized) => normalized,
        Err(reason) => {
            return error_response(StatusCode::BAD_REQUEST, FailureCode::ValidationError, &reason);
        }
    };

    let Identity {
        session_id,
        user_id,
    } = identity;
    let principal = user_id.clone().unwrap_or_else(|| session_id.clone());
    let key = idempotency_key(
        &normalized.query,
        &principal,
        normalized.user_location.as_ref(),
        normalized.language_hint.as_deref(),
        &normalized.filters,
    );

    let owner = JobOwner {
        session_id,
        user_id,
    };
    let (job, outcome) = match state.store.create_or_get(normalized, &key, &owner).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "job creation failed");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                FailureCode::StoreUnavailable,
                "job store unavailable",
            );
        }
    };

    if !outcome.reused {
        let (handle, token) = crate::cancel::cancel_pair();
        state.cancels.lock().await.insert(job.request_id.clone(), handle);

        let pipeline = state.pipeline.clone();
        let cancels = state.cancels.clone();
        let request_id = job.request_id.clone();
        let job_for_run = job.clone();
        tokio::spawn(async move {
            pipeline.run(job_for_run, token).await;
            cancels.lock().await.remove(&request_id);
        });
    }

    (
        StatusCode::ACCEPTED,
        Json(SearchAccepted {
            request_id: job.request_id,
            status: job.status,
            reused: outcome.reused,
            reuse_reason: outcome.reason,
        }),
    )
        .into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSnapshot {
    request_id: String,
    status: crate::store::JobStatus,
    progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<crate::search::SearchResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<crate::error::ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assist: Option<crate::search::AssistPayload>,
}

async fn search_snapshot(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.store.get_job(&request_id).await {
        Some(job) => Json(JobSnapshot {
            request_id: job.request_id,
            status: job.status,
            progress: job.progress,
            result: job.result,
            error: job.error,
            assist: job.assist,
        })
        .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            FailureCode::ValidationError,
            "unknown request id",
        ),
    }
}

async fn assistant_stream(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match state.sessions.resolve_identity(&headers).await {
        Ok(identity) => identity,
        // Best-effort when the session store is down: allow but warn.
        Err(AuthError::SessionStoreUnavailable { reason }) => {
            tracing::warn!(reason, "assistant stream allowed without ownership check");
            Identity {
                session_id: String::new(),
                user_id: None,
            }
        }
        Err(e) => return auth_error(e),
    };

    if !identity.session_id.is_empty() {
        let caller = Caller {
            session_id: identity.session_id,
            user_id: identity.user_id,
        };
        if assistant::validate_ownership(&state.store, &request_id, &caller).await
            == Ownership::Denied
        {
            return error_response(
                StatusCode::FORBIDDEN,
                FailureCode::Unauthorized,
                "not the owner of this request",
            );
        }
    }

    assistant::stream(state.assistant.clone(), request_id).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ready: bool,
    checks: serde_json::Value,
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(HealthResponse {
            status: "ok",
            ready: true,
            checks: serde_json::json!({"store": "ok"}),
        })
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                ready: false,
                checks: serde_json::json!({"store": e.to_string()}),
            }),
        )
            .into_response(),
    }
}
