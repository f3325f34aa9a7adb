//! Assistant SSE streamer.
//!
//! The stream opens with a `meta` event, narrates deterministically while
//! the pipeline runs, polls the job store until the job is terminal or the
//! window closes, and asks the LLM for exactly one SUMMARY on success.
//! Client disconnects are observed as send failures and end the driver
//! silently; LLM failures become an `error` event followed by `done`,
//! never an exception into the caller.

pub mod templates;

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::AssistantConfig;
use crate::error::FailureCode;
use crate::lang::verify_assistant_language_graceful;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::{Job, JobStatus, JobStore};

#[derive(Clone)]
pub struct AssistantState {
    pub store: Arc<JobStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub cfg: AssistantConfig,
}

/// Identity of the caller, resolved by the web layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub session_id: String,
    pub user_id: Option<String>,
}

/// One SSE frame before wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: serde_json::Value,
}

impl SseFrame {
    fn new(event: &'static str, data: serde_json::Value) -> Self {
        Self { event, data }
    }
}

/// Ownership check outcome; the web layer turns `Denied` into a 403.
#[derive(Debug, PartialEq, Eq)]
pub enum Ownership {
    Allowed,
    Denied,
}

/// Best-effort ownership validation: an unreadable store allows with a
/// warning, a missing job allows (the stream will narrate and poll), a
/// foreign job is denied.
pub async fn validate_ownership(store: &JobStore, request_id: &str, caller: &Caller) -> Ownership {
    match store.get_job(request_id).await {
        Some(job) => {
            let session_match = job.owner_session_id == caller.session_id;
            let user_match = match (&job.owner_user_id, &caller.user_id) {
                (Some(owner), Some(user)) => owner == user,
                _ => false,
            };
            if session_match || user_match {
                Ownership::Allowed
            } else {
                Ownership::Denied
            }
        }
        None => {
            tracing::warn!(request_id, "ownership not verifiable, allowing stream");
            Ownership::Allowed
        }
    }
}

/// Open the SSE response and spawn the driver.
pub fn stream(
    state: AssistantState,
    request_id: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let (tx, rx) = mpsc::channel::<SseFrame>(32);
    tokio::spawn(async move {
        drive(state, request_id, tx).await;
    });

    let stream = ReceiverStream::new(rx)
        .map(|frame| Ok(Event::default().event(frame.event).data(frame.data.to_string())));
    Sse::new(stream).keep_alive(KeepAlive::new().text(""))
}

/// The narration driver. Sending into a dropped receiver means the client
/// went away; every send is checked and the driver stops silently.
async fn drive(state: AssistantState, request_id: String, tx: mpsc::Sender<SseFrame>) {
    let job = state.store.get_job(&request_id).await;
    let language = resolve_language(job.as_ref());

    let meta = SseFrame::new(
        "meta",
        serde_json::json!({
            "requestId": request_id,
            "language": language,
            "startedAt": Utc::now().to_rfc3339(),
        }),
    );
    if tx.send(meta).await.is_err() {
        return;
    }

    // Jobs already parked on a clarify/stop outcome get one localized
    // assistant message and the stream closes.
    if let Some(job) = &job {
        if matches!(job.status, JobStatus::DoneClarify | JobStatus::DoneStopped) {
            finish_assist_outcome(&state, job, &language, &tx).await;
            return;
        }
    }

    // Search path: deterministic narration first, no LLM involved.
    let narration = SseFrame::new(
        "message",
        serde_json::json!({"text": templates::narration(&language), "kind": "narration"}),
    );
    if tx.send(narration).await.is_err() {
        return;
    }

    let deadline = tokio::time::Instant::now() + state.cfg.timeout;
    let mut ticker = tokio::time::interval(state.cfg.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if tokio::time::Instant::now() >= deadline {
            let timeout = SseFrame::new(
                "message",
                serde_json::json!({"text": templates::timeout_message(&language), "kind": "timeout"}),
            );
            let _ = tx.send(timeout).await;
            let _ = tx.send(done_frame()).await;
            return;
        }
        ticker.tick().await;

        // A closed receiver is the disconnect signal; stop polling.
        if tx.is_closed() {
            tracing::debug!(request_id, "sse client disconnected");
            return;
        }

        let Some(job) = state.store.get_job(&request_id).await else {
            continue;
        };
        match job.status {
            JobStatus::DoneSuccess => {
                finish_success(&state, &job, &language, &tx).await;
                return;
            }
            JobStatus::DoneClarify | JobStatus::DoneStopped => {
                finish_assist_outcome(&state, &job, &language, &tx).await;
                return;
            }
            JobStatus::DoneFailed => {
                let reason = job.error.as_ref().map(|e| e.code);
                let frame = SseFrame::new(
                    "message",
                    serde_json::json!({
                        "text": templates::failure_message(&language),
                        "kind": "failure",
                        "failureReason": reason,
                    }),
                );
                let _ = tx.send(frame).await;
                let _ = tx.send(done_frame()).await;
                return;
            }
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}

async fn finish_success(
    state: &AssistantState,
    job: &Job,
    language: &str,
    tx: &mpsc::Sender<SseFrame>,
) {
    let top_names: Vec<&str> = job
        .result
        .as_ref()
        .map(|r| r.results.iter().take(3).map(|p| p.name.as_str()).collect())
        .unwrap_or_default();
    let total = job.result.as_ref().map(|r| r.results.len()).unwrap_or(0);

    let prompt = format!(
        "The user searched for: \"{}\".\n\
         {total} restaurants were found. The top matches are: {}.\n\
         Write a short, friendly one-paragraph summary in the language with\n\
         ISO code \"{language}\". Mention the top places by name. Plain text only.",
        job.request.query,
        top_names.join(", "),
    );
    let request = CompletionRequest::new(vec![ChatMessage::user(&prompt)])
        .with_max_tokens(256)
        .with_temperature(0.4);

    match state.llm.complete(request).await {
        Ok(response) => {
            if verify_assistant_language_graceful(
                job.lang.as_ref(),
                language,
                &[job.request.language_hint.as_deref()],
            )
            .is_err()
            {
                let _ = tx
                    .send(SseFrame::new(
                        "error",
                        serde_json::json!({"code": FailureCode::LangEnforcementViolation}),
                    ))
                    .await;
                let _ = tx.send(done_frame()).await;
                return;
            }
            let frame = SseFrame::new(
                "message",
                serde_json::json!({"text": response.content, "kind": "summary"}),
            );
            let _ = tx.send(frame).await;
        }
        Err(e) => {
            tracing::warn!(request_id = %job.request_id, error = %e, "summary generation failed");
            let _ = tx
                .send(SseFrame::new(
                    "error",
                    serde_json::json!({"code": FailureCode::StageError}),
                ))
                .await;
        }
    }
    let _ = tx.send(done_frame()).await;
}

async fn finish_assist_outcome(
    state: &AssistantState,
    job: &Job,
    language: &str,
    tx: &mpsc::Sender<SseFrame>,
) {
    let assist = job.assist.as_ref();
    let prompt = format!(
        "The restaurant search could not complete and produced this assist\n\
         payload: {}.\n\
         Write one short, helpful sentence for the user in the language with\n\
         ISO code \"{language}\". Plain text only.",
        serde_json::to_string(&assist).unwrap_or_default(),
    );
    let request = CompletionRequest::new(vec![ChatMessage::user(&prompt)])
        .with_max_tokens(128)
        .with_temperature(0.4);

    match state.llm.complete(request).await {
        Ok(response) => {
            let frame = SseFrame::new(
                "message",
                serde_json::json!({
                    "text": response.content,
                    "kind": "assist",
                    "assist": assist,
                }),
            );
            let _ = tx.send(frame).await;
        }
        Err(e) => {
            tracing::warn!(request_id = %job.request_id, error = %e, "assist message failed");
            let _ = tx
                .send(SseFrame::new(
                    "error",
                    serde_json::json!({"code": FailureCode::StageError}),
                ))
                .await;
        }
    }
    let _ = tx.send(done_frame()).await;
}

fn done_frame() -> SseFrame {
    SseFrame::new("done", serde_json::json!({}))
}

/// Stored job context first, then the request hint, then English.
fn resolve_language(job: Option<&Job>) -> String {
    job.and_then(|j| {
        j.lang
            .as_ref()
            .map(|l| l.assistant_language().to_string())
            .or_else(|| j.request.language_hint.clone())
    })
    .unwrap_or_else(|| "en".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupConfig;
    use crate::error::{ErrorRecord, LlmError};
    use crate::lang::init_lang_ctx;
    use crate::llm::testing::ScriptedLlm;
    use crate::search::{
        AssistPayload, ClarifyQuestion, LatLng, NormalizedRequest, OpenNow, Place, ResponseMeta,
        SearchResponse, SharedFilters,
    };
    use crate::store::{JobOwner, MemoryBackend};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn store() -> Arc<JobStore> {
        Arc::new(JobStore::new(
            Arc::new(MemoryBackend::new()),
            DedupConfig {
                running_max_age: Duration::from_secs(90),
                success_fresh_window: Duration::from_secs(5),
                job_ttl: Duration::from_secs(300),
                sweep_interval: Duration::from_secs(30),
            },
        ))
    }

    fn state(store: Arc<JobStore>, llm: ScriptedLlm) -> AssistantState {
        AssistantState {
            store,
            llm: Arc::new(llm),
            cfg: AssistantConfig {
                poll_interval: Duration::from_millis(10),
                timeout: Duration::from_millis(500),
            },
        }
    }

    fn request(query: &str) -> NormalizedRequest {
        NormalizedRequest {
            query: query.to_string(),
            language_hint: Some("en".to_string()),
            user_location: None,
            filters: SharedFilters::default(),
        }
    }

    fn owner() -> JobOwner {
        JobOwner {
            session_id: "sess-1".to_string(),
            user_id: None,
        }
    }

    fn result_with(names: &[&str]) -> SearchResponse {
        SearchResponse {
            results: names
                .iter()
                .map(|n| Place {
                    place_id: n.to_string(),
                    name: n.to_string(),
                    address: None,
                    location: LatLng {
                        lat: 32.0,
                        lng: 34.7,
                    },
                    open_now: OpenNow::Open,
                    rating: Some(4.5),
                    user_ratings_total: Some(10),
                    price_level: None,
                    types: vec![],
                    opening_periods: vec![],
                    distance_meters: None,
                    cuisine_score: None,
                    dietary_hints: vec![],
                })
                .collect(),
            groups: None,
            chips: vec![],
            assist: None,
            meta: ResponseMeta::default(),
        }
    }

    async fn collect(state: AssistantState, request_id: String) -> Vec<SseFrame> {
        let (tx, mut rx) = mpsc::channel(32);
        let driver = tokio::spawn(async move { drive(state, request_id, tx).await });
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        driver.await.unwrap();
        frames
    }

    #[tokio::test]
    async fn test_success_path_event_order() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza in tel aviv"), "k", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, Some(10))
            .await
            .unwrap();
        store
            .set_lang_context(&job.request_id, init_lang_ctx("en", 0.9, "IL"))
            .await
            .unwrap();

        // Job completes shortly after the stream opens.
        let store_bg = store.clone();
        let id_bg = job.request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store_bg
                .set_result(&id_bg, result_with(&["Alpha", "Beta", "Gamma"]))
                .await
                .unwrap();
        });

        let llm = ScriptedLlm::replying(&["Alpha, Beta and Gamma look great for pizza."]);
        let frames = collect(state(store, llm), job.request_id.clone()).await;

        let kinds: Vec<&str> = frames.iter().map(|f| f.event).collect();
        assert_eq!(kinds, vec!["meta", "message", "message", "done"]);
        assert_eq!(frames[0].data["requestId"], job.request_id);
        assert_eq!(frames[1].data["kind"], "narration");
        assert_eq!(frames[2].data["kind"], "summary");
        let summary = frames[2].data["text"].as_str().unwrap();
        for name in ["Alpha", "Beta", "Gamma"] {
            assert!(summary.contains(name), "summary must mention {name}");
        }
    }

    #[tokio::test]
    async fn test_timeout_sends_localized_template() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "k", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, Some(10))
            .await
            .unwrap();
        store
            .set_lang_context(&job.request_id, init_lang_ctx("he", 0.9, "IL"))
            .await
            .unwrap();

        let mut st = state(store, ScriptedLlm::replying(&[]));
        st.cfg.timeout = Duration::from_millis(50);
        let frames = collect(st, job.request_id.clone()).await;

        let kinds: Vec<&str> = frames.iter().map(|f| f.event).collect();
        assert_eq!(kinds, vec!["meta", "message", "message", "done"]);
        assert_eq!(frames[2].data["kind"], "timeout");
        assert_eq!(
            frames[2].data["text"].as_str().unwrap(),
            templates::timeout_message("he")
        );
    }

    #[tokio::test]
    async fn test_clarify_job_gets_llm_message_then_done() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("food"), "k", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_assist_outcome(
                &job.request_id,
                JobStatus::DoneClarify,
                AssistPayload::Clarify {
                    question: ClarifyQuestion::Location,
                    reason: Some(FailureCode::LocationRequired),
                },
            )
            .await
            .unwrap();

        let llm = ScriptedLlm::replying(&["Where should I look?"]);
        let frames = collect(state(store, llm), job.request_id.clone()).await;

        let kinds: Vec<&str> = frames.iter().map(|f| f.event).collect();
        assert_eq!(kinds, vec!["meta", "message", "done"]);
        assert_eq!(frames[1].data["kind"], "assist");
        assert_eq!(frames[1].data["assist"]["kind"], "clarify");
    }

    #[tokio::test]
    async fn test_llm_error_becomes_error_then_done() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "k", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_result(&job.request_id, result_with(&["Alpha"]))
            .await
            .unwrap();

        let llm = ScriptedLlm::new(vec![Err(LlmError::Timeout { ms: 100 })]);
        let frames = collect(state(store, llm), job.request_id.clone()).await;

        let kinds: Vec<&str> = frames.iter().map(|f| f.event).collect();
        assert_eq!(kinds, vec!["meta", "message", "error", "done"]);
        assert_eq!(frames[2].data["code"], "STAGE_ERROR");
    }

    #[tokio::test]
    async fn test_failed_job_gets_failure_template_with_reason() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "k", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_error(
                &job.request_id,
                ErrorRecord::new(FailureCode::UpstreamTimeout, "slow"),
            )
            .await
            .unwrap();

        let frames = collect(state(store, ScriptedLlm::replying(&[])), job.request_id.clone()).await;
        let kinds: Vec<&str> = frames.iter().map(|f| f.event).collect();
        assert_eq!(kinds, vec!["meta", "message", "message", "done"]);
        assert_eq!(frames[2].data["kind"], "failure");
        assert_eq!(frames[2].data["failureReason"], "UPSTREAM_TIMEOUT");
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_silently() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "k", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();

        let llm = ScriptedLlm::replying(&[]);
        let st = state(store, llm);
        let (tx, mut rx) = mpsc::channel(32);
        let driver = tokio::spawn(drive(st, job.request_id.clone(), tx));

        // Read meta + narration, then hang up.
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .expect("driver must stop after disconnect")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ownership_validation() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "k", &owner())
            .await
            .unwrap();

        let mine = Caller {
            session_id: "sess-1".to_string(),
            user_id: None,
        };
        let theirs = Caller {
            session_id: "sess-2".to_string(),
            user_id: None,
        };
        assert_eq!(
            validate_ownership(&store, &job.request_id, &mine).await,
            Ownership::Allowed
        );
        assert_eq!(
            validate_ownership(&store, &job.request_id, &theirs).await,
            Ownership::Denied
        );
        // Unknown job: best-effort allow.
        assert_eq!(
            validate_ownership(&store, "missing", &theirs).await,
            Ownership::Allowed
        );
    }
}
