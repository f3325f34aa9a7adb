//! Durable job store with idempotent deduplication.
//!
//! The store owns every job mutation. All writes for a request go through a
//! per-`request_id` critical section, dedup decisions are computed by the
//! pure matrix in [`job::decide`], and the backing storage is an abstract
//! key-value interface with in-memory and Postgres implementations.
//!
//! Read failures degrade to `None` with a structured warning; write failures
//! surface as [`StoreError::Unavailable`] so the caller can abort with
//! `SERVICE_UNAVAILABLE`.

pub mod job;
pub mod memory;
pub mod postgres;
pub mod sweep;

pub use job::{DedupDecision, Job, JobStatus, ReuseReason, decide};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::error::{ErrorRecord, FailureCode, StoreError};
use crate::search::{AssistPayload, NormalizedRequest, Place, SearchResponse};

/// Persisted key layout.
const JOB_PREFIX: &str = "job:";
const IDEM_PREFIX: &str = "job_idem:";
const POOL_PREFIX: &str = "candidate_pool:";

/// Abstract key-value persistence.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Upsert. `ttl = None` means the entry does not expire.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError>;

    /// Drop expired entries; returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

/// The store's view of the Realtime Hub. Injected after construction to
/// break the store <-> hub dependency cycle.
#[async_trait]
pub trait RealtimeLink: Send + Sync {
    async fn has_active_subscribers(&self, request_id: &str) -> bool;

    /// Announce a terminal transition the pipeline did not publish itself
    /// (stale-marking by dedup or the sweeper).
    async fn notify_terminal(&self, job: &Job);
}

/// Result of `create_or_get` alongside the job itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseOutcome {
    pub reused: bool,
    /// `None` only when no prior job matched the idempotency key.
    pub reason: Option<ReuseReason>,
}

/// Identity of the caller creating a job.
#[derive(Debug, Clone)]
pub struct JobOwner {
    pub session_id: String,
    pub user_id: Option<String>,
}

pub struct JobStore {
    backend: Arc<dyn KvBackend>,
    cfg: DedupConfig,
    /// Per-key async locks (request ids and idempotency keys).
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    realtime: tokio::sync::RwLock<Option<Arc<dyn RealtimeLink>>>,
}

impl JobStore {
    pub fn new(backend: Arc<dyn KvBackend>, cfg: DedupConfig) -> Self {
        Self {
            backend,
            cfg,
            locks: Mutex::new(HashMap::new()),
            realtime: tokio::sync::RwLock::new(None),
        }
    }

    /// Wire in the hub once it exists.
    pub async fn attach_realtime(&self, link: Arc<dyn RealtimeLink>) {
        *self.realtime.write().await = Some(link);
    }

    pub fn config(&self) -> &DedupConfig {
        &self.cfg
    }

    async fn lock_for(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let cell = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        cell.lock_owned().await
    }

    /// Drop lock cells nobody is holding. Called by the sweeper.
    pub async fn prune_locks(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, cell| Arc::strong_count(cell) > 1);
    }

    // --- Creation & dedup ---

    /// Idempotent job creation.
    ///
    /// A prior job matching the idempotency key is evaluated through the
    /// dedup matrix; stale RUNNING jobs are failed first (unless someone is
    /// still watching them), then a fresh job is created.
    pub async fn create_or_get(
        &self,
        request: NormalizedRequest,
        idempotency_key: &str,
        owner: &JobOwner,
    ) -> Result<(Job, ReuseOutcome), StoreError> {
        let _guard = self.lock_for(&format!("idem-lock:{idempotency_key}")).await;

        let mut prior_reason = None;
        if let Some(existing_id) = self.read_idem(idempotency_key).await {
            if let Some(existing) = self.get_job(&existing_id).await {
                let now = Utc::now();
                let decision = decide(
                    existing.status,
                    existing.age(now),
                    existing.updated_age(now),
                    &self.cfg,
                );
                match decision {
                    DedupDecision::Reuse { reason } => {
                        tracing::debug!(
                            request_id = %existing.request_id,
                            reason = ?reason,
                            "dedup reuse"
                        );
                        return Ok((
                            existing,
                            ReuseOutcome {
                                reused: true,
                                reason: Some(reason),
                            },
                        ));
                    }
                    DedupDecision::NewJob { reason, mark_stale } => {
                        if let Some(code) = mark_stale {
                            // Best-effort: an un-markable prior job must not
                            // block the new submission.
                            if let Err(e) = self.mark_stale(&existing.request_id, code).await {
                                tracing::warn!(
                                    request_id = %existing.request_id,
                                    error = %e,
                                    "failed to stale-mark prior job"
                                );
                            }
                        }
                        prior_reason = Some(reason);
                    }
                }
            }
        }

        let request_id = Uuid::new_v4().to_string();
        let job = Job::new(
            request_id,
            idempotency_key,
            owner.session_id.clone(),
            owner.user_id.clone(),
            request,
        );
        self.write_job(&job, None).await?;
        self.backend
            .set(
                &format!("{IDEM_PREFIX}{idempotency_key}"),
                serde_json::Value::String(job.request_id.clone()),
                None,
            )
            .await?;

        tracing::info!(request_id = %job.request_id, reason = ?prior_reason, "job created");
        Ok((
            job,
            ReuseOutcome {
                reused: false,
                reason: prior_reason,
            },
        ))
    }

    /// Mark a RUNNING job failed with a staleness code.
    ///
    /// Idempotent: re-fetches under the request lock and does nothing when
    /// the job is already terminal. When the hub still has subscribers for
    /// the request, liveness is extended by one heartbeat instead.
    pub async fn mark_stale(
        &self,
        request_id: &str,
        code: FailureCode,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_for(request_id).await;

        let Some(mut job) = self.get_job(request_id).await else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }

        let link = self.realtime.read().await.clone();
        if let Some(link) = &link {
            if link.has_active_subscribers(request_id).await {
                tracing::debug!(request_id, "stale-mark skipped, subscribers still active");
                job.updated_at = Utc::now();
                self.write_job(&job, None).await?;
                return Ok(false);
            }
        }

        job.status = JobStatus::DoneFailed;
        job.error = Some(ErrorRecord::new(code, "job abandoned without heartbeat"));
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        self.finalize(&job).await?;

        if let Some(link) = &link {
            link.notify_terminal(&job).await;
        }
        tracing::info!(request_id, code = %code, "job stale-marked");
        Ok(true)
    }

    // --- Typed mutations ---

    /// Transition the job's status and/or bump progress.
    ///
    /// Idempotent; refuses non-monotonic status moves and never lowers
    /// progress. Returns whether anything actually changed, so claiming
    /// `PENDING -> RUNNING` doubles as the at-most-one-pipeline gate.
    pub async fn set_status(
        &self,
        request_id: &str,
        new_status: JobStatus,
        progress: Option<u8>,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_for(request_id).await;

        let Some(mut job) = self.get_job(request_id).await else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        if !job.status.can_transition_to(new_status) {
            tracing::warn!(
                request_id,
                from = %job.status,
                to = %new_status,
                "refused non-monotonic status transition"
            );
            return Ok(false);
        }

        let next_progress = progress
            .map(|p| p.min(100))
            .map_or(job.progress, |p| p.max(job.progress));
        let unchanged = job.status == new_status && next_progress == job.progress;

        job.status = new_status;
        job.progress = next_progress;
        job.updated_at = Utc::now();
        if new_status.is_terminal() {
            job.completed_at = Some(job.updated_at);
            self.finalize(&job).await?;
        } else {
            self.write_job(&job, None).await?;
        }
        Ok(!unchanged)
    }

    /// Bump `updated_at`. No-op when the job is terminal or missing.
    pub async fn update_heartbeat(&self, request_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock_for(request_id).await;

        let Some(mut job) = self.get_job(request_id).await else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        job.updated_at = Utc::now();
        self.write_job(&job, None).await
    }

    /// Atomic transition to `DONE_SUCCESS` with the result bundle.
    pub async fn set_result(
        &self,
        request_id: &str,
        result: SearchResponse,
    ) -> Result<bool, StoreError> {
        self.terminalize(request_id, JobStatus::DoneSuccess, |job| {
            job.progress = 100;
            job.result = Some(result);
        })
        .await
    }

    /// Atomic transition to `DONE_FAILED` with the error record.
    pub async fn set_error(
        &self,
        request_id: &str,
        error: ErrorRecord,
    ) -> Result<bool, StoreError> {
        self.terminalize(request_id, JobStatus::DoneFailed, |job| {
            job.error = Some(error);
        })
        .await
    }

    /// Atomic transition to `DONE_CLARIFY` or `DONE_STOPPED` with an assist
    /// payload.
    pub async fn set_assist_outcome(
        &self,
        request_id: &str,
        status: JobStatus,
        assist: AssistPayload,
    ) -> Result<bool, StoreError> {
        debug_assert!(matches!(
            status,
            JobStatus::DoneClarify | JobStatus::DoneStopped
        ));
        self.terminalize(request_id, status, |job| {
            job.assist = Some(assist);
        })
        .await
    }

    /// Persist the pipeline's language decisions on the job.
    pub async fn set_lang_context(
        &self,
        request_id: &str,
        lang: crate::lang::LanguageContext,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_for(request_id).await;
        let Some(mut job) = self.get_job(request_id).await else {
            return Ok(());
        };
        job.lang = Some(lang);
        job.updated_at = Utc::now();
        let ttl = job.status.is_terminal().then_some(self.cfg.job_ttl);
        self.write_job(&job, ttl).await
    }

    async fn terminalize(
        &self,
        request_id: &str,
        status: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_for(request_id).await;

        let Some(mut job) = self.get_job(request_id).await else {
            return Ok(false);
        };
        // Terminal states never overwrite each other.
        if job.status.is_terminal() {
            return Ok(false);
        }

        job.status = status;
        apply(&mut job);
        job.updated_at = Utc::now();
        job.completed_at = Some(job.updated_at);
        self.finalize(&job).await?;
        Ok(true)
    }

    /// Terminal write: job and idempotency mapping both pick up the TTL.
    async fn finalize(&self, job: &Job) -> Result<(), StoreError> {
        self.write_job(job, Some(self.cfg.job_ttl)).await?;
        self.backend
            .set(
                &format!("{IDEM_PREFIX}{}", job.idempotency_key),
                serde_json::Value::String(job.request_id.clone()),
                Some(self.cfg.job_ttl),
            )
            .await
    }

    // --- Reads ---

    /// Fetch a job. Backend failures degrade to `None` with a warning.
    pub async fn get_job(&self, request_id: &str) -> Option<Job> {
        let raw = match self.backend.get(&format!("{JOB_PREFIX}{request_id}")).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "job read failed");
                return None;
            }
        };
        match serde_json::from_value(raw) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!(request_id, error = %e, "job record corrupt");
                None
            }
        }
    }

    pub async fn get_status(&self, request_id: &str) -> Option<(JobStatus, u8)> {
        self.get_job(request_id)
            .await
            .map(|j| (j.status, j.progress))
    }

    pub async fn get_result(&self, request_id: &str) -> Option<SearchResponse> {
        self.get_job(request_id).await.and_then(|j| j.result)
    }

    pub async fn delete_job(&self, request_id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock_for(request_id).await;
        if let Some(job) = self.get_job(request_id).await {
            self.backend
                .delete(&format!("{IDEM_PREFIX}{}", job.idempotency_key))
                .await?;
        }
        self.backend
            .delete(&format!("{POOL_PREFIX}{request_id}"))
            .await?;
        self.backend.delete(&format!("{JOB_PREFIX}{request_id}")).await
    }

    /// Snapshot of non-terminal jobs for the sweeper.
    pub async fn running_jobs(&self) -> Vec<Job> {
        let entries = match self.backend.scan_prefix(JOB_PREFIX).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "running-jobs scan failed");
                return Vec::new();
            }
        };
        entries
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value::<Job>(v).ok())
            .filter(|j| !j.status.is_terminal())
            .collect()
    }

    // --- Candidate pool ---

    /// Store the pre-ranking pool so refinements can re-rank without a
    /// second provider call.
    pub async fn set_candidate_pool(
        &self,
        request_id: &str,
        pool: &[Place],
    ) -> Result<(), StoreError> {
        self.backend
            .set(
                &format!("{POOL_PREFIX}{request_id}"),
                serde_json::to_value(pool)?,
                Some(self.cfg.job_ttl),
            )
            .await
    }

    pub async fn get_candidate_pool(&self, request_id: &str) -> Option<Vec<Place>> {
        let raw = match self.backend.get(&format!("{POOL_PREFIX}{request_id}")).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "candidate pool read failed");
                return None;
            }
        };
        serde_json::from_value(raw).ok()
    }

    async fn read_idem(&self, idempotency_key: &str) -> Option<String> {
        match self
            .backend
            .get(&format!("{IDEM_PREFIX}{idempotency_key}"))
            .await
        {
            Ok(Some(serde_json::Value::String(id))) => Some(id),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "idempotency read failed");
                None
            }
        }
    }

    async fn write_job(&self, job: &Job, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.backend
            .set(
                &format!("{JOB_PREFIX}{}", job.request_id),
                serde_json::to_value(job)?,
                ttl,
            )
            .await
    }

    /// Reclaim expired entries in the backing store.
    pub async fn backend_purge_expired(&self) -> Result<u64, StoreError> {
        self.backend.purge_expired().await
    }

    /// Readiness probe: can the backend answer a read at all.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.get("healthz:probe").await.map(|_| ())
    }

    /// Test-only escape hatch for aging job records.
    #[cfg(test)]
    pub(crate) async fn write_job_for_tests(&self, job: &Job) {
        self.write_job(job, None).await.expect("test write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SharedFilters;
    use pretty_assertions::assert_eq;

    fn cfg() -> DedupConfig {
        DedupConfig {
            running_max_age: Duration::from_secs(90),
            success_fresh_window: Duration::from_secs(5),
            job_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }

    fn store() -> JobStore {
        JobStore::new(Arc::new(MemoryBackend::new()), cfg())
    }

    fn request(query: &str) -> NormalizedRequest {
        NormalizedRequest {
            query: query.to_string(),
            language_hint: None,
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

    fn empty_response() -> SearchResponse {
        SearchResponse {
            results: vec![],
            groups: None,
            chips: vec![],
            assist: None,
            meta: Default::default(),
        }
    }

    struct NoSubscribers;

    #[async_trait]
    impl RealtimeLink for NoSubscribers {
        async fn has_active_subscribers(&self, _request_id: &str) -> bool {
            false
        }
        async fn notify_terminal(&self, _job: &Job) {}
    }

    struct AlwaysSubscribed;

    #[async_trait]
    impl RealtimeLink for AlwaysSubscribed {
        async fn has_active_subscribers(&self, _request_id: &str) -> bool {
            true
        }
        async fn notify_terminal(&self, _job: &Job) {}
    }

    #[tokio::test]
    async fn test_create_then_reuse_pending() {
        let store = store();
        let (job1, out1) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        assert!(!out1.reused);
        assert_eq!(out1.reason, None);

        let (job2, out2) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        assert!(out2.reused);
        assert_eq!(out2.reason, Some(ReuseReason::StatusPending));
        assert_eq!(job1.request_id, job2.request_id);
    }

    #[tokio::test]
    async fn test_reuse_fresh_success() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, Some(10))
            .await
            .unwrap();
        store
            .set_result(&job.request_id, empty_response())
            .await
            .unwrap();

        let (job2, out) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        assert!(out.reused);
        assert_eq!(out.reason, Some(ReuseReason::CachedResultAvailable));
        assert_eq!(job2.request_id, job.request_id);
        assert_eq!(job2.status, JobStatus::DoneSuccess);
    }

    #[tokio::test]
    async fn test_failed_job_spawns_new() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_error(
                &job.request_id,
                ErrorRecord::new(FailureCode::UpstreamTimeout, "boom"),
            )
            .await
            .unwrap();

        let (job2, out) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        assert!(!out.reused);
        assert_eq!(out.reason, Some(ReuseReason::PreviousJobFailed));
        assert_ne!(job2.request_id, job.request_id);
    }

    #[tokio::test]
    async fn test_stale_running_resurrection() {
        let store = store();
        store.attach_realtime(Arc::new(NoSubscribers)).await;

        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, Some(10))
            .await
            .unwrap();

        // Age the heartbeat past the max by rewriting the record directly.
        let mut aged = store.get_job(&job.request_id).await.unwrap();
        aged.updated_at = Utc::now() - chrono::Duration::seconds(100);
        store.write_job(&aged, None).await.unwrap();

        let (job2, out) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        assert!(!out.reused);
        assert_eq!(out.reason, Some(ReuseReason::StaleRunningNoHeartbeat));
        assert_ne!(job2.request_id, job.request_id);

        let prior = store.get_job(&job.request_id).await.unwrap();
        assert_eq!(prior.status, JobStatus::DoneFailed);
        assert_eq!(
            prior.error.unwrap().code,
            FailureCode::StaleRunningNoHeartbeat
        );
    }

    #[tokio::test]
    async fn test_stale_marking_skipped_with_subscribers() {
        let store = store();
        store.attach_realtime(Arc::new(AlwaysSubscribed)).await;

        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();

        let marked = store
            .mark_stale(&job.request_id, FailureCode::StaleRunningNoHeartbeat)
            .await
            .unwrap();
        assert!(!marked);
        assert_eq!(
            store.get_job(&job.request_id).await.unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_stale_marking_idempotent() {
        let store = store();
        store.attach_realtime(Arc::new(NoSubscribers)).await;

        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();

        let first = store
            .mark_stale(&job.request_id, FailureCode::StaleRunningTooOld)
            .await
            .unwrap();
        let second = store
            .mark_stale(&job.request_id, FailureCode::StaleRunningTooOld)
            .await
            .unwrap();
        assert!(first);
        assert!(!second, "second stale-mark must be a no-op");
    }

    #[tokio::test]
    async fn test_terminal_states_never_overwrite() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        assert!(store
            .set_result(&job.request_id, empty_response())
            .await
            .unwrap());
        assert!(!store
            .set_error(
                &job.request_id,
                ErrorRecord::new(FailureCode::StageError, "late failure"),
            )
            .await
            .unwrap());

        let job = store.get_job(&job.request_id).await.unwrap();
        assert_eq!(job.status, JobStatus::DoneSuccess);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, Some(40))
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, Some(25))
            .await
            .unwrap();

        let (_, progress) = store.get_status(&job.request_id).await.unwrap();
        assert_eq!(progress, 40, "progress must never decrease");
    }

    #[tokio::test]
    async fn test_backward_status_refused() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        let applied = store
            .set_status(&job.request_id, JobStatus::Pending, None)
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            store.get_job(&job.request_id).await.unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_heartbeat_noop_on_terminal() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        store
            .set_status(&job.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_result(&job.request_id, empty_response())
            .await
            .unwrap();

        let before = store.get_job(&job.request_id).await.unwrap().updated_at;
        store.update_heartbeat(&job.request_id).await.unwrap();
        let after = store.get_job(&job.request_id).await.unwrap().updated_at;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_candidate_pool_roundtrip() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();

        assert!(store.get_candidate_pool(&job.request_id).await.is_none());
        store
            .set_candidate_pool(&job.request_id, &[])
            .await
            .unwrap();
        assert_eq!(store.get_candidate_pool(&job.request_id).await, Some(vec![]));
    }

    #[tokio::test]
    async fn test_delete_job_clears_mapping() {
        let store = store();
        let (job, _) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        assert!(store.delete_job(&job.request_id).await.unwrap());
        assert!(store.get_job(&job.request_id).await.is_none());

        // The idempotency mapping is gone, so a new submission creates a
        // fresh job with no prior reason.
        let (_, out) = store
            .create_or_get(request("pizza"), "key-1", &owner())
            .await
            .unwrap();
        assert!(!out.reused);
        assert_eq!(out.reason, None);
    }

    #[tokio::test]
    async fn test_running_jobs_snapshot() {
        let store = store();
        let (a, _) = store
            .create_or_get(request("pizza"), "key-a", &owner())
            .await
            .unwrap();
        let (b, _) = store
            .create_or_get(request("sushi"), "key-b", &owner())
            .await
            .unwrap();
        store
            .set_status(&a.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_status(&b.request_id, JobStatus::Running, None)
            .await
            .unwrap();
        store.set_result(&b.request_id, empty_response()).await.unwrap();

        let running = store.running_jobs().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].request_id, a.request_id);
    }

    #[tokio::test]
    async fn test_missing_job_reads_are_none_not_errors() {
        let store = store();
        assert!(store.get_job("nope").await.is_none());
        assert!(store.get_status("nope").await.is_none());
        assert!(store.get_result("nope").await.is_none());
        assert!(!store
            .set_status("nope", JobStatus::Running, None)
            .await
            .unwrap());
    }
}
