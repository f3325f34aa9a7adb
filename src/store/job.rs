//! Job records, the status state machine, and the dedup decision matrix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::DedupConfig;
use crate::error::{ErrorRecord, FailureCode};
use crate::lang::LanguageContext;
use crate::search::{AssistPayload, NormalizedRequest, SearchResponse};

/// Lifecycle state of a search job. Transitions only move forward; terminal
/// states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    DoneSuccess,
    DoneClarify,
    DoneStopped,
    DoneFailed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Forward-only transition check. Same-state is allowed (idempotent
    /// no-op at the store layer); anything out of a terminal state is not.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            JobStatus::Pending => true,
            JobStatus::Running => next != JobStatus::Pending,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// Durable record of one search request's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub request_id: String,
    pub idempotency_key: String,
    pub owner_session_id: String,
    pub owner_user_id: Option<String>,
    pub status: JobStatus,
    /// 0..=100, monotonically non-decreasing.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request: NormalizedRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SearchResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assist: Option<AssistPayload>,
    /// Language decisions frozen by the pipeline, used by the assistant
    /// stream after the pipeline is gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<LanguageContext>,
}

impl Job {
    pub fn new(
        request_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        owner_session_id: impl Into<String>,
        owner_user_id: Option<String>,
        request: NormalizedRequest,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.into(),
            idempotency_key: idempotency_key.into(),
            owner_session_id: owner_session_id.into(),
            owner_user_id,
            status: JobStatus::Pending,
            progress: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            request,
            result: None,
            error: None,
            assist: None,
            lang: None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn updated_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Why an existing job was (or was not) reused for a duplicate submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReuseReason {
    CachedResultAvailable,
    CachedStale,
    PreviousJobFailed,
    RunningFresh,
    StaleRunningNoHeartbeat,
    StaleRunningTooOld,
    StatusPending,
    StatusClarify,
    StatusStopped,
}

/// Outcome of the dedup matrix for one `create_or_get` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Reuse {
        reason: ReuseReason,
    },
    NewJob {
        reason: ReuseReason,
        /// When set, the prior RUNNING job must be stale-marked with this
        /// failure code before the new job is created.
        mark_stale: Option<FailureCode>,
    },
}

impl DedupDecision {
    pub fn reason(&self) -> ReuseReason {
        match self {
            DedupDecision::Reuse { reason } | DedupDecision::NewJob { reason, .. } => *reason,
        }
    }
}

/// The dedup decision matrix, as a pure function of the existing job's
/// status and ages.
///
/// Boundary semantics: an age exactly equal to `running_max_age` is fresh;
/// staleness requires strictly greater. When both the heartbeat age and the
/// total age exceed the max, the missing heartbeat wins the tie-break.
pub fn decide(
    status: JobStatus,
    age: Duration,
    updated_age: Duration,
    cfg: &DedupConfig,
) -> DedupDecision {
    match status {
        JobStatus::DoneSuccess => {
            if updated_age <= cfg.success_fresh_window {
                DedupDecision::Reuse {
                    reason: ReuseReason::CachedResultAvailable,
                }
            } else {
                DedupDecision::NewJob {
                    reason: ReuseReason::CachedStale,
                    mark_stale: None,
                }
            }
        }
        JobStatus::DoneFailed => DedupDecision::NewJob {
            reason: ReuseReason::PreviousJobFailed,
            mark_stale: None,
        },
        JobStatus::Running => {
            if updated_age > cfg.running_max_age {
                DedupDecision::NewJob {
                    reason: ReuseReason::StaleRunningNoHeartbeat,
                    mark_stale: Some(FailureCode::StaleRunningNoHeartbeat),
                }
            } else if age > cfg.running_max_age {
                DedupDecision::NewJob {
                    reason: ReuseReason::StaleRunningTooOld,
                    mark_stale: Some(FailureCode::StaleRunningTooOld),
                }
            } else {
                DedupDecision::Reuse {
                    reason: ReuseReason::RunningFresh,
                }
            }
        }
        JobStatus::Pending => DedupDecision::Reuse {
            reason: ReuseReason::StatusPending,
        },
        JobStatus::DoneClarify => DedupDecision::Reuse {
            reason: ReuseReason::StatusClarify,
        },
        JobStatus::DoneStopped => DedupDecision::Reuse {
            reason: ReuseReason::StatusStopped,
        },
    }
}
