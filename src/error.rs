//! Error types shared across the crate.
//!
//! Each subsystem has its own `thiserror` enum; everything the client may
//! ever see is funneled through [`FailureCode`], a closed taxonomy of
//! machine-readable codes. Raw upstream error text never leaves the process.

use serde::{Deserialize, Serialize};

/// Machine-readable failure taxonomy.
///
/// These codes are persisted on failed jobs, published in terminal WebSocket
/// frames, and localized by the assistant stream. They are the only error
/// vocabulary the client is allowed to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    // Input
    ValidationError,
    LocationRequired,
    Unauthorized,
    // Dedup / state
    StaleRunningNoHeartbeat,
    StaleRunningTooOld,
    PreviousJobFailed,
    // Language
    LangEnforcementViolation,
    // Upstream
    UpstreamTimeout,
    DnsFail,
    HttpError,
    NetworkError,
    RateLimited,
    // Pipeline
    PipelineTimeout,
    StageError,
    ProviderZeroResults,
    // Infra
    StoreUnavailable,
    SessionStoreUnavailable,
}

impl FailureCode {
    /// Whether a client retry of the same request may succeed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            FailureCode::UpstreamTimeout
                | FailureCode::DnsFail
                | FailureCode::NetworkError
                | FailureCode::RateLimited
                | FailureCode::PipelineTimeout
                | FailureCode::StoreUnavailable
                | FailureCode::SessionStoreUnavailable
        )
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serialize through serde so logs and wire agree on the spelling.
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// Error record persisted on a failed job and shipped in terminal frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: FailureCode,
    pub message: String,
    pub retryable: bool,
}

impl ErrorRecord {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
        }
    }
}

/// Job store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Unavailable {
            reason: e.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Unavailable {
            reason: e.to_string(),
        }
    }
}

/// Authentication and session errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("session store unavailable: {reason}")]
    SessionStoreUnavailable { reason: String },

    #[error("ws ticket invalid or already consumed")]
    InvalidTicket,

    #[error("ws ticket expired")]
    TicketExpired,
}

/// Places provider errors, one variant per wire condition.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("dns preflight failed for {host}")]
    Dns { host: String },

    #[error("provider call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("provider call aborted by caller")]
    Abort,

    #[error("provider returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("network error: {reason}")]
    Network { reason: String },
}

impl ProviderError {
    /// Map the transport-level error onto the domain failure taxonomy.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            ProviderError::Dns { .. } => FailureCode::DnsFail,
            ProviderError::Timeout { .. } => FailureCode::UpstreamTimeout,
            ProviderError::Abort => FailureCode::StageError,
            ProviderError::Http { status, .. } => match status {
                429 => FailureCode::RateLimited,
                500..=599 => FailureCode::UpstreamTimeout,
                400..=499 => FailureCode::ValidationError,
                _ => FailureCode::HttpError,
            },
            ProviderError::Network { .. } => FailureCode::NetworkError,
        }
    }

    /// Transient errors are worth retrying within the backoff budget.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } | ProviderError::Network { .. } => true,
            ProviderError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            ProviderError::Dns { .. } | ProviderError::Abort => false,
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM auth failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("LLM request failed for provider {provider}: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("LLM rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("LLM returned an invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("LLM call timed out after {ms}ms")]
    Timeout { ms: u64 },
}

/// Pipeline stage errors, tagged with the stage that raised them.
#[derive(Debug, thiserror::Error)]
#[error("stage {stage} failed: {code}: {message}")]
pub struct StageError {
    pub stage: &'static str,
    pub code: FailureCode,
    pub message: String,
}

impl StageError {
    pub fn new(stage: &'static str, code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
        }
    }

    pub fn timeout(stage: &'static str, ms: u64) -> Self {
        Self::new(
            stage,
            FailureCode::UpstreamTimeout,
            format!("stage deadline of {ms}ms exceeded"),
        )
    }

    pub fn into_record(self) -> ErrorRecord {
        ErrorRecord::new(self.code, format!("[{}] {}", self.stage, self.message))
    }
}

impl From<LlmError> for StageError {
    fn from(e: LlmError) -> Self {
        let code = match &e {
            LlmError::RateLimited { .. } => FailureCode::RateLimited,
            LlmError::Timeout { .. } => FailureCode::UpstreamTimeout,
            _ => FailureCode::StageError,
        };
        StageError::new("llm", code, e.to_string())
    }
}
