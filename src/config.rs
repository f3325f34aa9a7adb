//! Environment-driven configuration.
//!
//! All tunables are read once at startup into a [`Config`] tree. Values and
//! defaults follow the deployment contract: dedup windows, heartbeat cadence,
//! provider budgets and retry vectors are environment variables, secrets are
//! wrapped in `secrecy` so they never end up in logs.

use std::time::Duration;

use secrecy::SecretString;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub dedup: DedupConfig,
    pub realtime: RealtimeConfig,
    pub assistant: AssistantConfig,
    pub provider: ProviderConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub ranking: RankingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub cookie_secret: SecretString,
    pub jwt_secret: SecretString,
    pub cookie_same_site: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    /// Session record sliding TTL (7 days).
    pub session_ttl: Duration,
    /// One-time WebSocket ticket TTL.
    pub ws_ticket_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection string. `None` selects the in-memory backend.
    pub url: Option<SecretString>,
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// A RUNNING job older than this (by heartbeat or by creation) is stale.
    pub running_max_age: Duration,
    /// A DONE_SUCCESS job younger than this is returned verbatim.
    pub success_fresh_window: Duration,
    /// Terminal jobs expire after this TTL.
    pub job_ttl: Duration,
    /// Cadence of the staleness/TTL sweeper.
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub heartbeat_interval: Duration,
    pub outbound_queue_max: usize,
    /// How long a subscription to a not-yet-existing request is held.
    pub pending_subscription_ttl: Duration,
    /// Backlog ring capacity per request.
    pub backlog_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub text_search_timeout: Duration,
    pub nearby_timeout: Duration,
    pub find_place_timeout: Duration,
    pub geocode_timeout: Duration,
    pub retry_attempts: u32,
    /// Backoff before each retry attempt, in order. Shorter than the attempt
    /// count means the last entry repeats.
    pub retry_backoff: Vec<Duration>,
    pub dns_preflight: bool,
    pub dns_preflight_timeout: Duration,
    pub page_size_max: usize,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub total_deadline: Duration,
    pub gate_timeout: Duration,
    pub intent_timeout: Duration,
    pub route_timeout: Duration,
    pub post_filter_timeout: Duration,
    pub rank_timeout: Duration,
    /// Assistant assembly may be skipped when little of the total deadline
    /// remains.
    pub assistant_min_remaining: Duration,
    pub default_region: String,
}

#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// OPEN_NOW with unknown hours: keep (default) or drop.
    pub keep_unknown_open_state: bool,
    /// Post-filter output below this triggers the relax policy.
    pub min_acceptable_results: usize,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Call after `dotenvy::dotenv()`. Fails fast on missing secrets or
    /// unparseable numbers rather than limping along with half a config.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            server: ServerConfig {
                host: env_or("HOST", "127.0.0.1"),
                port: env_parse("PORT", 8080)?,
            },
            auth: AuthConfig {
                cookie_secret: require_secret("SESSION_COOKIE_SECRET")?,
                jwt_secret: require_secret("JWT_SECRET")?,
                cookie_same_site: env_or("COOKIE_SAMESITE", "Lax"),
                cookie_domain: std::env::var("COOKIE_DOMAIN").ok(),
                cookie_secure: env_parse("COOKIE_SECURE", false)?,
                session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
                ws_ticket_ttl: Duration::from_secs(env_parse("WS_TICKET_TTL_SECS", 60)?),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
                pool_size: env_parse("DATABASE_POOL_SIZE", 8)?,
            },
            dedup: DedupConfig {
                running_max_age: env_ms("DEDUP_RUNNING_MAX_AGE_MS", 90_000)?,
                success_fresh_window: env_ms("DEDUP_SUCCESS_FRESH_WINDOW_MS", 5_000)?,
                job_ttl: env_ms("JOB_TTL_MS", 300_000)?,
                sweep_interval: env_ms("JOB_SWEEP_INTERVAL_MS", 30_000)?,
            },
            realtime: RealtimeConfig {
                heartbeat_interval: env_ms("WS_HEARTBEAT_INTERVAL_MS", 30_000)?,
                outbound_queue_max: env_parse("WS_OUTBOUND_QUEUE_MAX", 256)?,
                pending_subscription_ttl: env_ms("WS_PENDING_SUBSCRIPTION_TTL_MS", 60_000)?,
                backlog_capacity: env_parse("WS_BACKLOG_CAPACITY", 128)?,
            },
            assistant: AssistantConfig {
                poll_interval: env_ms("ASSISTANT_SSE_POLL_INTERVAL_MS", 400)?,
                timeout: env_ms("ASSISTANT_SSE_TIMEOUT_MS", 20_000)?,
            },
            provider: ProviderConfig {
                base_url: env_or("PROVIDER_BASE_URL", "https://maps.googleapis.com"),
                api_key: require_secret("PROVIDER_API_KEY")?,
                text_search_timeout: env_ms("PROVIDER_TEXTSEARCH_TIMEOUT_MS", 8_000)?,
                nearby_timeout: env_ms("PROVIDER_NEARBY_TIMEOUT_MS", 8_000)?,
                find_place_timeout: env_ms("PROVIDER_FINDPLACE_TIMEOUT_MS", 5_000)?,
                geocode_timeout: env_ms("PROVIDER_GEOCODE_TIMEOUT_MS", 5_000)?,
                retry_attempts: env_parse("PROVIDER_RETRY_ATTEMPTS", 3)?,
                retry_backoff: env_backoff("PROVIDER_RETRY_BACKOFF_MS", &[0, 300])?,
                dns_preflight: env_parse("PROVIDER_DNS_PREFLIGHT", true)?,
                dns_preflight_timeout: Duration::from_millis(1_500),
                page_size_max: env_parse("PROVIDER_PAGE_SIZE_MAX", 20)?,
            },
            llm: LlmConfig {
                base_url: env_or("LLM_BASE_URL", "https://api.openai.com"),
                api_key: require_secret("LLM_API_KEY")?,
                model: env_or("LLM_MODEL", "gpt-4o-mini"),
                timeout: env_ms("LLM_TIMEOUT_MS", 10_000)?,
            },
            pipeline: PipelineConfig {
                total_deadline: env_ms("PIPELINE_TOTAL_DEADLINE_MS", 20_000)?,
                gate_timeout: env_ms("PIPELINE_GATE_TIMEOUT_MS", 4_000)?,
                intent_timeout: env_ms("PIPELINE_INTENT_TIMEOUT_MS", 5_000)?,
                route_timeout: env_ms("PIPELINE_ROUTE_TIMEOUT_MS", 500)?,
                post_filter_timeout: env_ms("PIPELINE_POST_FILTER_TIMEOUT_MS", 500)?,
                rank_timeout: env_ms("PIPELINE_RANK_TIMEOUT_MS", 1_000)?,
                assistant_min_remaining: env_ms("PIPELINE_ASSISTANT_MIN_REMAINING_MS", 1_000)?,
                default_region: env_or("DEFAULT_REGION", "IL"),
            },
            ranking: RankingConfig {
                keep_unknown_open_state: env_parse("FILTER_KEEP_UNKNOWN_OPEN", true)?,
                min_acceptable_results: env_parse("FILTER_MIN_ACCEPTABLE_RESULTS", 3)?,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn require_secret(key: &str) -> anyhow::Result<SecretString> {
    std::env::var(key)
        .map(SecretString::from)
        .map_err(|_| anyhow::anyhow!("required environment variable {key} is not set"))
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_ms(key: &str, default_ms: u64) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(env_parse(key, default_ms)?))
}

/// Parse a comma-separated backoff vector, e.g. `"0,300"`.
fn env_backoff(key: &str, default_ms: &[u64]) -> anyhow::Result<Vec<Duration>> {
    let raw = match std::env::var(key) {
        Ok(raw) => raw,
        Err(_) => {
            return Ok(default_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect());
        }
    };

    let parsed: Result<Vec<u64>, _> = raw
        .trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(|part| part.trim().parse::<u64>())
        .collect();

    let values = parsed.map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))?;
    if values.is_empty() {
        anyhow::bail!("{key} must contain at least one entry");
    }
    Ok(values.into_iter().map(Duration::from_millis).collect())
}
