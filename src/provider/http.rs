//! Fetch-with-timeout and retry plumbing for outbound provider calls.
//!
//! Every call races three futures: the HTTP request, the per-call deadline,
//! and the request-scoped cancel token. Dropping the race arms releases the
//! timer on every exit path. An optional DNS preflight with its own small
//! budget turns resolver outages into a distinct `DNS_FAIL` instead of a
//! generic timeout.

use std::future::Future;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub dns_preflight: bool,
    pub dns_preflight_timeout: Duration,
}

/// Execute a prepared request and parse the JSON body.
pub async fn fetch_json(
    request: reqwest::RequestBuilder,
    host: &str,
    cfg: &FetchConfig,
    cancel: &CancelToken,
) -> Result<serde_json::Value, ProviderError> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Abort);
    }

    if cfg.dns_preflight {
        dns_preflight(host, cfg.dns_preflight_timeout).await?;
    }

    let timeout_ms = cfg.timeout.as_millis() as u64;
    let response = tokio::select! {
        result = request.send() => result.map_err(|e| classify_reqwest(e, timeout_ms))?,
        _ = tokio::time::sleep(cfg.timeout) => return Err(ProviderError::Timeout { ms: timeout_ms }),
        _ = cancel.cancelled() => return Err(ProviderError::Abort),
    };

    let status = response.status();
    let body = tokio::select! {
        body = response.text() => body.unwrap_or_default(),
        _ = tokio::time::sleep(cfg.timeout) => return Err(ProviderError::Timeout { ms: timeout_ms }),
        _ = cancel.cancelled() => return Err(ProviderError::Abort),
    };

    if !status.is_success() {
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body: truncate(&body, 512),
        });
    }

    serde_json::from_str(&body).map_err(|e| ProviderError::Network {
        reason: format!("unparseable body: {e}"),
    })
}

async fn dns_preflight(host: &str, budget: Duration) -> Result<(), ProviderError> {
    let lookup = tokio::net::lookup_host((host, 443));
    match tokio::time::timeout(budget, lookup).await {
        Ok(Ok(mut addrs)) => {
            if addrs.next().is_some() {
                Ok(())
            } else {
                Err(ProviderError::Dns {
                    host: host.to_string(),
                })
            }
        }
        Ok(Err(_)) | Err(_) => Err(ProviderError::Dns {
            host: host.to_string(),
        }),
    }
}

fn classify_reqwest(e: reqwest::Error, timeout_ms: u64) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { ms: timeout_ms }
    } else {
        ProviderError::Network {
            reason: e.to_string(),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Retry `op` up to `attempts` times on transient errors.
///
/// `backoff[n]` is the wait before attempt `n`; a shorter vector repeats its
/// last entry. Non-transient errors and cancellation end the loop at once.
pub async fn with_retry<T, F, Fut>(
    attempts: u32,
    backoff: &[Duration],
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = attempts.max(1);
    let mut last = ProviderError::Abort;

    for attempt in 0..attempts {
        let delay = backoff
            .get(attempt as usize)
            .or(backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO);
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ProviderError::Abort),
            }
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let retry = e.is_transient() && attempt + 1 < attempts;
                tracing::debug!(attempt, error = %e, retry, "provider attempt failed");
                if !retry {
                    return Err(e);
                }
                last = e;
            }
        }
    }
    Err(last)
}
