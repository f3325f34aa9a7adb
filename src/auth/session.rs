//! Session bootstrap, cookie resolution, and JWT bearer acceptance.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::{Identity, sign_value, verify_value};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::store::KvBackend;

const COOKIE_NAME: &str = "session";

/// Claims accepted on bearer tokens. `sub` identifies the user; an optional
/// `sid` pins the token to a session.
#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default)]
    sid: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

pub struct SessionService {
    kv: Arc<dyn KvBackend>,
    cfg: AuthConfig,
}

impl SessionService {
    pub fn new(kv: Arc<dyn KvBackend>, cfg: AuthConfig) -> Self {
        Self { kv, cfg }
    }

    /// Create a fresh session and return `(session_id, Set-Cookie value)`.
    pub async fn bootstrap(&self) -> Result<(String, String), AuthError> {
        let session_id = Uuid::new_v4().to_string();
        self.kv
            .set(
                &format!("session:{session_id}"),
                serde_json::json!({"createdAt": Utc::now().to_rfc3339()}),
                Some(self.cfg.session_ttl),
            )
            .await
            .map_err(|e| AuthError::SessionStoreUnavailable {
                reason: e.to_string(),
            })?;

        Ok((session_id.clone(), self.cookie_for(&session_id)))
    }

    fn cookie_for(&self, session_id: &str) -> String {
        let signed = sign_value(
            self.cfg.cookie_secret.expose_secret().as_bytes(),
            session_id,
        );
        let mut cookie = format!(
            "{COOKIE_NAME}={signed}; HttpOnly; Path=/; SameSite={}; Max-Age={}",
            self.cfg.cookie_same_site,
            self.cfg.session_ttl.as_secs(),
        );
        if let Some(domain) = &self.cfg.cookie_domain {
            cookie.push_str(&format!("; Domain={domain}"));
        }
        if self.cfg.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Resolve the caller: signed cookie first, then bearer JWT.
    ///
    /// Cookie sessions are validated against the session store and their
    /// sliding TTL refreshed. A store outage is reported as its own error
    /// (503), never as a silent 401.
    pub async fn resolve_identity(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        if let Some(session_id) = self.session_from_cookie(headers) {
            let key = format!("session:{session_id}");
            let record = self.kv.get(&key).await.map_err(|e| {
                AuthError::SessionStoreUnavailable {
                    reason: e.to_string(),
                }
            })?;
            let Some(record) = record else {
                return Err(AuthError::Unauthorized);
            };
            // Sliding TTL.
            if let Err(e) = self.kv.set(&key, record, Some(self.cfg.session_ttl)).await {
                tracing::warn!(error = %e, "session TTL refresh failed");
            }
            return Ok(Identity {
                session_id,
                user_id: None,
            });
        }

        if let Some(identity) = self.identity_from_bearer(headers) {
            return Ok(identity);
        }

        Err(AuthError::Unauthorized)
    }

    fn session_from_cookie(&self, headers: &HeaderMap) -> Option<String> {
        let cookies = headers.get("cookie")?.to_str().ok()?;
        let signed = cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == COOKIE_NAME).then(|| value.to_string())
        })?;
        verify_value(self.cfg.cookie_secret.expose_secret().as_bytes(), &signed)
    }

    fn identity_from_bearer(&self, headers: &HeaderMap) -> Option<Identity> {
        let token = headers
            .get("authorization")?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;

        let key = DecodingKey::from_secret(self.cfg.jwt_secret.expose_secret().as_bytes());
        let validation = Validation::new(Algorithm::HS256);
        let claims = jsonwebtoken::decode::<JwtClaims>(token, &key, &validation)
            .map_err(|e| tracing::debug!(error = %e, "bearer token rejected"))
            .ok()?
            .claims;

        Some(Identity {
            session_id: claims
                .sid
                .unwrap_or_else(|| format!("user:{}", claims.sub)),
            user_id: Some(claims.sub),
        })
    }
}
