//! One-time WebSocket tickets.
//!
//! Browsers cannot attach headers to a WebSocket upgrade, so an
//! authenticated client first exchanges its session for a short-lived
//! ticket and presents it in the URL. Tickets are random, stored
//! server-side, consumed on first use, and distinguish "expired" from
//! "never existed" so the client knows whether to re-auth or just retry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::error::AuthError;
use crate::store::KvBackend;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketClaims {
    pub session_id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct TicketService {
    kv: Arc<dyn KvBackend>,
    ttl: std::time::Duration,
}

impl TicketService {
    pub fn new(kv: Arc<dyn KvBackend>, ttl: std::time::Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Issue a ticket bound to the caller's identity.
    pub async fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        let ticket = generate_ticket();
        let claims = TicketClaims {
            session_id: identity.session_id.clone(),
            user_id: identity.user_id.clone(),
            created_at: Utc::now(),
        };
        // Stored for twice the logical TTL so an expired ticket can still
        // be recognized as expired rather than unknown.
        self.kv
            .set(
                &format!("ws_ticket:{ticket}"),
                serde_json::to_value(&claims).map_err(|_| AuthError::InvalidTicket)?,
                Some(self.ttl * 2),
            )
            .await
            .map_err(|e| AuthError::SessionStoreUnavailable {
                reason: e.to_string(),
            })?;
        Ok(ticket)
    }

    /// Consume a ticket: valid at most once, and only within the TTL.
    pub async fn consume(&self, ticket: &str) -> Result<TicketClaims, AuthError> {
        let key = format!("ws_ticket:{ticket}");
        let raw = self
            .kv
            .get(&key)
            .await
            .map_err(|e| AuthError::SessionStoreUnavailable {
                reason: e.to_string(),
            })?
            .ok_or(AuthError::InvalidTicket)?;

        // Consumed-once: delete before honoring.
        let _ = self.kv.delete(&key).await;

        let claims: TicketClaims =
            serde_json::from_value(raw).map_err(|_| AuthError::InvalidTicket)?;
        let age = Utc::now() - claims.created_at;
        if age.to_std().unwrap_or_default() > self.ttl {
            return Err(AuthError::TicketExpired);
        }
        Ok(claims)
    }
}

/// 32 random bytes, hex-encoded.
fn generate_ticket() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
