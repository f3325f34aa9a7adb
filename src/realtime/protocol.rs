//! WebSocket wire protocol: client/server frames and close codes.

use serde::{Deserialize, Serialize};

use crate::error::FailureCode;
use crate::search::{Place, SearchResponse};
use crate::store::JobStatus;

/// Message sent by a WebSocket client to the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { request_id: String },
    Unsubscribe { request_id: String },
    Ping,
}

/// Message sent by the server to a WebSocket client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Ack {
        request_id: String,
    },
    Nack {
        request_id: String,
        reason: String,
    },
    Progress {
        request_id: String,
        stage: String,
        progress: u8,
    },
    Partial {
        request_id: String,
        results: Vec<Place>,
    },
    Terminal {
        request_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Box<SearchResponse>>,
    },
    /// Connection lifecycle only, never request-scoped.
    WsStatus {
        state: &'static str,
        ts: i64,
    },
    Error {
        code: FailureCode,
        message: String,
    },
}

impl ServerMessage {
    /// The request this frame belongs to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Ack { request_id }
            | ServerMessage::Nack { request_id, .. }
            | ServerMessage::Progress { request_id, .. }
            | ServerMessage::Partial { request_id, .. }
            | ServerMessage::Terminal { request_id, .. } => Some(request_id),
            ServerMessage::WsStatus { .. } | ServerMessage::Error { .. } => None,
        }
    }

    /// Critical frames are never dropped silently under backpressure.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerMessage::Terminal { .. }
                | ServerMessage::Partial { .. }
                | ServerMessage::Error { .. }
        )
    }

    /// Progress frames supersede each other and may be coalesced.
    pub fn is_coalescible(&self) -> bool {
        matches!(self, ServerMessage::Progress { .. })
    }
}

/// Close codes with soft/hard reconnect semantics.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server shutdown; soft, reconnect with backoff.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation; hard.
    pub const POLICY: u16 = 1008;
    /// Message too big / outbound queue overflow; hard.
    pub const TOO_BIG: u16 = 1009;
    /// Internal error (missed heartbeat); soft.
    pub const INTERNAL: u16 = 1011;
    /// Unauthorized; hard, re-auth required before reconnecting.
    pub const UNAUTHORIZED: u16 = 4401;
    /// Ticket expired; soft, fetch a fresh ticket and reconnect.
    pub const TICKET_EXPIRED: u16 = 4408;

    /// Soft closes invite a client retry with backoff; hard closes require
    /// re-authentication.
    pub fn is_soft(code: u16) -> bool {
        matches!(code, NORMAL | GOING_AWAY | INTERNAL | TICKET_EXPIRED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_client_message_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","requestId":"r-1"}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { request_id } => assert_eq!(request_id, "r-1"),
            _ => panic!("expected subscribe"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_client_message_unknown_type_fails() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"{"type":"shout"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::Progress {
            request_id: "r-1".to_string(),
            stage: "gate".to_string(),
            progress: 10,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["requestId"], "r-1");
        assert_eq!(json["progress"], 10);
    }

    #[test]
    fn test_terminal_serializes_status() {
        let msg = ServerMessage::Terminal {
            request_id: "r-1".to_string(),
            status: JobStatus::DoneFailed,
            result: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "terminal");
        assert_eq!(json["status"], "DONE_FAILED");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_criticality_classes() {
        let progress = ServerMessage::Progress {
            request_id: "r".to_string(),
            stage: "gate".to_string(),
            progress: 10,
        };
        assert!(!progress.is_critical());
        assert!(progress.is_coalescible());

        let terminal = ServerMessage::Terminal {
            request_id: "r".to_string(),
            status: JobStatus::DoneSuccess,
            result: None,
        };
        assert!(terminal.is_critical());
        assert!(!terminal.is_coalescible());
    }

    #[test]
    fn test_close_code_softness() {
        assert!(close::is_soft(close::GOING_AWAY));
        assert!(close::is_soft(close::INTERNAL));
        assert!(close::is_soft(close::TICKET_EXPIRED));
        assert!(!close::is_soft(close::UNAUTHORIZED));
        assert!(!close::is_soft(close::TOO_BIG));
        assert!(!close::is_soft(close::POLICY));
    }
}
