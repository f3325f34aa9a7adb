//! WebSocket endpoint: ticket-gated upgrade, read loop, writer task.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::auth::ticket::TicketService;
use crate::error::{AuthError, FailureCode};
use crate::realtime::connection::OutFrame;
use crate::realtime::hub::{ConnIdentity, RealtimeHub};
use crate::realtime::protocol::{ClientMessage, ServerMessage, close};

#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<RealtimeHub>,
    pub tickets: Arc<TicketService>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub ticket: Option<String>,
}

/// `GET /ws?ticket=<t>`.
///
/// The ticket is validated after the upgrade completes so the failure can be
/// reported with a proper close code (`4401` / `4408`) instead of an opaque
/// HTTP rejection the browser cannot inspect.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<WsState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.ticket))
}

async fn handle_socket(socket: WebSocket, state: WsState, ticket: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    let claims = match ticket {
        Some(ticket) => state.tickets.consume(&ticket).await,
        None => Err(AuthError::InvalidTicket),
    };
    let claims = match claims {
        Ok(claims) => claims,
        Err(e) => {
            let code = match e {
                AuthError::TicketExpired => close::TICKET_EXPIRED,
                _ => close::UNAUTHORIZED,
            };
            tracing::debug!(code, "ws upgrade rejected");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        }
    };

    let (client_id, outbound) = state.hub.register(ConnIdentity {
        session_id: claims.session_id,
        user_id: claims.user_id,
    });

    // Writer: drains the outbound queue onto the socket. Ends on the close
    // frame or on a write error (peer gone).
    let writer_outbound = outbound.clone();
    let writer = tokio::spawn(async move {
        loop {
            match writer_outbound.next().await {
                OutFrame::Message(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "unserializable server frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutFrame::Ping => {
                    if sink.send(Message::Ping(Bytes::from_static(b"hb"))).await.is_err() {
                        break;
                    }
                }
                OutFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Read loop: every inbound frame proves liveness.
    while let Some(Ok(msg)) = stream.next().await {
        state.hub.mark_alive(client_id);
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { request_id }) => {
                    if !state.hub.subscribe(client_id, &request_id).await {
                        outbound.push(ServerMessage::Nack {
                            request_id,
                            reason: "connection not registered".to_string(),
                        });
                    }
                }
                Ok(ClientMessage::Unsubscribe { request_id }) => {
                    state.hub.unsubscribe(client_id, &request_id);
                }
                Ok(ClientMessage::Ping) => {
                    // mark_alive above is the whole point of a client ping.
                }
                Err(e) => {
                    outbound.push(ServerMessage::Error {
                        code: FailureCode::ValidationError,
                        message: format!("unparseable client frame: {e}"),
                    });
                }
            },
            Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Ping(_) | Message::Binary(_) => {}
        }
    }

    state.hub.unregister(client_id);
    writer.abort();
    tracing::debug!(%client_id, "ws session ended");
}
