//! Realtime fan-out: WebSocket subscriptions, backlog replay, heartbeats.

pub mod backlog;
pub mod connection;
pub mod hub;
pub mod protocol;
pub mod ws;

pub use connection::{OutFrame, Outbound, PushOutcome};
pub use hub::{ConnIdentity, RealtimeHub, spawn_heartbeat};
pub use protocol::{ClientMessage, ServerMessage, close};
pub use ws::{WsState, ws_handler};
