//! # Forwarder Control Protocol
//!
//! JSON types exchanged with a forwarder over its `/api` control endpoint.
//! Requests use serde's externally-tagged representation, so each request is
//! a single-key object such as `{"SetPartner": "alice.os"}` or
//! `{"Disconnect": null}`.

use serde::{Deserialize, Serialize};

/// A request accepted by `PUT /api`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    // ── Control ───────────────────────────────────────────────────

    /// Set (or clear, with `null`) the partner identity frames are
    /// forwarded to.
    SetPartner(Option<String>),

    /// Dial out to a WebSocket server (`ws://` or `wss://` URL).
    ConnectToServer(String),

    /// Accept inbound WebSocket clients on an endpoint: either a path on
    /// the control listener (`/ws`) or `host:port[/path]`.
    AcceptClients(String),

    /// Close every WebSocket connection and return to idle.
    Disconnect,

    /// Read the current state.
    GetState,

    // ── Relay ─────────────────────────────────────────────────────

    /// A payload sent by the partner, to be relayed to the WebSocket side.
    Forward(String),
}

/// Connection mode as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    None,
    /// This process dialed out and acts as a WebSocket client.
    ToWsServer,
    /// This process accepts inbound WebSocket clients.
    ToWsClient,
}

/// Public state returned by `GET /api` and by every successful control
/// request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub partner: Option<String>,
    pub connection: ConnectionType,
    pub ws_url: Option<String>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

/// Relay counters. Forwarding problems are never reported as request
/// failures; they accumulate here instead.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    /// Number of currently open WebSocket connections.
    pub open_connections: usize,
    /// Frames dropped because no destination existed (no partner, no open
    /// connection, or idle mode).
    pub no_active_connection: u64,
    /// Frames dropped from a full buffer, oldest first.
    pub overflow_dropped: u64,
    /// Partner messages rejected because they came from someone other than
    /// the configured partner.
    pub foreign_sender: u64,
    /// Partner deliveries the transport failed to complete.
    pub transport_failed: u64,
    /// Connections forcibly dropped after the close timeout.
    pub close_timeouts: u64,
}

/// Body returned with a failed control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
}
