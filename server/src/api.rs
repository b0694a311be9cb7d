//! # Control API
//!
//! HTTP endpoints of the forwarder:
//! - `GET  /api`        — current state
//! - `PUT  /api`        — a control request, or a `Forward` from a partner
//! - `GET  /api/events` — WebSocket pushing the state after every transition

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use fwd_protocol::{Request, State as PublicState};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FwdError, FwdResult};
use crate::state::AppState;
use crate::transport::{PartnerMessage, NODE_HEADER};

/// `GET /api`
pub async fn get_state(State(app): State<AppState>) -> Json<PublicState> {
    Json(app.controller.state())
}

/// `PUT /api`: control requests answer with the resulting state. A
/// `Forward` is queued for the relay and answered with `202 Accepted`; the
/// sender is named by the `x-fwd-node` header.
pub async fn put_request(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> FwdResult<Response> {
    let request: Request = serde_json::from_slice(&body)
        .map_err(|e| FwdError::BadRequest(format!("unrecognized request: {e}")))?;

    match request {
        Request::Forward(payload) => {
            let source = headers
                .get(NODE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .unwrap_or_else(|| app.node.to_string());
            debug!("Forward from {} ({} bytes)", source, payload.len());
            app.inbox
                .send(PartnerMessage { source, payload })
                .await
                .map_err(|_| FwdError::Internal(anyhow::anyhow!("relay inbox closed")))?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
        request => {
            let state = app.controller.handle(request).await?;
            Ok(Json(state).into_response())
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────

/// `GET /api/events`: upgrades to a WebSocket that receives the state as
/// JSON once on connect and again after every change.
pub async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, app))
}

async fn handle_events_socket(socket: WebSocket, app: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let sub_id = Uuid::new_v4();
    let mut changes = app.controller.subscribe();
    info!("Events subscriber {} connected", sub_id);

    // State → WebSocket
    let send_task = tokio::spawn(async move {
        loop {
            changes.borrow_and_update();
            let Ok(json) = serde_json::to_string(&app.controller.state()) else {
                break;
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
            if changes.changed().await.is_err() {
                break;
            }
        }
    });

    // Only listen for close
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    info!("Events subscriber {} disconnected", sub_id);
}
