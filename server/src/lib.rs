//! # fwd-ws
//!
//! A WebSocket forwarder. Frames from one configured partner are relayed to
//! the WebSocket side, and frames from the WebSocket side are relayed back to
//! the partner. The WebSocket side is either one outbound connection to a
//! server or any number of inbound clients.
//!
//! ## Layout:
//! - [`mode`]: the link modes and argument validation
//! - [`registry`]: live connections and the epoch gate
//! - [`queue`]: bounded drop-oldest frame queues
//! - [`relay`]: frame routing and drop accounting
//! - [`control`]: mode transitions and reconnect
//! - [`handlers`]: WebSocket sockets, dialing and accept listeners
//! - [`transport`]: how partners are reached
//! - [`api`]: the HTTP control surface

pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod handlers;
pub mod mode;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod state;
pub mod transport;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use config::FwdConfig;
pub use control::Controller;
pub use error::{FwdError, FwdResult};
pub use state::AppState;

use handlers::{accept_router, AcceptState};
use mode::{Surface, API_PATH};

/// The control listener's router. Anything outside the API falls through
/// to the inbound-client upgrade handler.
pub fn router(app: AppState) -> Router {
    let accept = accept_router(AcceptState {
        relay: app.relay.clone(),
        surface: Surface::Control,
    });

    Router::new()
        .route(API_PATH, get(api::get_state).put(api::put_request))
        .route(&format!("{API_PATH}/events"), get(api::events_ws_handler))
        .fallback_service(accept)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}
