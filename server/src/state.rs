//! # Forwarder State
//!
//! Holds the shared application state for the forwarder:
//! - [`Snapshot`]: the published `{partner, link}` tuple every reader sees
//! - [`StateStore`]: persistence of the public state between runs
//! - [`AppState`]: the handles passed to every HTTP handler
//!
//! Only the controller writes the snapshot, and only while holding the mode
//! lock. Readers borrow the latest value from a `watch` channel, so they
//! always see a complete tuple.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use fwd_protocol::{ConnectionType, Diagnostics, State};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::FwdConfig;
use crate::control::Controller;
use crate::mode::Link;
use crate::registry::ConnectionRegistry;
use crate::relay::{self, Relay};
use crate::transport::{PartnerInbox, PartnerTransport};

/// The forwarder's process state as of the last completed transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Where WebSocket frames are forwarded. `None` drops them.
    pub partner: Option<String>,
    pub link: Link,
    /// Registry epoch the link belongs to. Inbound clients are admitted
    /// under this epoch, so an upgrade that raced a transition is refused.
    pub epoch: u64,
}

impl Snapshot {
    pub fn to_public(&self, diagnostics: Diagnostics) -> State {
        State {
            partner: self.partner.clone(),
            connection: self.link.connection_type(),
            ws_url: self.link.ws_url(),
            diagnostics,
        }
    }
}

// ─── Persistence ────────────────────────────────────────────────

/// Saves `{partner, connection, wsUrl}` as JSON so a restarted forwarder
/// picks up where it left off. Traffic is never persisted.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns `None` when nothing was saved yet.
    pub async fn load(&self) -> anyhow::Result<Option<State>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let state = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(state))
    }

    pub async fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let saved = snapshot.to_public(Diagnostics::default());
        let bytes = serde_json::to_vec_pretty(&saved)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

/// What a restored state asks the controller to re-establish.
pub fn restored_link(state: &State) -> Option<(ConnectionType, String)> {
    match (state.connection, state.ws_url.as_ref()) {
        (ConnectionType::None, _) | (_, None) => None,
        (connection, Some(url)) => Some((connection, url.clone())),
    }
}

// ─── App State ──────────────────────────────────────────────────

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    /// Applies control requests.
    pub controller: Arc<Controller>,
    /// Routes frames.
    pub relay: Arc<Relay>,
    /// Where partner frames received over HTTP are queued.
    pub inbox: PartnerInbox,
    /// This forwarder's own identity.
    pub node: Arc<str>,
}

impl AppState {
    /// Builds the forwarder and spawns its background tasks: the partner
    /// sender, the partner inbox and the reconnect supervisor.
    pub fn start(config: &FwdConfig, transport: Arc<dyn PartnerTransport>) -> Self {
        let buffer = config.relay.buffer_frames.max(1);
        let (state_tx, state_rx) = watch::channel(Snapshot::default());
        let registry = Arc::new(ConnectionRegistry::new(buffer));

        let (departures_tx, departures_rx) = mpsc::unbounded_channel();
        let (relay, to_partner) = Relay::new(state_rx, registry, buffer, departures_tx);
        let relay = Arc::new(relay);
        tokio::spawn(relay::run_partner_sender(
            relay.stats().clone(),
            to_partner,
            transport,
        ));

        let (inbox, inbox_rx) = mpsc::channel(buffer);
        tokio::spawn(relay::run_inbox(relay.clone(), inbox_rx));

        let store = config.state_file.clone().map(StateStore::new);
        let controller = Arc::new(Controller::new(
            state_tx,
            relay.clone(),
            config.relay.clone(),
            store,
        ));
        tokio::spawn(controller.clone().supervise(departures_rx));

        info!("Forwarder started as node '{}'", config.partner.node);
        Self {
            controller,
            relay,
            inbox,
            node: config.partner.node.as_str().into(),
        }
    }
}
