//! # WebSocket Handlers
//!
//! Socket-level plumbing for both connection roles:
//! - Accepting inbound clients on the control listener or a dedicated one
//! - Dialing out to a WebSocket server
//! - Running the pump task that moves frames between a socket and the relay
//!
//! Both roles end up in the same [`pump`], which only needs the socket to be
//! a `Stream + Sink` of some [`WsFrame`] type.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{self, rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{FwdError, FwdResult};
use crate::mode::Surface;
use crate::queue::BoundedReceiver;
use crate::registry::{Admission, ConnectionId, Frame, Role};
use crate::relay::{DropReason, Relay};

/// An outbound connection produced by [`dial`].
pub type ServerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Frame Abstraction ──────────────────────────────────────────

/// What the pump cares about in an incoming message.
pub enum Incoming {
    Text(Frame),
    Close,
    /// Binary, ping and pong frames are not relayed.
    Other,
}

/// Message types the pump can drive. Implemented for both axum's server
/// messages and tungstenite's client messages.
pub trait WsFrame: Sized + Send + 'static {
    fn text(payload: Frame) -> Self;
    fn close() -> Self;
    fn into_incoming(self) -> Incoming;
}

impl WsFrame for ws::Message {
    fn text(payload: Frame) -> Self {
        ws::Message::Text(payload.into())
    }

    fn close() -> Self {
        ws::Message::Close(None)
    }

    fn into_incoming(self) -> Incoming {
        match self {
            ws::Message::Text(text) => Incoming::Text(text.as_str().to_owned()),
            ws::Message::Close(_) => Incoming::Close,
            _ => Incoming::Other,
        }
    }
}

impl WsFrame for tungstenite::Message {
    fn text(payload: Frame) -> Self {
        tungstenite::Message::Text(payload.into())
    }

    fn close() -> Self {
        tungstenite::Message::Close(None)
    }

    fn into_incoming(self) -> Incoming {
        match self {
            tungstenite::Message::Text(text) => Incoming::Text(text.as_str().to_owned()),
            tungstenite::Message::Close(_) => Incoming::Close,
            _ => Incoming::Other,
        }
    }
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Starts the pump task for an admitted socket and marks it `Open`.
///
/// Returns `false` if the admission was superseded by a teardown; the socket
/// is then closed without relaying anything.
pub fn spawn_connection<S, M, E>(relay: &Arc<Relay>, mut admission: Admission, socket: S) -> bool
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + Unpin + 'static,
    M: WsFrame,
    E: Display + Send + 'static,
{
    let Some(outbox) = admission.take_outbox() else {
        return false;
    };
    let id = admission.id();
    let cancel = admission.cancel_token();
    let (ready_tx, ready_rx) = oneshot::channel();

    let task = tokio::spawn(pump(socket, id, relay.clone(), outbox, cancel, ready_rx));
    if admission.attach(task) {
        let _ = ready_tx.send(());
        true
    } else {
        debug!("Connection {} superseded before it opened", id);
        false
    }
}

/// Moves frames between one socket and the relay until either side closes
/// or the registry asks for a close.
///
/// ## Flow:
/// 1. Wait until the registry has marked the connection `Open`
/// 2. Writer: drain the outbox into the socket
/// 3. Reader: hand each text frame to the relay
/// 4. When either half stops, or `cancel` fires, send a close frame and
///    unregister
async fn pump<S, M, E>(
    socket: S,
    id: ConnectionId,
    relay: Arc<Relay>,
    mut outbox: BoundedReceiver<Frame>,
    cancel: CancellationToken,
    ready: oneshot::Receiver<()>,
) where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + Unpin + 'static,
    M: WsFrame,
    E: Display + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();

    if ready.await.is_err() {
        let _ = sink.send(M::close()).await;
        return;
    }

    // Stops both halves; a child so that a peer-initiated close does not
    // look like a requested one.
    let closing = cancel.child_token();

    // ── Writer ──
    let writer = async {
        loop {
            tokio::select! {
                biased;
                _ = closing.cancelled() => break,
                frame = outbox.recv() => match frame {
                    Ok(payload) => {
                        if sink.send(M::text(payload)).await.is_err() {
                            break; // Socket closed; stop sending
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Connection {} is slow; dropped {} oldest frame(s)", id, n);
                        relay.stats().record(DropReason::Overflow, n);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        closing.cancel();
        let _ = sink.send(M::close()).await;
        let _ = sink.close().await;
    };

    // ── Reader ──
    let reader = async {
        loop {
            tokio::select! {
                biased;
                _ = closing.cancelled() => break,
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => match msg.into_incoming() {
                        Incoming::Text(payload) => {
                            relay.from_websocket(id, payload);
                        }
                        Incoming::Close => break,
                        Incoming::Other => {}
                    },
                    Some(Err(e)) => {
                        debug!("Connection {} read error: {}", id, e);
                        break;
                    }
                    None => break,
                },
            }
        }
        closing.cancel();
    };

    tokio::join!(writer, reader);
    relay.connection_closed(id);
}

// ─── Outbound ───────────────────────────────────────────────────

/// Dials a WebSocket server, giving up after `timeout`.
pub async fn dial(url: &Url, timeout: Duration) -> FwdResult<ServerSocket> {
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(FwdError::ConnectFailed(format!("{url}: {e}"))),
        Err(_) => Err(FwdError::ConnectFailed(format!(
            "{url}: timed out after {timeout:?}"
        ))),
    }
}

// ─── Inbound ────────────────────────────────────────────────────

/// State for the inbound upgrade handler: the relay, plus which listener
/// the handler is mounted on.
#[derive(Clone)]
pub struct AcceptState {
    pub relay: Arc<Relay>,
    pub surface: Surface,
}

/// A router that upgrades any request matching the current accept endpoint.
pub fn accept_router(state: AcceptState) -> Router {
    Router::new().fallback(accept_handler).with_state(state)
}

/// Upgrades an inbound client when the forwarder accepts clients on this
/// path; everything else is a 404.
async fn accept_handler(
    State(state): State<AcceptState>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let snapshot = state.relay.snapshot();
    if !snapshot.link.accepts(state.surface, uri.path()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let relay = state.relay;
    let epoch = snapshot.epoch;
    ws.on_upgrade(move |socket| async move {
        match relay.registry().admit(Role::Inbound, epoch) {
            Ok(admission) => {
                info!("WebSocket client connected: {}", admission.id());
                spawn_connection(&relay, admission, socket);
            }
            Err(e) => warn!("Rejecting WebSocket client: {}", e),
        }
    })
}

/// A dedicated accept listener bound by `AcceptClients("host:port/path")`.
pub struct Listener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    pub async fn bind(relay: Arc<Relay>, addr: SocketAddr) -> FwdResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FwdError::BindFailed(format!("{addr}: {e}")))?;

        let app = accept_router(AcceptState {
            relay,
            surface: Surface::Dedicated(addr),
        });
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                error!("Accept listener on {} failed: {}", addr, e);
            }
        });

        info!("Accepting WebSocket clients on {}", addr);
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting. Gives the server `timeout` to wind down.
    pub async fn stop(mut self, timeout: Duration) {
        self.shutdown.cancel();
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            self.task.abort();
        }
        info!("Stopped accepting on {}", self.addr);
    }
}
