//! # Controller
//!
//! Applies control requests as mode transitions. All transitions are
//! serialized by the mode lock, which is held for the whole transition
//! (dial or bind, teardown, publish) and never while forwarding.
//!
//! Failure never leaves the forwarder half-transitioned: dials and binds
//! happen *before* the old connections are torn down, so a failed
//! `ConnectToServer` or `AcceptClients` leaves state and connections exactly
//! as they were.

use std::sync::Arc;
use std::time::Duration;

use fwd_protocol::{ConnectionType, Request, State};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::error::{FwdError, FwdResult};
use crate::handlers::{dial, spawn_connection, Listener};
use crate::mode::{parse_server_url, AcceptEndpoint, Link};
use crate::registry::{ConnectionId, Departure, Role};
use crate::relay::{DropReason, Relay};
use crate::state::{restored_link, Snapshot, StateStore};

/// Resources owned by the current mode besides its connections.
#[derive(Default)]
struct ModeResources {
    /// Dedicated accept listener (`ToWsClient` on `host:port`).
    listener: Option<Listener>,
    /// Pending re-dial of a lost outbound connection (`ToWsServer`).
    reconnect: Option<JoinHandle<()>>,
}

pub struct Controller {
    /// The mode lock.
    resources: Mutex<ModeResources>,
    state: watch::Sender<Snapshot>,
    relay: Arc<Relay>,
    config: RelayConfig,
    store: Option<StateStore>,
}

impl Controller {
    pub fn new(
        state: watch::Sender<Snapshot>,
        relay: Arc<Relay>,
        config: RelayConfig,
        store: Option<StateStore>,
    ) -> Self {
        Self {
            resources: Mutex::new(ModeResources::default()),
            state,
            relay,
            config,
            store,
        }
    }

    /// The latest published snapshot. Does not wait for a running
    /// transition.
    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    /// State-change events: the receiver is marked changed after every
    /// completed transition.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    /// `GetState`: snapshot plus relay diagnostics.
    pub fn state(&self) -> State {
        self.snapshot().to_public(self.relay.diagnostics())
    }

    // ─── Request Dispatch ───────────────────────────────────

    pub async fn handle(self: &Arc<Self>, request: Request) -> FwdResult<State> {
        match request {
            Request::SetPartner(partner) => Ok(self.set_partner(partner).await),
            Request::ConnectToServer(url) => self.connect_to_server(&url).await,
            Request::AcceptClients(endpoint) => self.accept_clients(&endpoint).await,
            Request::Disconnect => Ok(self.disconnect().await),
            Request::GetState => Ok(self.state()),
            Request::Forward(_) => Err(FwdError::BadRequest(
                "Forward is relayed, not a control request".into(),
            )),
        }
    }

    // ─── Transitions ────────────────────────────────────────

    /// `SetPartner`: applies to frames relayed from now on. Identities are
    /// opaque; only an empty one clears the partner.
    pub async fn set_partner(&self, partner: Option<String>) -> State {
        let _guard = self.resources.lock().await;
        let partner = partner.filter(|p| !p.is_empty());
        info!("Partner set to {:?}", partner);
        self.state.send_modify(|s| s.partner = partner);
        self.persist().await;
        self.state()
    }

    /// `ConnectToServer`: dials `raw`, then replaces whatever the forwarder
    /// was doing with the new outbound connection.
    pub async fn connect_to_server(&self, raw: &str) -> FwdResult<State> {
        let url = parse_server_url(raw)?;
        let mut resources = self.resources.lock().await;

        info!("Connecting to WebSocket server {}", url);
        let socket = dial(&url, self.config.connect_timeout())
            .await
            .inspect_err(|e| warn!("{}", e))?;

        let epoch = self.teardown(&mut resources).await;
        match self.relay.registry().admit(Role::Outbound, epoch) {
            Ok(admission) => {
                spawn_connection(&self.relay, admission, socket);
            }
            Err(e) => {
                // The registry was just emptied under the lock, so this is
                // unreachable in practice; fall back to idle rather than
                // publish a server link without a connection.
                self.publish(Link::None, epoch);
                return Err(FwdError::Internal(e.into()));
            }
        }

        info!("Connected to WebSocket server {}", url);
        self.publish(Link::ToWsServer { url }, epoch);
        self.persist().await;
        Ok(self.state())
    }

    /// `AcceptClients`: starts accepting inbound clients on `raw`, closing
    /// whatever connections existed before.
    pub async fn accept_clients(&self, raw: &str) -> FwdResult<State> {
        let endpoint = AcceptEndpoint::parse(raw)?;
        if endpoint.collides_with_api() {
            return Err(FwdError::BindFailed(format!(
                "{endpoint}: path is used by the control API"
            )));
        }
        let mut resources = self.resources.lock().await;

        // Bind before tearing anything down. The listener is reused when
        // it already serves the same address.
        let listener = match endpoint.listen_addr() {
            None => None,
            Some(addr) => match resources.listener.take() {
                Some(existing) if existing.addr() == addr => Some(existing),
                other => {
                    resources.listener = other;
                    Some(
                        Listener::bind(self.relay.clone(), addr)
                            .await
                            .inspect_err(|e| warn!("{}", e))?,
                    )
                }
            },
        };

        let epoch = self.teardown(&mut resources).await;
        resources.listener = listener;

        info!("Accepting WebSocket clients on {}", endpoint);
        self.publish(Link::ToWsClient { endpoint }, epoch);
        self.persist().await;
        Ok(self.state())
    }

    /// `Disconnect`: closes everything and goes idle. Idempotent.
    pub async fn disconnect(&self) -> State {
        let mut resources = self.resources.lock().await;
        let epoch = self.teardown(&mut resources).await;
        info!("Disconnected");
        self.publish(Link::None, epoch);
        self.persist().await;
        self.state()
    }

    /// Ends the current mode: cancels a pending re-dial, stops the accept
    /// listener and closes every connection. Returns the new epoch.
    ///
    /// The listener and the connections share one close timeout.
    async fn teardown(&self, resources: &mut ModeResources) -> u64 {
        let deadline = Instant::now() + self.config.close_timeout();
        if let Some(reconnect) = resources.reconnect.take() {
            reconnect.abort();
        }
        if let Some(listener) = resources.listener.take() {
            listener
                .stop(deadline.saturating_duration_since(Instant::now()))
                .await;
        }

        let report = self
            .relay
            .registry()
            .close_all(deadline.saturating_duration_since(Instant::now()))
            .await;
        if report.forced > 0 {
            self.relay
                .stats()
                .record(DropReason::CloseTimeout, report.forced as u64);
        }
        report.epoch
    }

    fn publish(&self, link: Link, epoch: u64) {
        self.state.send_modify(|s| {
            s.link = link;
            s.epoch = epoch;
        });
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.snapshot()).await {
                warn!("Failed to save state: {:#}", e);
            }
        }
    }

    // ─── Startup ────────────────────────────────────────────

    /// Restores the saved state, if any, and re-establishes its link.
    /// Without a saved link, dials `connect_on_start` when given.
    pub async fn resume(self: &Arc<Self>, connect_on_start: Option<String>) {
        let saved = match &self.store {
            Some(store) => store.load().await.unwrap_or_else(|e| {
                warn!("Ignoring saved state: {:#}", e);
                None
            }),
            None => None,
        };

        if let Some(saved) = &saved {
            if saved.partner.is_some() {
                self.set_partner(saved.partner.clone()).await;
            }
        }

        match saved.as_ref().and_then(restored_link) {
            Some((ConnectionType::ToWsServer, url)) => {
                if let Err(e) = self.connect_to_server(&url).await {
                    warn!("Could not restore connection to {}: {}", url, e);
                    if let Ok(url) = parse_server_url(&url) {
                        self.keep_dialing(url).await;
                    }
                }
            }
            Some((ConnectionType::ToWsClient, endpoint)) => {
                if let Err(e) = self.accept_clients(&endpoint).await {
                    warn!("Could not restore accept endpoint {}: {}", endpoint, e);
                }
            }
            _ => {
                if let Some(url) = connect_on_start {
                    if let Err(e) = self.connect_to_server(&url).await {
                        warn!("Could not connect to {} on start: {}", url, e);
                    }
                }
            }
        }
    }

    /// Enters `ToWsServer` with no connection yet and re-dials in the
    /// background until it succeeds or another transition intervenes.
    async fn keep_dialing(self: &Arc<Self>, url: Url) {
        let mut resources = self.resources.lock().await;
        let epoch = self.teardown(&mut resources).await;
        self.publish(Link::ToWsServer { url: url.clone() }, epoch);
        resources.reconnect = Some(tokio::spawn(self.clone().reconnect(url, epoch)));
        self.persist().await;
    }

    // ─── Reconnect ──────────────────────────────────────────

    /// Watches for outbound connections the server closed and re-dials
    /// them while the forwarder is still in that `ToWsServer` mode.
    pub async fn supervise(
        self: Arc<Self>,
        mut departures: mpsc::UnboundedReceiver<(ConnectionId, Departure)>,
    ) {
        while let Some((id, departure)) = departures.recv().await {
            if departure.role != Role::Outbound || departure.requested {
                continue;
            }

            let mut resources = self.resources.lock().await;
            let snapshot = self.snapshot();
            let Link::ToWsServer { url } = snapshot.link else {
                continue;
            };
            if snapshot.epoch != departure.epoch {
                debug!("Ignoring loss of {} from an earlier mode", id);
                continue;
            }

            warn!("Connection {} to {} lost; reconnecting", id, url);
            if let Some(previous) = resources.reconnect.take() {
                previous.abort();
            }
            resources.reconnect = Some(tokio::spawn(self.clone().reconnect(url, snapshot.epoch)));
            // Observers see the open connection count drop.
            self.state.send_modify(|_| {});
        }
    }

    /// Re-dials `url` with exponential backoff. The record stays
    /// `Connecting` during each attempt, so partner frames are dropped
    /// rather than queued.
    async fn reconnect(self: Arc<Self>, url: Url, epoch: u64) {
        let mut backoff = Backoff::new(self.config.reconnect_initial(), self.config.reconnect_max());
        loop {
            let delay = backoff.next_delay();
            info!("Reconnecting to {} in {:?}", url, delay);
            tokio::time::sleep(delay).await;

            let admission = match self.relay.registry().admit(Role::Outbound, epoch) {
                Ok(admission) => admission,
                Err(e) => {
                    debug!("Giving up reconnect to {}: {}", url, e);
                    return;
                }
            };

            match dial(&url, self.config.connect_timeout()).await {
                Ok(socket) => {
                    if spawn_connection(&self.relay, admission, socket) {
                        info!("Reconnected to {}", url);
                        self.state.send_modify(|_| {});
                    }
                    return;
                }
                Err(e) => {
                    drop(admission);
                    warn!("{}", e);
                }
            }
        }
    }
}

/// Re-dial delays: `initial`, doubling each time, capped at `max`.
#[derive(Debug, Clone)]
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FwdConfig;
    use crate::state::AppState;
    use crate::transport::ChannelTransport;
    use futures::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    
    fn test_config() -> FwdConfig {
        let mut config = FwdConfig::default();
        config.relay.connect_timeout_ms = 1_000;
        config.relay.close_timeout_ms = 200;
        config.relay.reconnect_initial_ms = 20;
        config.relay.reconnect_max_ms = 100;
        config
    }

    fn start(config: &FwdConfig) -> AppState {
        let (transport, _deliveries) = ChannelTransport::new();
        AppState::start(config, Arc::new(transport))
    }

    /// A WebSocket server that accepts every client and echoes its frames.
    /// Returns the server's URL and a channel reporting each accept.
    async fn echo_server() -> (String, mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let accepted_tx = accepted_tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let _ = accepted_tx.send(());
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_text() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (format!("ws://{addr}"), accepted_rx)
    }

    /// A WebSocket server that closes every connection right after the
    /// handshake.
    async fn hangup_server() -> (String, mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    let _ = accepted_tx.send(());
                    let _ = ws.close(None).await;
                }
            }
        });
        (format!("ws://{addr}"), accepted_rx)
    }

    /// Accepts TCP connections and drops them before the WebSocket
    /// handshake. Reports when each attempt arrived.
    async fn refusing_server() -> (String, mpsc::UnboundedReceiver<Instant>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = attempts_tx.send(Instant::now());
                drop(stream);
            }
        });
        (format!("ws://{addr}"), attempts_rx)
    }

    /// An address nothing listens on.
    async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn disconnect_from_idle_is_a_no_op() {
        let app = start(&test_config());
        let state = app.controller.disconnect().await;
        assert_eq!(state.connection, ConnectionType::None);
        assert_eq!(state.ws_url, None);
        assert!(app.relay.registry().is_empty());
    }

    #[tokio::test]
    async fn set_partner_keeps_identities_opaque() {
        let app = start(&test_config());
        let state = app.controller.set_partner(Some("alice.os".into())).await;
        assert_eq!(state.partner.as_deref(), Some("alice.os"));
        let state = app.controller.set_partner(Some(" alice.os ".into())).await;
        assert_eq!(state.partner.as_deref(), Some(" alice.os "));
        let state = app.controller.set_partner(Some(String::new())).await;
        assert_eq!(state.partner, None);
        let state = app.controller.set_partner(Some("bob.os".into())).await;
        assert_eq!(state.partner.as_deref(), Some("bob.os"));
        let state = app.controller.set_partner(None).await;
        assert_eq!(state.partner, None);
    }

    #[tokio::test]
    async fn invalid_arguments_have_no_side_effects() {
        let app = start(&test_config());
        app.controller.accept_clients("/ws").await.unwrap();
        let before = app.controller.snapshot();

        let err = app.controller.connect_to_server("http://nope").await.unwrap_err();
        assert!(matches!(err, FwdError::InvalidUrl(_)));
        let err = app.controller.accept_clients("").await.unwrap_err();
        assert!(matches!(err, FwdError::InvalidEndpoint(_)));
        let err = app.controller.accept_clients("/api/events").await.unwrap_err();
        assert!(matches!(err, FwdError::BindFailed(_)));

        assert_eq!(app.controller.snapshot(), before);
    }

    #[tokio::test]
    async fn failed_dial_leaves_state_identical() {
        let app = start(&test_config());
        app.controller.set_partner(Some("alice.os".into())).await;
        app.controller.accept_clients("/ws").await.unwrap();
        let before = app.controller.snapshot();

        let url = format!("ws://{}", closed_addr().await);
        let err = app.controller.connect_to_server(&url).await.unwrap_err();
        assert!(matches!(err, FwdError::ConnectFailed(_)));
        assert_eq!(app.controller.snapshot(), before);
    }

    #[tokio::test]
    async fn failed_bind_leaves_state_identical() {
        let app = start(&test_config());
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let before = app.controller.snapshot();

        let err = app
            .controller
            .accept_clients(&format!("{addr}/ws"))
            .await
            .unwrap_err();
        assert!(matches!(err, FwdError::BindFailed(_)));
        assert_eq!(app.controller.snapshot(), before);
    }

    #[tokio::test]
    async fn switching_modes_closes_the_previous_connection() {
        let app = start(&test_config());
        let (url, mut accepted) = echo_server().await;

        let state = app.controller.connect_to_server(&url).await.unwrap();
        assert_eq!(state.connection, ConnectionType::ToWsServer);
        assert_eq!(state.diagnostics.open_connections, 1);
        timeout(Duration::from_secs(1), accepted.recv()).await.unwrap();

        let state = app.controller.accept_clients("/ws").await.unwrap();
        assert_eq!(state.connection, ConnectionType::ToWsClient);
        assert_eq!(state.ws_url.as_deref(), Some("/ws"));
        assert!(app.relay.registry().is_empty());

        let state = app.controller.disconnect().await;
        assert_eq!(state.connection, ConnectionType::None);
        assert!(app.relay.registry().is_empty());
    }

    #[tokio::test]
    async fn second_connect_replaces_the_first() {
        let app = start(&test_config());
        let (first, _) = echo_server().await;
        let (second, _) = echo_server().await;

        app.controller.connect_to_server(&first).await.unwrap();
        let state = app.controller.connect_to_server(&second).await.unwrap();
        assert_eq!(state.diagnostics.open_connections, 1);
        assert_eq!(state.ws_url, Some(format!("{second}/")));
        assert_eq!(app.relay.registry().connections().len(), 1);
    }

    #[tokio::test]
    async fn dedicated_listener_is_reused_for_the_same_address() {
        let app = start(&test_config());
        let addr = closed_addr().await;

        app.controller
            .accept_clients(&format!("{addr}/a"))
            .await
            .unwrap();
        let state = app
            .controller
            .accept_clients(&format!("{addr}/b"))
            .await
            .unwrap();
        assert_eq!(state.ws_url, Some(format!("{addr}/b")));

        let state = app.controller.disconnect().await;
        assert_eq!(state.connection, ConnectionType::None);
        // The port is free again once the listener is stopped.
        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn lost_server_connection_is_redialed() {
        let app = start(&test_config());
        let (url, mut accepted) = hangup_server().await;

        app.controller.connect_to_server(&url).await.unwrap();
        timeout(Duration::from_secs(1), accepted.recv()).await.unwrap();
        // The server hangs up; the forwarder dials again on its own.
        timeout(Duration::from_secs(2), accepted.recv())
            .await
            .expect("no reconnect attempt")
            .unwrap();
        assert_eq!(
            app.controller.snapshot().link.connection_type(),
            ConnectionType::ToWsServer
        );

        app.controller.disconnect().await;
        assert!(app.relay.registry().is_empty());
    }

    #[tokio::test]
    async fn disconnect_stops_redialing() {
        let app = start(&test_config());
        let addr = closed_addr().await;
        app.controller
            .keep_dialing(parse_server_url(&format!("ws://{addr}")).unwrap())
            .await;
        assert_eq!(
            app.controller.state().connection,
            ConnectionType::ToWsServer
        );

        app.controller.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(app.relay.registry().is_empty());
        assert_eq!(app.controller.state().connection, ConnectionType::None);
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.state_file = Some(dir.path().join("state.json"));

        let first = start(&config);
        first.controller.set_partner(Some("alice.os".into())).await;
        first.controller.accept_clients("/ws").await.unwrap();

        let second = start(&config);
        second.controller.resume(None).await;
        let state = second.controller.state();
        assert_eq!(state.partner.as_deref(), Some("alice.os"));
        assert_eq!(state.connection, ConnectionType::ToWsClient);
        assert_eq!(state.ws_url.as_deref(), Some("/ws"));
    }

    #[tokio::test]
    async fn connect_on_start_dials_when_nothing_was_saved() {
        let app = start(&test_config());
        let (url, mut accepted) = echo_server().await;
        app.controller.resume(Some(url)).await;
        timeout(Duration::from_secs(1), accepted.recv()).await.unwrap();
        assert_eq!(
            app.controller.state().connection,
            ConnectionType::ToWsServer
        );
    }

    #[tokio::test]
    async fn observers_are_notified_of_transitions() {
        let app = start(&test_config());
        let mut events = app.controller.subscribe();
        events.borrow_and_update();

        app.controller.accept_clients("/ws").await.unwrap();
        assert!(events.has_changed().unwrap());
        assert_eq!(
            events.borrow_and_update().link.connection_type(),
            ConnectionType::ToWsClient
        );
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [5, 10, 20, 30, 30, 30]);
    }

    #[tokio::test]
    async fn redial_delay_doubles_up_to_the_cap() {
        let mut config = test_config();
        config.relay.reconnect_initial_ms = 40;
        config.relay.reconnect_max_ms = 150;
        let app = start(&config);
        let (url, mut attempts) = refusing_server().await;

        let epoch = app.relay.registry().epoch();
        let redial = tokio::spawn(
            app.controller
                .clone()
                .reconnect(parse_server_url(&url).unwrap(), epoch),
        );
        let mut arrivals = Vec::new();
        for _ in 0..5 {
            let at = timeout(Duration::from_secs(3), attempts.recv())
                .await
                .expect("no redial attempt")
                .unwrap();
            arrivals.push(at);
        }
        redial.abort();
        let _ = redial.await;

        // Sleeps between attempts: 80ms, then 150ms from there on. Uncapped
        // they would grow to 160ms, 320ms and 640ms.
        let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(75), "{gaps:?}");
        assert!(gaps[1] >= Duration::from_millis(145), "{gaps:?}");
        for gap in &gaps[2..] {
            assert!(*gap >= Duration::from_millis(145), "{gaps:?}");
            assert!(*gap < Duration::from_millis(300), "{gaps:?}");
        }
        assert!(app.relay.registry().is_empty());
    }

    #[tokio::test]
    async fn teardown_shares_one_close_timeout() {
        let mut config = test_config();
        config.relay.close_timeout_ms = 300;
        let app = start(&config);
        let addr = closed_addr().await;
        app.controller
            .accept_clients(&format!("{addr}/ws"))
            .await
            .unwrap();

        // A request that never finishes keeps the listener busy on shutdown.
        let mut lingering = TcpStream::connect(addr).await.unwrap();
        lingering
            .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A connection whose task ignores the close request.
        let registry = app.relay.registry();
        let stuck = registry.admit(Role::Inbound, registry.epoch()).unwrap();
        assert!(stuck.attach(tokio::spawn(std::future::pending::<()>())));

        let started = Instant::now();
        let state = app.controller.disconnect().await;
        let elapsed = started.elapsed();

        assert_eq!(state.connection, ConnectionType::None);
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
        assert_eq!(state.diagnostics.close_timeouts, 1);
        assert!(app.relay.registry().is_empty());
        drop(lingering);
    }
}
