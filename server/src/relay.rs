//! # Forwarding Relay
//!
//! Moves frames between the partner and the WebSocket side.
//!
//! ## Data Flow
//!
//! ```text
//! Partner ──inbox──→ [run_inbox] ──→ from_partner ──→ outbox(es) ──→ WebSocket(s)
//! WebSocket ──pump──→ from_websocket ──→ partner queue ──→ [run_partner_sender] ──→ Partner
//! ```
//!
//! Routing reads the latest published [`Snapshot`] and the registry; it never
//! takes the mode lock. Nothing on this path fails a caller: every frame that
//! cannot be delivered is counted in [`RelayStats`] and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fwd_protocol::Diagnostics;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::mode::Link;
use crate::queue::{self, BoundedReceiver};
use crate::registry::{ConnectionId, ConnectionRegistry, Departure, Frame, Role};
use crate::state::Snapshot;
use crate::transport::{Envelope, PartnerMessage, PartnerTransport};

/// Why a frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No partner, no open connection, or idle mode.
    NoActiveConnection,
    /// Evicted from a full buffer.
    Overflow,
    /// Sent by someone other than the configured partner.
    ForeignSender,
    /// The partner transport failed.
    TransportFailed,
    /// A connection was forcibly dropped during teardown.
    CloseTimeout,
}

// ─── Stats ──────────────────────────────────────────────────────

/// Drop counters, exposed through `GetState`.
#[derive(Debug, Default)]
pub struct RelayStats {
    no_active_connection: AtomicU64,
    overflow_dropped: AtomicU64,
    foreign_sender: AtomicU64,
    transport_failed: AtomicU64,
    close_timeouts: AtomicU64,
}

impl RelayStats {
    pub fn record(&self, reason: DropReason, count: u64) {
        let counter = match reason {
            DropReason::NoActiveConnection => &self.no_active_connection,
            DropReason::Overflow => &self.overflow_dropped,
            DropReason::ForeignSender => &self.foreign_sender,
            DropReason::TransportFailed => &self.transport_failed,
            DropReason::CloseTimeout => &self.close_timeouts,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn count(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::NoActiveConnection => &self.no_active_connection,
            DropReason::Overflow => &self.overflow_dropped,
            DropReason::ForeignSender => &self.foreign_sender,
            DropReason::TransportFailed => &self.transport_failed,
            DropReason::CloseTimeout => &self.close_timeouts,
        }
        .load(Ordering::Relaxed)
    }

    fn diagnostics(&self, open_connections: usize) -> Diagnostics {
        Diagnostics {
            open_connections,
            no_active_connection: self.count(DropReason::NoActiveConnection),
            overflow_dropped: self.count(DropReason::Overflow),
            foreign_sender: self.count(DropReason::ForeignSender),
            transport_failed: self.count(DropReason::TransportFailed),
            close_timeouts: self.count(DropReason::CloseTimeout),
        }
    }
}

/// A frame queued for the partner. The partner is fixed when the frame is
/// queued, so a later `SetPartner` does not retarget it.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub partner: String,
    pub envelope: Envelope,
}

// ─── Relay ──────────────────────────────────────────────────────

pub struct Relay {
    state: watch::Receiver<Snapshot>,
    registry: Arc<ConnectionRegistry>,
    to_partner: broadcast::Sender<Outgoing>,
    /// Connections that went away without being asked to, for the
    /// controller's reconnect supervisor.
    departures: mpsc::UnboundedSender<(ConnectionId, Departure)>,
    stats: Arc<RelayStats>,
}

impl Relay {
    /// Creates the relay and the receiving end of the partner queue, to be
    /// drained by [`run_partner_sender`].
    pub fn new(
        state: watch::Receiver<Snapshot>,
        registry: Arc<ConnectionRegistry>,
        buffer: usize,
        departures: mpsc::UnboundedSender<(ConnectionId, Departure)>,
    ) -> (Self, BoundedReceiver<Outgoing>) {
        let (to_partner, to_partner_rx) = queue::channel(buffer);
        let relay = Self {
            state,
            registry,
            to_partner,
            departures,
            stats: Arc::new(RelayStats::default()),
        };
        (relay, to_partner_rx)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.stats.diagnostics(self.registry.open_count())
    }

    // ── Partner → WebSocket ──

    /// Relays one partner message to the WebSocket side. Returns how many
    /// connections it was queued on.
    pub fn from_partner(&self, message: PartnerMessage) -> usize {
        if message.payload.is_empty() {
            return 0;
        }

        let role = {
            let snapshot = self.state.borrow();
            if snapshot.partner.as_deref() != Some(message.source.as_str()) {
                debug!("Ignoring frame from {}: not our partner", message.source);
                self.stats.record(DropReason::ForeignSender, 1);
                return 0;
            }
            match snapshot.link {
                Link::None => None,
                Link::ToWsServer { .. } => Some(Role::Outbound),
                Link::ToWsClient { .. } => Some(Role::Inbound),
            }
        };

        let Some(role) = role else {
            debug!("Dropping partner frame: no WebSocket side configured");
            self.stats.record(DropReason::NoActiveConnection, 1);
            return 0;
        };

        // Only `Open` records are returned; connecting or closing ones never
        // receive frames.
        let outboxes = self.registry.open_outboxes(role);
        if outboxes.is_empty() {
            debug!("Dropping partner frame: no open {:?} connection", role);
            self.stats.record(DropReason::NoActiveConnection, 1);
            return 0;
        }

        let mut queued = 0;
        for (id, outbox) in outboxes {
            if outbox.send(message.payload.clone()).is_ok() {
                queued += 1;
            } else {
                debug!("Connection {} stopped writing; frame not queued", id);
            }
        }
        queued
    }

    // ── WebSocket → Partner ──

    /// Relays one frame received on connection `id` toward the partner.
    /// Returns `false` when the frame was dropped.
    pub fn from_websocket(&self, id: ConnectionId, payload: Frame) -> bool {
        if !self.registry.is_open(&id) {
            debug!("Dropping frame from {}: connection is not open", id);
            return false;
        }

        let partner = self.state.borrow().partner.clone();
        let Some(partner) = partner else {
            debug!("Dropping frame from {}: no partner set", id);
            self.stats.record(DropReason::NoActiveConnection, 1);
            return false;
        };

        let outgoing = Outgoing {
            partner,
            envelope: Envelope {
                origin: id,
                payload,
            },
        };
        if self.to_partner.send(outgoing).is_err() {
            warn!("Partner sender is gone; dropping frame from {}", id);
            self.stats.record(DropReason::TransportFailed, 1);
            return false;
        }
        true
    }

    // ── Connection bookkeeping ──

    /// Called by a pump task when its socket is done.
    pub fn connection_closed(&self, id: ConnectionId) {
        let Some(departure) = self.registry.depart(&id) else {
            return;
        };
        if departure.requested {
            debug!("Connection {} closed on request", id);
        } else {
            info!("Connection {} closed by peer", id);
            let _ = self.departures.send((id, departure));
        }
    }
}

// ─── Background Tasks ───────────────────────────────────────────

/// Drains the partner queue into the transport, one frame at a time, so
/// per-connection order is kept.
pub async fn run_partner_sender(
    stats: Arc<RelayStats>,
    mut queue: BoundedReceiver<Outgoing>,
    transport: Arc<dyn PartnerTransport>,
) {
    loop {
        match queue.recv().await {
            Ok(outgoing) => {
                if let Err(e) = transport.send(&outgoing.partner, outgoing.envelope).await {
                    warn!("Failed to forward frame to {}: {}", outgoing.partner, e);
                    stats.record(DropReason::TransportFailed, 1);
                }
            }
            Err(RecvError::Lagged(n)) => {
                warn!("Partner queue overflowed; dropped {} oldest frame(s)", n);
                stats.record(DropReason::Overflow, n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Relays partner messages in the order the transport delivered them.
pub async fn run_inbox(relay: Arc<Relay>, mut inbox: mpsc::Receiver<PartnerMessage>) {
    while let Some(message) = inbox.recv().await {
        relay.from_partner(message);
    }
}
