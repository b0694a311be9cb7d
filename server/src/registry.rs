//! # Connection Registry
//!
//! Single source of truth for which WebSocket connections exist, which role
//! they play and how alive they are. The registry never forwards anything
//! itself; it hands out the per-connection outbound queues and answers
//! liveness questions for the relay.
//!
//! Every record belongs to an *epoch*. Each teardown ([`ConnectionRegistry::close_all`])
//! starts a new epoch, and admission is refused for any other epoch, so a
//! connection that races a mode switch can never slip into the new mode.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::queue::{self, BoundedReceiver};

/// Identifies one WebSocket connection for its whole life.
pub type ConnectionId = Uuid;

/// One opaque text payload relayed in either direction.
pub type Frame = String;

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// We dialed it (`ToWsServer`).
    Outbound,
    /// A client dialed us (`ToWsClient`).
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("mode changed since the connection was requested")]
    Superseded,
    #[error("an outbound connection already exists")]
    OutboundTaken,
}

/// Metadata stored for each registered connection.
#[derive(Debug)]
struct ConnectionRecord {
    role: Role,
    liveness: Liveness,
    epoch: u64,
    /// Frames waiting to be written to this socket. Oldest frames are
    /// overwritten when the queue is full.
    outbox: broadcast::Sender<Frame>,
    /// Tells the connection's pump task to close the socket.
    cancel: CancellationToken,
    /// The pump task, present once the connection is open.
    task: Option<JoinHandle<()>>,
}

/// Read-only view of a record.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub liveness: Liveness,
}

/// Outcome of a teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// The epoch that is current after the teardown.
    pub epoch: u64,
    /// Connections that confirmed closure in time.
    pub closed: usize,
    /// Connections aborted after the close timeout.
    pub forced: usize,
}

/// What a pump task learns when it unregisters its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub role: Role,
    pub epoch: u64,
    /// `true` when the registry asked the connection to close, `false`
    /// when the remote end went away on its own.
    pub requested: bool,
}

// ─── Registry ───────────────────────────────────────────────────

/// Central registry shared by the controller, the relay and every
/// connection task.
#[derive(Debug)]
pub struct ConnectionRegistry {
    records: DashMap<ConnectionId, ConnectionRecord>,
    /// Current epoch. Held while admitting and while starting a teardown,
    /// which serializes the two.
    epoch: Mutex<u64>,
    /// Per-connection outbound queue capacity.
    buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            records: DashMap::new(),
            epoch: Mutex::new(0),
            buffer: buffer.max(1),
        }
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    // ─── Connection lifecycle ───────────────────────────────

    /// Creates a `Connecting` record for a socket that is about to be
    /// dialed or accepted.
    ///
    /// Refused when `epoch` is no longer current, or when an outbound record
    /// already exists and `role` is outbound.
    pub fn admit(self: &Arc<Self>, role: Role, epoch: u64) -> Result<Admission, AdmitError> {
        let current = self.epoch.lock();
        if *current != epoch {
            return Err(AdmitError::Superseded);
        }
        if role == Role::Outbound && self.records.iter().any(|r| r.role == Role::Outbound) {
            return Err(AdmitError::OutboundTaken);
        }

        let id = Uuid::new_v4();
        let (outbox, outbox_rx) = queue::channel(self.buffer);
        let cancel = CancellationToken::new();
        self.records.insert(
            id,
            ConnectionRecord {
                role,
                liveness: Liveness::Connecting,
                epoch,
                outbox,
                cancel: cancel.clone(),
                task: None,
            },
        );
        drop(current);

        debug!("Admitted {:?} connection {} (epoch {})", role, id, epoch);
        Ok(Admission {
            registry: self.clone(),
            id,
            role,
            outbox: Some(outbox_rx),
            cancel,
            attached: false,
        })
    }

    /// Called when a connection's pump task ends.
    ///
    /// A connection that was asked to close moves to `Closed` and is
    /// removed by the teardown that closed it. One that went away on its
    /// own is removed right away. Returns `None` if the departure was
    /// already reported or a teardown already removed the record.
    pub fn depart(&self, id: &ConnectionId) -> Option<Departure> {
        let mut record = self.records.get_mut(id)?;
        if record.cancel.is_cancelled() {
            if record.liveness == Liveness::Closed {
                return None;
            }
            record.liveness = Liveness::Closed;
            return Some(Departure {
                role: record.role,
                epoch: record.epoch,
                requested: true,
            });
        }
        drop(record);

        self.records.remove(id).map(|(_, record)| Departure {
            role: record.role,
            epoch: record.epoch,
            requested: false,
        })
    }

    /// Closes every connection and starts a new epoch.
    ///
    /// Records move to `Closing` immediately, so the relay stops using them
    /// before this returns. Each pump task then gets until `timeout` to
    /// close its socket and report `Closed`; stragglers are aborted. Every
    /// record of the old epoch is removed before this returns.
    pub async fn close_all(&self, timeout: Duration) -> CloseReport {
        let (epoch, pending) = {
            let mut epoch = self.epoch.lock();
            *epoch += 1;
            let mut pending = Vec::new();
            for mut record in self.records.iter_mut() {
                record.liveness = Liveness::Closing;
                record.cancel.cancel();
                if let Some(task) = record.task.take() {
                    pending.push((*record.key(), task));
                }
            }
            (*epoch, pending)
        };

        let mut report = CloseReport {
            epoch,
            ..CloseReport::default()
        };
        let deadline = tokio::time::Instant::now() + timeout;
        for (id, mut task) in pending {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(_) => report.closed += 1,
                Err(_) => {
                    warn!("Connection {} did not close within {:?}; dropping it", id, timeout);
                    task.abort();
                    report.forced += 1;
                }
            }
        }

        // Anything admitted before the bump is gone now, whether or not it
        // had a task yet.
        self.records.retain(|_, record| record.epoch == epoch);

        if report.closed + report.forced > 0 {
            info!(
                "Closed {} connection(s), forced {} (epoch {})",
                report.closed, report.forced, epoch
            );
        }
        report
    }

    // ─── Queries ────────────────────────────────────────────

    pub fn liveness(&self, id: &ConnectionId) -> Option<Liveness> {
        self.records.get(id).map(|r| r.liveness)
    }

    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.liveness(id) == Some(Liveness::Open)
    }

    /// Outbound queues of every open connection with `role`.
    pub fn open_outboxes(&self, role: Role) -> Vec<(ConnectionId, broadcast::Sender<Frame>)> {
        self.records
            .iter()
            .filter(|r| r.role == role && r.liveness == Liveness::Open)
            .map(|r| (*r.key(), r.outbox.clone()))
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.liveness == Liveness::Open)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.records
            .iter()
            .map(|r| ConnectionInfo {
                id: *r.key(),
                role: r.role,
                liveness: r.liveness,
            })
            .collect()
    }
}

// ─── Admission ──────────────────────────────────────────────────

/// A `Connecting` record waiting for its socket.
///
/// Dropping an admission without [`Admission::attach`] removes the record,
/// so failed dials leave nothing behind.
#[derive(Debug)]
pub struct Admission {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    role: Role,
    outbox: Option<BoundedReceiver<Frame>>,
    cancel: CancellationToken,
    attached: bool,
}

impl Admission {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token the pump task watches for a close request.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receiving end of the outbound queue. Can be taken once.
    pub fn take_outbox(&mut self) -> Option<BoundedReceiver<Frame>> {
        self.outbox.take()
    }

    /// Marks the connection `Open` and records its pump task.
    ///
    /// Returns `false` if a teardown removed the record in the meantime;
    /// the pump has then already been asked to close.
    pub fn attach(mut self, task: JoinHandle<()>) -> bool {
        self.attached = true;
        match self.registry.records.get_mut(&self.id) {
            Some(mut record) if record.liveness == Liveness::Connecting => {
                record.liveness = Liveness::Open;
                record.task = Some(task);
                info!("Connection {} open ({:?})", self.id, self.role);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.attached {
            self.registry.records.remove(&self.id);
        }
    }
}
