//! Per-room protocol connection seam
//!
//! The protocol client (transport, framing, handshake, wire decoding) lives
//! outside this crate. The fleet only needs to open and close connections;
//! each connection reports back through a `ConnectionEvents` handle that
//! feeds the engine's single inbound channel.
//!
//! Error signals do not go through the channel: they are tallied in
//! `ConnectionCounters`, which a full channel cannot drop.

use super::aggregator::Inbound;
use super::types::RoomTarget;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opens connections to rooms
///
/// `connect` must not fail synchronously: transport failures are reported
/// through `ConnectionEvents::error`.
pub trait Connector: Send + Sync {
    fn connect(&self, target: RoomTarget, events: ConnectionEvents) -> Box<dyn RoomConnection>;
}

/// An open room connection, exclusively owned by one fleet pool
pub trait RoomConnection: Send {
    /// Stop delivering events and release the transport
    fn close(&mut self);
}

/// Tallies shared by every connection of one fleet epoch
///
/// A fleet rebuild starts a fresh error tally, so late errors from closed
/// connections land in a counter nobody reads. The dropped-event total
/// carries across rebuilds.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounters {
    errors: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ConnectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for the next epoch: new error tally, same dropped total
    pub fn next_epoch(&self) -> Self {
        Self {
            errors: Arc::new(AtomicU64::new(0)),
            dropped: self.dropped.clone(),
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Read and zero the error tally
    pub fn take_errors(&self) -> u64 {
        self.errors.swap(0, Ordering::Relaxed)
    }

    /// Payloads lost to a full inbound channel since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Event callbacks handed to a connection when it is opened
///
/// Every decoded payload goes through `message`; the engine dispatches on the
/// command name. Sends never block the connection: when the inbound channel
/// is full the payload is dropped and counted in `ConnectionCounters::dropped`.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    room_id: u64,
    epoch: u64,
    tx: mpsc::Sender<Inbound>,
    counters: ConnectionCounters,
}

impl ConnectionEvents {
    pub fn new(room_id: u64, epoch: u64, tx: mpsc::Sender<Inbound>, counters: ConnectionCounters) -> Self {
        Self {
            room_id,
            epoch,
            tx,
            counters,
        }
    }

    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver one decoded payload (`cmd` is the wire command name)
    pub fn message(&self, cmd: &str, body: serde_json::Value) {
        let inbound = Inbound::Wire {
            room_id: self.room_id,
            cmd: cmd.to_string(),
            body,
        };
        if let Err(e) = self.tx.try_send(inbound) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("⚠️  Room {} dropped {} (inbound channel: {})", self.room_id, cmd, e);
        }
    }

    /// Report one transport error (counts toward the health threshold)
    pub fn error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }
}
