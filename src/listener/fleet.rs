//! Connection fleet: two reconciled pools of live room connections
//!
//! - `persisted` - rooms from the store's recency window
//! - `discovered` - rooms from the platform-wide live listing
//!
//! A room id is held by at most one pool. The persisted pool wins: a room
//! entering it is moved out of the discovered pool in the same step.
//!
//! The fleet is owned by the engine task; reconcile inputs are fetched
//! elsewhere and applied here synchronously.

use super::aggregator::Inbound;
use super::connection::{ConnectionCounters, ConnectionEvents, Connector, RoomConnection};
use super::types::{PoolTag, RoomTarget};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

struct PooledRoom {
    owner_id: u64,
    conn: Box<dyn RoomConnection>,
}

impl PooledRoom {
    fn close(mut self) {
        self.conn.close();
    }
}

/// Connections opened and closed by one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub opened: usize,
    pub closed: usize,
    /// Rooms moved from the discovered pool into the persisted pool
    pub promoted: usize,
}

pub struct ConnectionFleet {
    connector: Arc<dyn Connector>,
    inbound: mpsc::Sender<Inbound>,
    persisted: HashMap<u64, PooledRoom>,
    discovered: HashMap<u64, PooledRoom>,
    /// Incremented on every teardown; results tagged with an older epoch are stale
    epoch: u64,
    counters: ConnectionCounters,
}

impl ConnectionFleet {
    pub fn new(connector: Arc<dyn Connector>, inbound: mpsc::Sender<Inbound>) -> Self {
        Self {
            connector,
            inbound,
            persisted: HashMap::new(),
            discovered: HashMap::new(),
            epoch: 0,
            counters: ConnectionCounters::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Error and dropped-event tallies of the current epoch
    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    /// Total connections across both pools
    pub fn size(&self) -> usize {
        self.persisted.len() + self.discovered.len()
    }

    pub fn persisted_len(&self) -> usize {
        self.persisted.len()
    }

    pub fn discovered_len(&self) -> usize {
        self.discovered.len()
    }

    pub fn pool_of(&self, room_id: u64) -> Option<PoolTag> {
        if self.persisted.contains_key(&room_id) {
            Some(PoolTag::Persisted)
        } else if self.discovered.contains_key(&room_id) {
            Some(PoolTag::Discovered)
        } else {
            None
        }
    }

    /// Known owner id for a connected room (0 if unknown)
    pub fn owner_of(&self, room_id: u64) -> u64 {
        self.persisted
            .get(&room_id)
            .or_else(|| self.discovered.get(&room_id))
            .map(|room| room.owner_id)
            .unwrap_or(0)
    }

    pub fn persisted_ids(&self) -> HashSet<u64> {
        self.persisted.keys().copied().collect()
    }

    fn open(&self, target: RoomTarget) -> PooledRoom {
        let events = ConnectionEvents::new(
            target.room_id,
            self.epoch,
            self.inbound.clone(),
            self.counters.clone(),
        );
        PooledRoom {
            owner_id: target.owner_id,
            conn: self.connector.connect(target, events),
        }
    }

    /// Single-room add path of the persisted pool
    ///
    /// A room held by the discovered pool is moved (its connection is kept);
    /// an unknown room gets a new connection. Returns false if the room was
    /// already persisted.
    pub fn add_persisted(&mut self, target: RoomTarget) -> bool {
        if self.persisted.contains_key(&target.room_id) {
            return false;
        }
        let room = match self.discovered.remove(&target.room_id) {
            Some(mut room) => {
                if room.owner_id == 0 {
                    room.owner_id = target.owner_id;
                }
                room
            }
            None => self.open(target),
        };
        self.persisted.insert(target.room_id, room);
        true
    }

    /// Diff the persisted pool against the store's current room set
    pub fn apply_persisted(&mut self, rooms: &[RoomTarget]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let wanted: HashSet<u64> = rooms.iter().map(|r| r.room_id).collect();

        for target in rooms {
            if self.persisted.contains_key(&target.room_id) {
                continue;
            }
            if self.discovered.contains_key(&target.room_id) {
                outcome.promoted += 1;
            } else {
                outcome.opened += 1;
            }
            self.add_persisted(*target);
        }

        let stale: Vec<u64> = self
            .persisted
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for room_id in stale {
            if let Some(room) = self.persisted.remove(&room_id) {
                room.close();
                outcome.closed += 1;
            }
        }

        outcome
    }

    /// Diff the discovered pool against the platform's live room set
    ///
    /// Rooms already persisted are skipped; they are never duplicated.
    pub fn apply_discovered(&mut self, rooms: &[RoomTarget]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut live: HashSet<u64> = HashSet::with_capacity(rooms.len());

        for target in rooms {
            if self.persisted.contains_key(&target.room_id) {
                continue;
            }
            live.insert(target.room_id);
            if self.discovered.contains_key(&target.room_id) {
                continue;
            }
            let room = self.open(*target);
            self.discovered.insert(target.room_id, room);
            outcome.opened += 1;
        }

        let stale: Vec<u64> = self
            .discovered
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for room_id in stale {
            if let Some(room) = self.discovered.remove(&room_id) {
                room.close();
                outcome.closed += 1;
            }
        }

        outcome
    }

    /// Close and forget every discovered connection
    pub fn clear_discovered(&mut self) -> usize {
        let count = self.discovered.len();
        for (_, room) in self.discovered.drain() {
            room.close();
        }
        count
    }

    /// Close every connection in both pools and start a new epoch
    pub fn teardown_all(&mut self) -> usize {
        let mut count = self.clear_discovered();
        for (_, room) in self.persisted.drain() {
            room.close();
            count += 1;
        }
        self.epoch += 1;
        self.counters = self.counters.next_epoch();
        count
    }
}
