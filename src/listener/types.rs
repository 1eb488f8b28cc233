//! Core data types shared across the listener
//!
//! - `EventKind` - closed set of recognized events (giveaways + broadcasts)
//! - `RaffleEvent` - canonical giveaway record emitted downstream
//! - `RoomTarget` / `RoomRecord` - rooms as seen by the fleet and the store
//! - `PoolTag` - which connection pool currently holds a room

use serde::{Deserialize, Serialize};

/// Recognized event kinds
///
/// Giveaway kinds carry a numeric identifier. Broadcast kinds carry free text
/// and a target room instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "smallTV")]
    InstantGiveaway,
    #[serde(rename = "raffle")]
    ScheduledGiveaway,
    #[serde(rename = "lottery")]
    FleetGiveaway,
    #[serde(rename = "pklottery")]
    PkGiveaway,
    #[serde(rename = "beatStorm")]
    StormGiveaway,
    #[serde(rename = "SYS_MSG")]
    SystemBroadcast,
    #[serde(rename = "SYS_GIFT")]
    SystemGiftBroadcast,
}

impl EventKind {
    /// Legacy command name, also used as the store counter key
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::InstantGiveaway => "smallTV",
            EventKind::ScheduledGiveaway => "raffle",
            EventKind::FleetGiveaway => "lottery",
            EventKind::PkGiveaway => "pklottery",
            EventKind::StormGiveaway => "beatStorm",
            EventKind::SystemBroadcast => "SYS_MSG",
            EventKind::SystemGiftBroadcast => "SYS_GIFT",
        }
    }

    /// Human-readable label used in reports
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::InstantGiveaway => "Small TV raffles",
            EventKind::ScheduledGiveaway => "Activity raffles",
            EventKind::FleetGiveaway => "Fleet lotteries",
            EventKind::PkGiveaway => "PK lotteries",
            EventKind::StormGiveaway => "Beat storms",
            EventKind::SystemBroadcast => "System broadcasts",
            EventKind::SystemGiftBroadcast => "System gift broadcasts",
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, EventKind::SystemBroadcast | EventKind::SystemGiftBroadcast)
    }

    /// Kinds that carry a numeric identifier, in report order
    pub fn giveaways() -> [EventKind; 5] {
        [
            EventKind::InstantGiveaway,
            EventKind::ScheduledGiveaway,
            EventKind::FleetGiveaway,
            EventKind::PkGiveaway,
            EventKind::StormGiveaway,
        ]
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    /// Parse a legacy command name (inverse of `as_str`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smallTV" => Ok(EventKind::InstantGiveaway),
            "raffle" => Ok(EventKind::ScheduledGiveaway),
            "lottery" => Ok(EventKind::FleetGiveaway),
            "pklottery" => Ok(EventKind::PkGiveaway),
            "beatStorm" => Ok(EventKind::StormGiveaway),
            "SYS_MSG" => Ok(EventKind::SystemBroadcast),
            "SYS_GIFT" => Ok(EventKind::SystemGiftBroadcast),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical giveaway record
///
/// Giveaway ids are global: the same id relayed through two rooms is one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaffleEvent {
    pub kind: EventKind,
    pub room_id: u64,
    pub id: u64,
    /// Platform subtype (e.g. `small_tv`, `guard`, `pk`, `beatStorm`)
    pub subtype: String,
    pub title: String,
    /// Duration/countdown as reported by the platform (seconds)
    pub time: i64,
    pub max_time: Option<i64>,
    pub time_wait: Option<i64>,
    /// Storm only: how many participants the storm accepts
    pub num: Option<u64>,
    /// Local observation time (unix millis), set when the wire event
    /// carries no authoritative start time
    pub observed_at_ms: Option<i64>,
}

/// A room the fleet should hold a connection to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomTarget {
    pub room_id: u64,
    /// 0 = unknown
    pub owner_id: u64,
}

impl RoomTarget {
    pub fn new(room_id: u64, owner_id: u64) -> Self {
        Self { room_id, owner_id }
    }
}

/// Persisted room membership record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: u64,
    /// 0 = unknown
    pub owner_id: u64,
    /// Unix millis of the last write
    pub update_time: i64,
}

/// Connection pool membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolTag {
    /// Rooms reconciled from the persistent store
    Persisted,
    /// Rooms found through the platform-wide live listing
    Discovered,
}

impl PoolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolTag::Persisted => "persisted",
            PoolTag::Discovered => "discovered",
        }
    }
}
