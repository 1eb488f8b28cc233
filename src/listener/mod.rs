//! # Raffle Listener
//!
//! Holds persistent connections to a large, changing set of live rooms and
//! turns their giveaway traffic into one de-duplicated event stream.
//!
//! ## Architecture
//!
//! 1. The fleet keeps two pools of room connections: rooms from the store's
//!    recency window (persisted) and rooms from the platform-wide live
//!    listing (discovered)
//! 2. Every connection feeds decoded payloads into one inbound channel
//! 3. `ListenerEngine` classifies each payload, dedups giveaways by id in the
//!    ledger, forwards new ones downstream and counts them in the store
//! 4. System broadcasts trigger a delayed poll of the room they point at
//! 5. Connection errors are counted per window; too many rebuild the fleet
//! 6. Hourly reports estimate missed giveaways from gaps in the id ranges
//!
//! ## Module Organization
//!
//! - `types` - Event kinds, canonical giveaway record, room targets
//! - `wire` - Command table and payload classification
//! - `ledger` - Seen-id sets and miss estimates
//! - `connection` - Connector seam for the protocol client
//! - `fleet` - Persisted and discovered connection pools
//! - `discovery` - Room-set fetches for reconciliation
//! - `platform` - Live-platform HTTP API
//! - `store` - SQLite room store
//! - `supervisor` - Connection error windows
//! - `stats` - Report snapshots
//! - `sink` - Report delivery
//! - `samples` - First-seen payloads of unknown commands
//! - `aggregator` - The engine task

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod fleet;
pub mod ledger;
pub mod platform;
pub mod samples;
pub mod sink;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use aggregator::{EngineHandle, Inbound, ListenerEngine};
pub use config::{ConfigError, ListenerConfig};
pub use connection::{ConnectionCounters, ConnectionEvents, Connector, RoomConnection};
pub use ledger::{miss_count, normalize_storm_id, IdentifierLedger, MissEstimate, GAP_PAIRS};
pub use platform::{HttpPlatformApi, PlatformApi, PlatformError};
pub use sink::{LogReportSink, ReportSink};
pub use stats::StatsSnapshot;
pub use store::{RoomStore, RoomUpdate, SqliteRoomStore, StoreError};
pub use supervisor::{HealthSupervisor, HealthVerdict};
pub use types::{EventKind, PoolTag, RaffleEvent, RoomRecord, RoomTarget};
