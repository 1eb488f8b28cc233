//! Identifier ledger: dedup gate and miss estimation for giveaway ids
//!
//! Each giveaway kind keeps two sets:
//! - `all` - every id observed since process start (never cleared)
//! - `daily` - ids observed since the last daily boundary
//!
//! ## Miss estimation
//!
//! Some kinds share one platform-wide id counter (see `GAP_PAIRS`). Merging
//! the observed ids of a pair and counting the holes between the smallest and
//! largest id gives an estimate of how many events were not observed.
//!
//! This is a heuristic. It assumes every id in the inferred range was
//! actually assigned to an event of the pair, which the platform does not
//! guarantee, so reports present it as an estimate.

use super::types::EventKind;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Width of the timestamp-derived suffix appended to storm ids
pub const STORM_SUFFIX_DIGITS: u32 = 6;

/// Strip the fixed-width suffix from a storm id to recover its logical index
pub fn normalize_storm_id(id: u64) -> u64 {
    id / 10u64.pow(STORM_SUFFIX_DIGITS)
}

fn identity(id: u64) -> u64 {
    id
}

/// One side of a gap-analysis namespace
#[derive(Debug, Clone, Copy)]
pub struct GapMember {
    pub kind: EventKind,
    pub normalize: fn(u64) -> u64,
}

/// Two kinds drawing ids from one shared counter
#[derive(Debug, Clone, Copy)]
pub struct GapPair {
    pub label: &'static str,
    pub first: GapMember,
    pub second: GapMember,
}

/// Namespace pairing table
pub const GAP_PAIRS: [GapPair; 2] = [
    GapPair {
        label: "raffle",
        first: GapMember { kind: EventKind::InstantGiveaway, normalize: identity },
        second: GapMember { kind: EventKind::ScheduledGiveaway, normalize: identity },
    },
    GapPair {
        label: "lottery",
        first: GapMember { kind: EventKind::FleetGiveaway, normalize: identity },
        second: GapMember { kind: EventKind::StormGiveaway, normalize: normalize_storm_id },
    },
];

/// Count holes in the merged id range of two id collections
///
/// Returns `-1` when both collections are empty: the range is undefined,
/// which is different from "observed ids, no holes" (`0`).
pub fn miss_count<A, B>(ids_a: A, ids_b: B) -> i64
where
    A: IntoIterator<Item = u64>,
    B: IntoIterator<Item = u64>,
{
    let merged: BTreeSet<u64> = ids_a.into_iter().chain(ids_b).collect();

    let (min, max) = match (merged.first(), merged.last()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => return -1,
    };

    let range = (max - min) as i64 + 1;
    range - merged.len() as i64
}

/// Miss estimate for one namespace pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissEstimate {
    /// Estimated misses, or `-1` when nothing was observed
    pub misses: i64,
    /// Distinct ids observed across the pair
    pub observed: usize,
}

impl MissEstimate {
    pub fn has_data(&self) -> bool {
        self.misses >= 0
    }

    /// Share of the inferred range that was missed, in percent
    ///
    /// `None` for the no-data sentinel; a made-up rate is never reported.
    pub fn rate_percent(&self) -> Option<f64> {
        if !self.has_data() {
            return None;
        }
        let total = (self.misses as f64 + self.observed as f64).max(1.0);
        Some(self.misses as f64 / total * 100.0)
    }
}

#[derive(Debug, Default, Clone)]
struct KindSets {
    all: HashSet<u64>,
    daily: HashSet<u64>,
}

/// Per-kind long-lived and daily id sets
#[derive(Debug, Clone)]
pub struct IdentifierLedger {
    sets: HashMap<EventKind, KindSets>,
    started_at: DateTime<Utc>,
    daily_since: DateTime<Utc>,
}

impl IdentifierLedger {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        let sets = EventKind::giveaways()
            .into_iter()
            .map(|kind| (kind, KindSets::default()))
            .collect();
        Self {
            sets,
            started_at: now,
            daily_since: now,
        }
    }

    /// Record `id` for `kind`; false if it was already seen
    ///
    /// This is the only dedup gate for giveaway events. Broadcast kinds have
    /// no numeric ids and are always rejected.
    pub fn record_if_new(&mut self, kind: EventKind, id: u64) -> bool {
        let Some(sets) = self.sets.get_mut(&kind) else {
            return false;
        };
        if !sets.all.insert(id) {
            return false;
        }
        sets.daily.insert(id);
        true
    }

    /// Empty every daily set; long-lived sets are untouched
    pub fn clear_daily(&mut self) {
        self.clear_daily_at(Utc::now());
    }

    pub fn clear_daily_at(&mut self, now: DateTime<Utc>) {
        for sets in self.sets.values_mut() {
            sets.daily.clear();
        }
        self.daily_since = now;
    }

    pub fn total_count(&self, kind: EventKind) -> usize {
        self.sets.get(&kind).map(|s| s.all.len()).unwrap_or(0)
    }

    pub fn daily_count(&self, kind: EventKind) -> usize {
        self.sets.get(&kind).map(|s| s.daily.len()).unwrap_or(0)
    }

    pub fn contains(&self, kind: EventKind, id: u64) -> bool {
        self.sets.get(&kind).map(|s| s.all.contains(&id)).unwrap_or(false)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn daily_since(&self) -> DateTime<Utc> {
        self.daily_since
    }

    /// Miss estimate over the long-lived sets of a pair
    pub fn total_misses(&self, pair: &GapPair) -> MissEstimate {
        self.estimate(pair, |s| &s.all)
    }

    /// Miss estimate over the daily sets of a pair
    pub fn daily_misses(&self, pair: &GapPair) -> MissEstimate {
        self.estimate(pair, |s| &s.daily)
    }

    fn estimate(&self, pair: &GapPair, pick: fn(&KindSets) -> &HashSet<u64>) -> MissEstimate {
        let ids = |member: &GapMember| -> Vec<u64> {
            self.sets
                .get(&member.kind)
                .map(|s| pick(s).iter().map(|&id| (member.normalize)(id)).collect())
                .unwrap_or_default()
        };
        let a = ids(&pair.first);
        let b = ids(&pair.second);
        let observed = a.iter().chain(b.iter()).collect::<HashSet<_>>().len();

        MissEstimate {
            misses: miss_count(a, b),
            observed,
        }
    }
}

impl Default for IdentifierLedger {
    fn default() -> Self {
        Self::new()
    }
}
