//! Periodic listener reports
//!
//! A `StatsSnapshot` is recomputed from the ledger and fleet each time it is
//! needed and rendered twice: a verbose block for the log and a condensed
//! markdown block for push notifications.

use super::ledger::{IdentifierLedger, MissEstimate, GAP_PAIRS};
use super::types::EventKind;
use chrono::{DateTime, FixedOffset, Utc};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindCount {
    pub kind: EventKind,
    pub total: usize,
    pub daily: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairMisses {
    pub label: &'static str,
    pub total: MissEstimate,
    pub daily: MissEstimate,
}

/// Read-only view of listener state at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub daily_since: DateTime<Utc>,
    pub fleet_size: usize,
    pub fleet_resets: u64,
    /// Payloads lost to a full inbound channel
    pub dropped_events: u64,
    pub counts: Vec<KindCount>,
    pub misses: Vec<PairMisses>,
}

impl StatsSnapshot {
    pub fn capture(ledger: &IdentifierLedger, fleet_size: usize, fleet_resets: u64, dropped_events: u64) -> Self {
        let counts = EventKind::giveaways()
            .into_iter()
            .map(|kind| KindCount {
                kind,
                total: ledger.total_count(kind),
                daily: ledger.daily_count(kind),
            })
            .collect();

        let misses = GAP_PAIRS
            .iter()
            .map(|pair| PairMisses {
                label: pair.label,
                total: ledger.total_misses(pair),
                daily: ledger.daily_misses(pair),
            })
            .collect();

        Self {
            started_at: ledger.started_at(),
            daily_since: ledger.daily_since(),
            fleet_size,
            fleet_resets,
            dropped_events,
            counts,
            misses,
        }
    }

    fn lines(&self, offset: FixedOffset) -> Vec<String> {
        let fmt_time = |t: DateTime<Utc>| t.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S %:z").to_string();

        let mut lines = vec![
            format!("Listening since: {}", fmt_time(self.started_at)),
            format!("Daily stats since: {}", fmt_time(self.daily_since)),
            format!("Rooms connected: {}", self.fleet_size),
            format!("Fleet rebuilds: {}", self.fleet_resets),
            format!("Events dropped (inbound full): {}", self.dropped_events),
        ];
        for count in &self.counts {
            lines.push(format!("{}: {} ({} today)", count.kind.label(), count.total, count.daily));
        }
        for pair in &self.misses {
            lines.push(format!("Est. {} misses: {}", pair.label, format_estimate(&pair.total)));
            lines.push(format!(
                "Est. {} misses since refresh: {}",
                pair.label,
                format_estimate(&pair.daily)
            ));
        }
        lines.push(
            "Miss figures assume one contiguous id counter per pair; they are estimates, not exact counts"
                .to_string(),
        );
        lines
    }

    /// Multi-line report for the local log
    pub fn render_log(&self, offset: FixedOffset) -> String {
        let mut out = String::from("\n");
        let _ = writeln!(out, "/******************** raffle listener status ********************/");
        for line in self.lines(offset) {
            let _ = writeln!(out, "{}", line);
        }
        out
    }

    /// Condensed markdown report for push notifications
    pub fn render_push(&self, offset: FixedOffset) -> String {
        let mut out = String::from("# raffle listener report\n");
        for line in self.lines(offset) {
            let _ = writeln!(out, "- {}", line);
        }
        out
    }
}

/// `misses (rate%)`, or `-1 (no data)` for the empty sentinel
pub fn format_estimate(estimate: &MissEstimate) -> String {
    match estimate.rate_percent() {
        Some(rate) => format!("{} ({:.1}%)", estimate.misses, rate),
        None => format!("{} (no data)", estimate.misses),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn test_capture_counts_and_misses() {
        let mut ledger = IdentifierLedger::new();
        ledger.record_if_new(EventKind::InstantGiveaway, 10);
        ledger.record_if_new(EventKind::ScheduledGiveaway, 13);
        ledger.record_if_new(EventKind::PkGiveaway, 3);

        let snapshot = StatsSnapshot::capture(&ledger, 12, 1, 0);

        assert_eq!(snapshot.fleet_size, 12);
        assert_eq!(snapshot.counts.len(), 5);
        let pk = snapshot.counts.iter().find(|c| c.kind == EventKind::PkGiveaway).unwrap();
        assert_eq!((pk.total, pk.daily), (1, 1));

        assert_eq!(snapshot.misses[0].total.misses, 2);
        assert_eq!(snapshot.misses[1].total.misses, -1);
    }

    #[test]
    fn test_format_estimate() {
        let some = MissEstimate { misses: 1, observed: 3 };
        assert_eq!(format_estimate(&some), "1 (25.0%)");

        let none = MissEstimate { misses: -1, observed: 0 };
        assert_eq!(format_estimate(&none), "-1 (no data)");

        let zero = MissEstimate { misses: 0, observed: 4 };
        assert_eq!(format_estimate(&zero), "0 (0.0%)");
    }

    #[test]
    fn test_renderings_carry_heuristic_note() {
        let ledger = IdentifierLedger::new();
        let snapshot = StatsSnapshot::capture(&ledger, 0, 0, 7);

        let log = snapshot.render_log(offset());
        let push = snapshot.render_push(offset());

        assert!(log.contains("Rooms connected: 0"));
        assert!(log.contains("Events dropped (inbound full): 7"));
        assert!(log.contains("no data"));
        assert!(push.starts_with("# raffle listener report"));
        assert!(push.contains("- Beat storms: 0 (0 today)"));
        assert!(push.contains("estimates, not exact counts"));
        assert!(push.contains("+08:00"));
    }
}
