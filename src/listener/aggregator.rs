//! Listener engine - single owner of all listener state
//!
//! Every room connection, timer and background fetch talks to the engine
//! through one bounded inbound channel. The engine task alone mutates the
//! ledger, both fleet pools, the health counter and the broadcast cache, so
//! events from thousands of connections are applied one at a time.
//!
//! Slow work (store queries, discovery paging, owner lookups, broadcast
//! polls, store writes) runs in spawned tasks that report back as `Inbound`
//! messages tagged with the fleet epoch they were started under. Results
//! from an epoch that has since been torn down are dropped, and so are
//! snapshots older than one already applied.
//!
//! Connection errors bypass the channel; the engine collects the fleet's
//! error tally when each health window closes.

use super::config::{ConfigError, ListenerConfig};
use super::connection::Connector;
use super::discovery::{fetch_live_rooms, fetch_persisted_rooms};
use super::fleet::ConnectionFleet;
use super::ledger::IdentifierLedger;
use super::platform::{owner_id_or_zero, PlatformApi};
use super::samples::{sample_writer_task, CmdSampleLibrary, SampleSnapshot, SAMPLE_AUTOSAVE_INTERVAL};
use super::sink::ReportSink;
use super::stats::StatsSnapshot;
use super::store::{RoomStore, RoomUpdate};
use super::supervisor::{HealthSupervisor, HealthVerdict};
use super::types::{PoolTag, RaffleEvent, RoomTarget};
use super::wire::{self, Broadcast, Classified, Dispatch};
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};

/// Messages consumed by the engine task
#[derive(Debug)]
pub enum Inbound {
    /// Decoded payload from a room connection
    Wire { room_id: u64, cmd: String, body: Value },
    /// Store rooms within the recency window, from pass `seq`
    PersistedSnapshot { epoch: u64, seq: u64, rooms: Vec<RoomTarget> },
    /// Complete platform-wide live room set, from pass `seq`
    DiscoveredSnapshot { epoch: u64, seq: u64, rooms: Vec<RoomTarget> },
    /// Room with a resolved owner, to be added to the persisted pool
    Promote { epoch: u64, target: RoomTarget },
    /// Giveaways found by a broadcast-triggered poll
    PollResult { epoch: u64, room_id: u64, events: Vec<RaffleEvent> },
    Shutdown,
}

/// Control handle for a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Inbound>,
}

impl EngineHandle {
    /// Ask the engine to close every connection and stop
    pub async fn shutdown(&self) {
        if self.tx.send(Inbound::Shutdown).await.is_err() {
            log::debug!("Listener engine already stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Sequence numbers for one kind of background pass
///
/// Passes can overlap; a result is applied only if no later-started pass has
/// been applied already.
#[derive(Debug, Default)]
struct PassOrder {
    started: u64,
    applied: u64,
}

impl PassOrder {
    fn begin(&mut self) -> u64 {
        self.started += 1;
        self.started
    }

    fn accept(&mut self, seq: u64) -> bool {
        if seq <= self.applied {
            return false;
        }
        self.applied = seq;
        true
    }
}

pub struct ListenerEngine {
    config: ListenerConfig,
    offset: FixedOffset,
    ledger: IdentifierLedger,
    fleet: ConnectionFleet,
    supervisor: HealthSupervisor,
    /// Broadcast texts already handled
    msg_cache: HashSet<String>,
    /// Unrecognized commands already logged
    seen_cmds: HashSet<String>,
    /// Rooms with an owner lookup in flight ahead of promotion
    pending_promotions: HashSet<u64>,
    samples: CmdSampleLibrary,
    sample_tx: Option<mpsc::Sender<SampleSnapshot>>,
    persisted_passes: PassOrder,
    discovery_passes: PassOrder,
    store: Arc<dyn RoomStore>,
    platform: Arc<dyn PlatformApi>,
    reports: Arc<dyn ReportSink>,
    events_tx: mpsc::Sender<RaffleEvent>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Option<mpsc::Receiver<Inbound>>,
    last_clock_minute: Option<(NaiveDate, u32, u32)>,
}

impl ListenerEngine {
    /// Build an engine plus its control handle and the downstream event stream
    pub fn new(
        config: ListenerConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn RoomStore>,
        platform: Arc<dyn PlatformApi>,
        reports: Arc<dyn ReportSink>,
    ) -> Result<(Self, EngineHandle, mpsc::Receiver<RaffleEvent>), ConfigError> {
        config.validate()?;
        let offset = FixedOffset::east_opt(config.report_utc_offset_hours * 3600).ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "REPORT_UTC_OFFSET_HOURS out of range: {}",
                config.report_utc_offset_hours
            ))
        })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_buffer);
        let (events_tx, events_rx) = mpsc::channel(config.channel_buffer);

        let engine = Self {
            offset,
            ledger: IdentifierLedger::new(),
            fleet: ConnectionFleet::new(connector, inbound_tx.clone()),
            supervisor: HealthSupervisor::new(config.health_error_threshold),
            msg_cache: HashSet::new(),
            seen_cmds: HashSet::new(),
            pending_promotions: HashSet::new(),
            samples: CmdSampleLibrary::open(config.cmd_sample_path.clone()),
            sample_tx: None,
            persisted_passes: PassOrder::default(),
            discovery_passes: PassOrder::default(),
            store,
            platform,
            reports,
            events_tx,
            inbound_tx: inbound_tx.clone(),
            inbound_rx: Some(inbound_rx),
            last_clock_minute: None,
            config,
        };

        Ok((engine, EngineHandle { tx: inbound_tx }, events_rx))
    }

    pub fn ledger(&self) -> &IdentifierLedger {
        &self.ledger
    }

    pub fn fleet(&self) -> &ConnectionFleet {
        &self.fleet
    }

    pub fn supervisor(&self) -> &HealthSupervisor {
        &self.supervisor
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot::capture(
            &self.ledger,
            self.fleet.size(),
            self.supervisor.resets(),
            self.fleet.counters().dropped(),
        )
    }

    /// Main loop; returns after `EngineHandle::shutdown`
    ///
    /// Startup kicks off the first reconcile passes immediately; the timers
    /// then keep both pools, the health window and the report clock going.
    pub async fn run(mut self) {
        let Some(mut inbound_rx) = self.inbound_rx.take() else {
            log::error!("❌ Listener engine started twice");
            return;
        };

        log::info!("🚀 Starting raffle listener");
        log::info!("   ├─ Store window: {} days", self.config.db_window_days);
        log::info!("   ├─ Persisted refresh: {}ms", self.config.db_refresh_interval_ms);
        log::info!(
            "   ├─ Discovery: {} (every {}ms)",
            if self.config.global_listener { "enabled" } else { "disabled" },
            self.config.live_refresh_interval_ms
        );
        log::info!(
            "   └─ Health: {} errors per {}ms",
            self.config.health_error_threshold,
            self.config.health_window_ms
        );

        let sample_writer = match self.samples.path().map(str::to_string) {
            Some(path) => {
                let (tx, rx) = mpsc::channel(4);
                self.sample_tx = Some(tx);
                Some(tokio::spawn(sample_writer_task(rx, path)))
            }
            None => None,
        };

        self.start();

        let persisted_period = Duration::from_millis(self.config.db_refresh_interval_ms);
        let discovery_period = Duration::from_millis(self.config.live_refresh_interval_ms);
        let health_period = Duration::from_millis(self.config.health_window_ms);

        let mut persisted_timer = interval_at(Instant::now() + persisted_period, persisted_period);
        let mut discovery_timer = interval_at(Instant::now() + discovery_period, discovery_period);
        let mut health_timer = interval_at(Instant::now() + health_period, health_period);
        let mut clock_timer = interval(Duration::from_millis(self.config.clock_tick_ms));
        let mut sample_timer = interval_at(Instant::now() + SAMPLE_AUTOSAVE_INTERVAL, SAMPLE_AUTOSAVE_INTERVAL);
        for timer in [
            &mut persisted_timer,
            &mut discovery_timer,
            &mut health_timer,
            &mut clock_timer,
            &mut sample_timer,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                Some(msg) = inbound_rx.recv() => {
                    if matches!(msg, Inbound::Shutdown) {
                        log::info!("🛑 Shutdown requested");
                        break;
                    }
                    self.handle_inbound(msg);
                }

                _ = persisted_timer.tick() => {
                    self.spawn_persisted_refresh();
                }

                _ = discovery_timer.tick(), if self.config.global_listener => {
                    self.spawn_discovery_refresh();
                }

                _ = health_timer.tick() => {
                    if self.on_health_window() {
                        // Fresh fleet, fresh cadence
                        persisted_timer.reset();
                        discovery_timer.reset();
                        health_timer.reset();
                    }
                }

                _ = clock_timer.tick() => {
                    self.on_clock_tick(Utc::now());
                }

                _ = sample_timer.tick(), if self.sample_tx.is_some() => {
                    self.flush_samples();
                }

                else => {
                    log::warn!("⚠️  Inbound channel closed, stopping listener");
                    break;
                }
            }
        }

        let closed = self.fleet.teardown_all();

        if let Some(tx) = self.sample_tx.take() {
            if let Some(snapshot) = self.samples.take_dirty_snapshot() {
                if tx.send(snapshot).await.is_err() {
                    log::warn!("⚠️  Command sample writer gone, final samples not saved");
                }
            }
        }
        if let Some(writer) = sample_writer {
            if let Err(e) = writer.await {
                log::warn!("⚠️  Command sample writer failed: {}", e);
            }
        }

        log::info!("✅ Listener stopped ({} connections closed)", closed);
    }

    /// Startup sequence, also re-run after every fleet rebuild
    fn start(&mut self) {
        self.spawn_persisted_refresh();
        if self.config.global_listener {
            self.spawn_discovery_refresh();
        }
    }

    fn spawn_persisted_refresh(&mut self) {
        let seq = self.persisted_passes.begin();
        let store = self.store.clone();
        let platform = self.platform.clone();
        let tx = self.inbound_tx.clone();
        let epoch = self.fleet.epoch();
        let updated_after = Utc::now().timestamp_millis() - self.config.db_window_ms();
        let connected = self.fleet.persisted_ids();

        tokio::spawn(async move {
            if let Some(rooms) =
                fetch_persisted_rooms(store.as_ref(), platform.as_ref(), updated_after, &connected).await
            {
                let _ = tx.send(Inbound::PersistedSnapshot { epoch, seq, rooms }).await;
            }
        });
    }

    fn spawn_discovery_refresh(&mut self) {
        let seq = self.discovery_passes.begin();
        let platform = self.platform.clone();
        let tx = self.inbound_tx.clone();
        let epoch = self.fleet.epoch();
        let page_size = self.config.discovery_page_size;
        let page_delay = Duration::from_millis(self.config.discovery_page_delay_ms);

        tokio::spawn(async move {
            if let Some(rooms) = fetch_live_rooms(platform.as_ref(), page_size, page_delay).await {
                let _ = tx.send(Inbound::DiscoveredSnapshot { epoch, seq, rooms }).await;
            }
        });
    }

    fn is_stale(&self, epoch: u64, what: &str) -> bool {
        if epoch != self.fleet.epoch() {
            log::debug!(
                "Dropping stale {} (epoch {}, current {})",
                what,
                epoch,
                self.fleet.epoch()
            );
            return true;
        }
        false
    }

    pub fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Wire { room_id, cmd, body } => self.handle_wire(room_id, &cmd, body),
            Inbound::PersistedSnapshot { epoch, seq, rooms } => {
                if self.is_stale(epoch, "persisted snapshot") {
                    return;
                }
                if !self.persisted_passes.accept(seq) {
                    log::debug!("Dropping out-of-order persisted snapshot (pass {})", seq);
                    return;
                }
                let outcome = self.fleet.apply_persisted(&rooms);
                log::info!(
                    "🔄 Persisted pool: {} rooms (+{} opened, {} promoted, -{} closed)",
                    self.fleet.persisted_len(),
                    outcome.opened,
                    outcome.promoted,
                    outcome.closed
                );
            }
            Inbound::DiscoveredSnapshot { epoch, seq, rooms } => {
                if !self.config.global_listener || self.is_stale(epoch, "discovery snapshot") {
                    return;
                }
                if !self.discovery_passes.accept(seq) {
                    log::debug!("Dropping out-of-order discovery snapshot (pass {})", seq);
                    return;
                }
                let outcome = self.fleet.apply_discovered(&rooms);
                log::info!(
                    "🔄 Discovered pool: {} rooms (+{} opened, -{} closed)",
                    self.fleet.discovered_len(),
                    outcome.opened,
                    outcome.closed
                );
            }
            Inbound::Promote { epoch, target } => {
                self.pending_promotions.remove(&target.room_id);
                if self.is_stale(epoch, "promotion") {
                    return;
                }
                if self.fleet.add_persisted(target) {
                    log::info!("⬆️  Room {} added to persisted pool", target.room_id);
                }
            }
            Inbound::PollResult { epoch, room_id, events } => {
                if self.is_stale(epoch, "broadcast poll") {
                    return;
                }
                let fresh = events.into_iter().filter(|e| self.handle_giveaway(e.clone())).count();
                log::debug!("Broadcast poll of room {}: {} new giveaways", room_id, fresh);
            }
            Inbound::Shutdown => {}
        }
    }

    fn handle_wire(&mut self, room_id: u64, cmd: &str, body: Value) {
        let now_ms = Utc::now().timestamp_millis();
        match wire::classify(cmd, room_id, &body, now_ms) {
            Dispatch::Recognized(Classified::Giveaway(event)) => {
                self.handle_giveaway(event);
            }
            Dispatch::Recognized(Classified::Broadcast(broadcast)) => self.handle_broadcast(broadcast),
            Dispatch::Ignored => {}
            Dispatch::Malformed(reason) => {
                log::debug!("⚠️  Dropped malformed {} from room {}: {}", cmd, room_id, reason);
            }
            Dispatch::Unrecognized => self.note_unrecognized(cmd, body),
        }
    }

    /// Record, forward and persist a giveaway; false if it was already seen
    pub fn handle_giveaway(&mut self, event: RaffleEvent) -> bool {
        if !self.ledger.record_if_new(event.kind, event.id) {
            return false;
        }

        let pool = self.fleet.pool_of(event.room_id);
        log::info!(
            "🎁 {} #{} in room {} ({}) [{}]",
            event.kind.label(),
            event.id,
            event.room_id,
            event.title,
            pool.map(|p| p.as_str()).unwrap_or("polled")
        );

        if let Err(e) = self.events_tx.try_send(event.clone()) {
            log::warn!("⚠️  Downstream dropped {} #{}: {}", event.kind, event.id, e);
        }

        self.promote(event.room_id, pool);
        self.spawn_store_write(&event);
        true
    }

    fn promote(&mut self, room_id: u64, pool: Option<PoolTag>) {
        match pool {
            Some(PoolTag::Persisted) => {}
            Some(PoolTag::Discovered) => {
                let target = RoomTarget::new(room_id, self.fleet.owner_of(room_id));
                if self.fleet.add_persisted(target) {
                    log::info!("⬆️  Promoted discovered room {} to persisted pool", room_id);
                }
            }
            None => {
                if !self.pending_promotions.insert(room_id) {
                    return;
                }
                let platform = self.platform.clone();
                let tx = self.inbound_tx.clone();
                let epoch = self.fleet.epoch();
                tokio::spawn(async move {
                    let owner_id = owner_id_or_zero(platform.as_ref(), room_id).await;
                    let target = RoomTarget::new(room_id, owner_id);
                    let _ = tx.send(Inbound::Promote { epoch, target }).await;
                });
            }
        }
    }

    fn spawn_store_write(&self, event: &RaffleEvent) {
        let store = self.store.clone();
        let platform = self.platform.clone();
        let room_id = event.room_id;
        let counter = event.kind.as_str();
        let known_owner = self.fleet.owner_of(room_id);
        let now_ms = Utc::now().timestamp_millis();

        tokio::spawn(async move {
            record_room_hit(store.as_ref(), platform.as_ref(), room_id, counter, known_owner, now_ms).await;
        });
    }

    fn handle_broadcast(&mut self, broadcast: Broadcast) {
        if !self.msg_cache.insert(broadcast.text.clone()) {
            log::debug!("Duplicate broadcast ignored: {}", broadcast.text);
            return;
        }
        log::info!(
            "📢 {} -> room {}: {}",
            broadcast.kind.label(),
            broadcast.target_room_id,
            broadcast.text
        );

        let platform = self.platform.clone();
        let tx = self.inbound_tx.clone();
        let epoch = self.fleet.epoch();
        let room_id = broadcast.target_room_id;
        let delay = Duration::from_millis(self.config.broadcast_poll_delay_ms);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.is_closed() {
                return;
            }
            match platform.room_raffles(room_id).await {
                Ok(events) if events.is_empty() => {}
                Ok(events) => {
                    let _ = tx.send(Inbound::PollResult { epoch, room_id, events }).await;
                }
                Err(e) => log::warn!("⚠️  Giveaway poll of room {} failed: {}", room_id, e),
            }
        });
    }

    /// Sample every unrecognized command; logging is optional
    fn note_unrecognized(&mut self, cmd: &str, body: Value) {
        let excluded = self.config.exclude_cmds.iter().any(|c| c == cmd);
        if self.config.log_unknown_cmds && !excluded && self.seen_cmds.insert(cmd.to_string()) {
            log::info!("❓ Unrecognized command {}: {}", cmd, body);
        }
        self.samples.add(cmd, body);
    }

    /// Hand new samples to the writer task
    fn flush_samples(&mut self) {
        let Some(tx) = self.sample_tx.as_ref() else {
            return;
        };
        let Some(snapshot) = self.samples.take_dirty_snapshot() else {
            return;
        };
        if let Err(e) = tx.try_send(snapshot) {
            log::debug!("Command sample save deferred: {}", e);
            self.samples.mark_dirty();
        }
    }

    /// Close one health window; true if the fleet was rebuilt
    fn on_health_window(&mut self) -> bool {
        let errors = self.fleet.counters().take_errors();
        self.supervisor.record_errors(errors);

        match self.supervisor.evaluate() {
            HealthVerdict::Healthy { errors } => {
                if errors > 0 {
                    log::debug!("Health window closed with {} connection errors", errors);
                }
                false
            }
            HealthVerdict::Rebuild { errors, resets } => {
                log::warn!(
                    "🚨 {} connection errors in one window, rebuilding fleet (rebuild #{})",
                    errors,
                    resets
                );
                let closed = self.fleet.teardown_all();
                self.pending_promotions.clear();
                self.supervisor.reset_window();
                log::info!("   └─ Closed {} connections, restarting", closed);
                self.start();
                true
            }
        }
    }

    /// Hourly reports and the daily boundary, in the report time zone
    ///
    /// Ticks arrive more often than once a minute; each local minute is
    /// handled at most once.
    fn on_clock_tick(&mut self, now: DateTime<Utc>) {
        let local = now.with_timezone(&self.offset);
        let minute_key = (local.date_naive(), local.hour(), local.minute());
        if self.last_clock_minute == Some(minute_key) {
            return;
        }
        self.last_clock_minute = Some(minute_key);

        if local.minute() == 59 {
            let report_hour = (local.hour() + 1) % 24;
            let snapshot = self.stats();
            self.reports.log_report(&snapshot.render_log(self.offset));

            if report_hour % self.config.push_every_hours == 0 {
                let reports = self.reports.clone();
                let body = snapshot.render_push(self.offset);
                tokio::spawn(async move {
                    reports.push_report(body).await;
                });
            }
        }

        if local.hour() == 0 && local.minute() == 0 {
            self.ledger.clear_daily_at(now);
            self.msg_cache.clear();
            log::info!("🌅 Daily window reset");
        }
    }
}

/// Count one giveaway against its room in the store
///
/// The owner is written only when the stored record lacks one: the fleet's
/// known owner is used first, then a platform lookup.
pub async fn record_room_hit(
    store: &dyn RoomStore,
    platform: &dyn PlatformApi,
    room_id: u64,
    counter: &str,
    known_owner: u64,
    now_ms: i64,
) {
    let owner_id = match store.find_one(room_id).await {
        Ok(Some(record)) if record.owner_id != 0 => None,
        Ok(_) => {
            let owner = if known_owner != 0 {
                known_owner
            } else {
                owner_id_or_zero(platform, room_id).await
            };
            (owner != 0).then_some(owner)
        }
        Err(e) => {
            log::warn!("⚠️  Store lookup for room {} failed, skipping write: {}", room_id, e);
            return;
        }
    };

    let update = RoomUpdate {
        update_time: now_ms,
        owner_id,
    };
    if let Err(e) = store.upsert_increment(room_id, counter, update).await {
        log::warn!("⚠️  Failed to record {} for room {}: {}", counter, room_id, e);
    }
}
