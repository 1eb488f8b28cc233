//! Integration tests for the listener engine run loop
//!
//! The engine runs in its own task against a real SQLite store, a scripted
//! platform and a connector that hands each room's event handle back to the
//! test, so payloads can be injected as if they came off the wire.

#[cfg(test)]
mod listener_integration_tests {
    use async_trait::async_trait;
    use raffle_listener::listener::{
        ConnectionEvents, Connector, ListenerConfig, ListenerEngine, LogReportSink, PlatformApi,
        PlatformError, RaffleEvent, RoomConnection, RoomStore, RoomTarget, RoomUpdate, SqliteRoomStore,
    };
    use rusqlite::{params, OptionalExtension};
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout, Duration};

    #[derive(Default)]
    struct ChannelConnector {
        opened: Mutex<Vec<(RoomTarget, ConnectionEvents)>>,
        closed: Arc<AtomicUsize>,
    }

    impl ChannelConnector {
        fn opened_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn closed_count(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }

        /// Handle of the most recent connection to `room_id`
        fn events_for(&self, room_id: u64) -> ConnectionEvents {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(target, _)| target.room_id == room_id)
                .map(|(_, events)| events.clone())
                .expect("room was never opened")
        }
    }

    struct TestConnection {
        closed: Arc<AtomicUsize>,
    }

    impl RoomConnection for TestConnection {
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Connector for ChannelConnector {
        fn connect(&self, target: RoomTarget, events: ConnectionEvents) -> Box<dyn RoomConnection> {
            self.opened.lock().unwrap().push((target, events));
            Box::new(TestConnection {
                closed: self.closed.clone(),
            })
        }
    }

    /// One live room (300) on a single discovery page
    struct ScriptedPlatform;

    #[async_trait]
    impl PlatformApi for ScriptedPlatform {
        async fn live_room_count(&self) -> Result<u64, PlatformError> {
            Ok(1)
        }

        async fn live_room_page(&self, _page: u64, _page_size: u64) -> Result<Vec<RoomTarget>, PlatformError> {
            Ok(vec![RoomTarget::new(300, 3)])
        }

        async fn owner_id(&self, room_id: u64) -> Result<u64, PlatformError> {
            Ok(room_id / 100)
        }

        async fn room_raffles(&self, _room_id: u64) -> Result<Vec<RaffleEvent>, PlatformError> {
            Ok(Vec::new())
        }
    }

    fn config() -> ListenerConfig {
        let mut config = ListenerConfig::default();
        config.discovery_page_delay_ms = 0;
        config.broadcast_poll_delay_ms = 0;
        config.health_window_ms = 60_000;
        config
    }

    fn db_path(dir: &TempDir) -> PathBuf {
        dir.path().join("rooms.db")
    }

    async fn seeded_store(dir: &TempDir) -> Arc<SqliteRoomStore> {
        let mut config = config();
        config.db_path = db_path(dir).to_string_lossy().into_owned();
        let store = SqliteRoomStore::from_config(&config).unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        for (room, owner) in [(100u64, 1u64), (200, 2)] {
            store
                .upsert_increment(room, "raffle", RoomUpdate { update_time: now, owner_id: Some(owner) })
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    /// Read a counter straight from the database file
    fn stored_counter(db: &Path, room_id: u64, counter: &str) -> Option<i64> {
        let conn = rusqlite::Connection::open(db).unwrap();
        conn.query_row(
            "SELECT count FROM room_counters WHERE room_id = ?1 AND counter = ?2",
            params![room_id as i64, counter],
            |row| row.get(0),
        )
        .optional()
        .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn small_tv(id: u64) -> serde_json::Value {
        json!({"cmd": "TV_START", "data": {"raffleId": id, "type": "small_tv", "title": "Small TV", "time": 180}})
    }

    #[tokio::test]
    async fn test_relayed_giveaway_is_emitted_and_counted_once() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let connector = Arc::new(ChannelConnector::default());

        let (engine, handle, mut events) = ListenerEngine::new(
            config(),
            connector.clone(),
            store.clone(),
            Arc::new(ScriptedPlatform),
            Arc::new(LogReportSink),
        )
        .unwrap();
        let task = tokio::spawn(engine.run());

        // Two persisted rooms plus one discovered room
        assert!(wait_until(|| connector.opened_count() == 3).await);

        connector.events_for(100).message("TV_START", small_tv(500));
        sleep(Duration::from_millis(10)).await;
        connector.events_for(200).message("TV_START", small_tv(500));

        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!((event.id, event.room_id), (500, 100));
        assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());

        let mut counted = false;
        for _ in 0..100 {
            if stored_counter(&db_path(&dir), 100, "smallTV") == Some(1) {
                counted = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(counted, "room 100 should be credited once");
        assert!(stored_counter(&db_path(&dir), 200, "smallTV").is_none());

        handle.shutdown().await;
        task.await.unwrap();
        assert_eq!(connector.closed_count(), 3);
    }

    #[tokio::test]
    async fn test_discovered_room_is_persisted_after_giveaway() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let connector = Arc::new(ChannelConnector::default());

        let (engine, handle, mut events) = ListenerEngine::new(
            config(),
            connector.clone(),
            store.clone(),
            Arc::new(ScriptedPlatform),
            Arc::new(LogReportSink),
        )
        .unwrap();
        let task = tokio::spawn(engine.run());
        assert!(wait_until(|| connector.opened_count() == 3).await);

        connector.events_for(300).message(
            "LOTTERY_START",
            json!({"data": {"id": 8801, "type": "guard", "lottery": {"time": 1200}}}),
        );
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.room_id, 300);

        let mut stored = None;
        for _ in 0..100 {
            stored = store.find_one(300).await.unwrap();
            if stored.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored.map(|r| r.owner_id), Some(3));
        // Promotion moves the existing connection instead of reconnecting
        assert_eq!(connector.opened_count(), 3);
        assert_eq!(connector.closed_count(), 0);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_burst_rebuilds_fleet() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let connector = Arc::new(ChannelConnector::default());
        let mut config = config();
        config.global_listener = false;
        config.health_error_threshold = 2;
        config.health_window_ms = 300;

        let (engine, handle, _events) = ListenerEngine::new(
            config,
            connector.clone(),
            store,
            Arc::new(ScriptedPlatform),
            Arc::new(LogReportSink),
        )
        .unwrap();
        let task = tokio::spawn(engine.run());
        assert!(wait_until(|| connector.opened_count() == 2).await);

        let events = connector.events_for(100);
        events.error();
        events.error();

        assert!(wait_until(|| connector.closed_count() == 2).await);
        assert!(wait_until(|| connector.opened_count() == 4).await);

        // Errors from the torn-down connection no longer count
        events.error();
        events.error();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.closed_count(), 2);

        handle.shutdown().await;
        task.await.unwrap();
        assert!(!handle.is_running());
    }
}
