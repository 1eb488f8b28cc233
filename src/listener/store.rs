//! Persistent room store
//!
//! Tables:
//! - `rooms` - one row per room (`room_id`, `master_id`, `update_time`)
//! - `room_counters` - giveaway counters per `(room_id, counter)`
//!
//! `upsert_increment` is safe under concurrent writers: each call is one
//! transaction that bumps a counter by 1, so repeated delivery only
//! over-counts and never loses a room.

use super::config::ListenerConfig;
use super::types::RoomRecord;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub enum StoreError {
    Database(String),
    Timeout,
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Timeout => write!(f, "Store operation timed out"),
            StoreError::Task(e) => write!(f, "Store task failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Fields applied alongside a counter increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomUpdate {
    /// Unix millis
    pub update_time: i64,
    /// Set only when the stored owner is unknown
    pub owner_id: Option<u64>,
}

/// Keyed room record store
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Rooms written after `updated_after` (unix millis)
    async fn find(&self, updated_after: i64) -> Result<Vec<RoomRecord>, StoreError>;

    async fn find_one(&self, room_id: u64) -> Result<Option<RoomRecord>, StoreError>;

    /// Increment `counter` for a room by 1 and apply `update`, creating the
    /// room if absent
    async fn upsert_increment(&self, room_id: u64, counter: &str, update: RoomUpdate) -> Result<(), StoreError>;
}

/// SQLite implementation of `RoomStore`
///
/// Blocking SQLite work runs on the blocking pool; every call is bounded by
/// `timeout`.
pub struct SqliteRoomStore {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl SqliteRoomStore {
    /// Open (or create) the database and ensure the schema exists
    pub fn open(db_path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                room_id INTEGER PRIMARY KEY,
                master_id INTEGER NOT NULL DEFAULT 0,
                update_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rooms_update_time ON rooms(update_time DESC);
            CREATE TABLE IF NOT EXISTS room_counters (
                room_id INTEGER NOT NULL,
                counter TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (room_id, counter)
            );
            "#,
        )?;

        log::info!("✅ Room store initialized with WAL mode");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout,
        })
    }

    /// Open `LISTENER_DB_PATH`, bounding every call by `REQUEST_TIMEOUT_MS`
    pub fn from_config(config: &ListenerConfig) -> Result<Self, StoreError> {
        Self::open(&config.db_path, config.request_timeout())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))?;
            op(&mut guard)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StoreError::Task(e.to_string())),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRecord> {
    Ok(RoomRecord {
        room_id: row.get::<_, i64>(0)? as u64,
        owner_id: row.get::<_, i64>(1)? as u64,
        update_time: row.get(2)?,
    })
}

#[async_trait]
impl RoomStore for SqliteRoomStore {
    async fn find(&self, updated_after: i64) -> Result<Vec<RoomRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT room_id, master_id, update_time FROM rooms WHERE update_time > ?1",
            )?;
            let records = stmt
                .query_map(params![updated_after], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn find_one(&self, room_id: u64) -> Result<Option<RoomRecord>, StoreError> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT room_id, master_id, update_time FROM rooms WHERE room_id = ?1",
                    params![room_id as i64],
                    record_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn upsert_increment(&self, room_id: u64, counter: &str, update: RoomUpdate) -> Result<(), StoreError> {
        let counter = counter.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let owner = update.owner_id.unwrap_or(0) as i64;
            tx.execute(
                r#"
                INSERT INTO rooms (room_id, master_id, update_time)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(room_id) DO UPDATE SET
                    update_time = excluded.update_time,
                    master_id = CASE
                        WHEN rooms.master_id = 0 THEN excluded.master_id
                        ELSE rooms.master_id
                    END
                "#,
                params![room_id as i64, owner, update.update_time],
            )?;
            tx.execute(
                r#"
                INSERT INTO room_counters (room_id, counter, count)
                VALUES (?1, ?2, 1)
                ON CONFLICT(room_id, counter) DO UPDATE SET count = count + 1
                "#,
                params![room_id as i64, counter],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    impl SqliteRoomStore {
        /// All counters of a room
        pub async fn counters(&self, room_id: u64) -> Result<HashMap<String, u64>, StoreError> {
            self.with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT counter, count FROM room_counters WHERE room_id = ?1")?;
                let rows = stmt.query_map(params![room_id as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?;
                let mut counters = HashMap::new();
                for row in rows {
                    let (counter, count) = row?;
                    counters.insert(counter, count);
                }
                Ok(counters)
            })
            .await
        }
    }

    /// In-memory store that records every increment
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub rooms: Mutex<HashMap<u64, RoomRecord>>,
        pub increments: Mutex<Vec<(u64, String)>>,
        /// Make `find` time out, as a stalled database would
        pub fail_find: AtomicBool,
    }

    impl MemoryStore {
        pub fn with_rooms(records: &[RoomRecord]) -> Self {
            let store = Self::default();
            {
                let mut rooms = store.rooms.lock().unwrap();
                for record in records {
                    rooms.insert(record.room_id, record.clone());
                }
            }
            store
        }

        pub fn increment_count(&self) -> usize {
            self.increments.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RoomStore for MemoryStore {
        async fn find(&self, updated_after: i64) -> Result<Vec<RoomRecord>, StoreError> {
            if self.fail_find.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout);
            }
            Ok(self
                .rooms
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.update_time > updated_after)
                .cloned()
                .collect())
        }

        async fn find_one(&self, room_id: u64) -> Result<Option<RoomRecord>, StoreError> {
            Ok(self.rooms.lock().unwrap().get(&room_id).cloned())
        }

        async fn upsert_increment(&self, room_id: u64, counter: &str, update: RoomUpdate) -> Result<(), StoreError> {
            self.increments.lock().unwrap().push((room_id, counter.to_string()));
            let mut rooms = self.rooms.lock().unwrap();
            let record = rooms.entry(room_id).or_insert(RoomRecord {
                room_id,
                owner_id: 0,
                update_time: update.update_time,
            });
            record.update_time = update.update_time;
            if record.owner_id == 0 {
                if let Some(owner) = update.owner_id {
                    record.owner_id = owner;
                }
            }
            Ok(())
        }
    }

    fn open_store() -> (TempDir, SqliteRoomStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteRoomStore::open(dir.path().join("rooms.db"), Duration::from_secs(5)).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_upsert_creates_and_increments() {
        let (_dir, store) = open_store();
        let update = RoomUpdate { update_time: 1_000, owner_id: Some(77) };

        store.upsert_increment(42, "smallTV", update).await.unwrap();
        store.upsert_increment(42, "smallTV", update).await.unwrap();
        store.upsert_increment(42, "lottery", update).await.unwrap();

        let record = store.find_one(42).await.unwrap().unwrap();
        assert_eq!(record.owner_id, 77);
        assert_eq!(record.update_time, 1_000);

        let counters = store.counters(42).await.unwrap();
        assert_eq!(counters.get("smallTV"), Some(&2));
        assert_eq!(counters.get("lottery"), Some(&1));
    }

    #[tokio::test]
    async fn test_from_config_opens_configured_path() {
        let dir = TempDir::new().unwrap();
        let mut config = ListenerConfig::default();
        config.db_path = dir.path().join("nested").join("rooms.db").to_string_lossy().into_owned();
        config.request_timeout_ms = 2_500;

        let store = SqliteRoomStore::from_config(&config).unwrap();

        assert_eq!(store.timeout, Duration::from_millis(2_500));
        assert!(dir.path().join("nested").join("rooms.db").exists());
        assert!(store.find(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_known_owner_is_not_overwritten() {
        let (_dir, store) = open_store();

        store
            .upsert_increment(1, "raffle", RoomUpdate { update_time: 10, owner_id: Some(5) })
            .await
            .unwrap();
        store
            .upsert_increment(1, "raffle", RoomUpdate { update_time: 20, owner_id: Some(6) })
            .await
            .unwrap();

        let record = store.find_one(1).await.unwrap().unwrap();
        assert_eq!(record.owner_id, 5);
        assert_eq!(record.update_time, 20);
    }

    #[tokio::test]
    async fn test_unknown_owner_is_backfilled() {
        let (_dir, store) = open_store();

        store
            .upsert_increment(1, "raffle", RoomUpdate { update_time: 10, owner_id: None })
            .await
            .unwrap();
        assert_eq!(store.find_one(1).await.unwrap().unwrap().owner_id, 0);

        store
            .upsert_increment(1, "raffle", RoomUpdate { update_time: 20, owner_id: Some(9) })
            .await
            .unwrap();
        assert_eq!(store.find_one(1).await.unwrap().unwrap().owner_id, 9);
    }

    #[tokio::test]
    async fn test_find_filters_by_recency() {
        let (_dir, store) = open_store();
        for (room, time) in [(1u64, 100i64), (2, 200), (3, 300)] {
            store
                .upsert_increment(room, "raffle", RoomUpdate { update_time: time, owner_id: None })
                .await
                .unwrap();
        }

        let mut rooms: Vec<u64> = store.find(150).await.unwrap().iter().map(|r| r.room_id).collect();
        rooms.sort_unstable();

        assert_eq!(rooms, vec![2, 3]);
        assert!(store.find_one(99).await.unwrap().is_none());
    }
}
