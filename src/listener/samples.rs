//! First-seen payloads of unrecognized wire commands
//!
//! One sample per command name, kept in memory and optionally mirrored to a
//! JSON file so new platform commands can be studied offline.
//!
//! The file has exactly one writer, `sample_writer_task`, fed snapshots over
//! a channel. Each save goes to `<path>.tmp` and is renamed into place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often new samples are flushed to disk
pub const SAMPLE_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of the library as written to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleSnapshot {
    pub samples: BTreeMap<String, Value>,
    pub timestamp: i64,
}

/// Save a sample snapshot to a JSON file
pub fn save_samples(snapshot: &SampleSnapshot, file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp_path = format!("{}.tmp", file_path);
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, file_path)?;

    log::debug!("Saved {} command samples to {}", snapshot.samples.len(), file_path);
    Ok(())
}

/// Load a sample snapshot, empty if the file does not exist yet
pub fn load_samples(file_path: &str) -> Result<BTreeMap<String, Value>, Box<dyn std::error::Error>> {
    if !Path::new(file_path).exists() {
        log::info!("No existing command sample file found: {}", file_path);
        return Ok(BTreeMap::new());
    }

    let json = fs::read_to_string(file_path)?;
    let snapshot: SampleSnapshot = serde_json::from_str(&json)?;

    log::info!("Loaded {} command samples from {}", snapshot.samples.len(), file_path);
    Ok(snapshot.samples)
}

/// Background task that owns the sample file
///
/// Snapshots queued while a save is running are coalesced; only the newest
/// is written. Returns once every sender is dropped and the queue is drained.
pub async fn sample_writer_task(mut rx: mpsc::Receiver<SampleSnapshot>, file_path: String) {
    while let Some(mut snapshot) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
        }

        let path = file_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            save_samples(&snapshot, &path).map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("⚠️  Failed to save command samples: {}", e),
            Err(e) => log::warn!("⚠️  Command sample save task failed: {}", e),
        }
    }
    log::debug!("Command sample writer stopped");
}

#[derive(Debug, Default)]
pub struct CmdSampleLibrary {
    path: Option<String>,
    samples: BTreeMap<String, Value>,
    dirty: bool,
}

impl CmdSampleLibrary {
    /// Open the library; a missing or unreadable file starts it empty
    pub fn open(path: Option<String>) -> Self {
        let samples = match path.as_deref() {
            Some(p) => load_samples(p).unwrap_or_else(|e| {
                log::warn!("⚠️  Failed to load command samples from {}: {}", p, e);
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };
        Self {
            path,
            samples,
            dirty: false,
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn contains(&self, cmd: &str) -> bool {
        self.samples.contains_key(cmd)
    }

    /// Keep `body` as the sample for `cmd`; false if one is already stored
    pub fn add(&mut self, cmd: &str, body: Value) -> bool {
        if self.samples.contains_key(cmd) {
            return false;
        }
        self.samples.insert(cmd.to_string(), body);
        self.dirty = true;
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Snapshot for the writer if anything changed since the last call
    pub fn take_dirty_snapshot(&mut self) -> Option<SampleSnapshot> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.snapshot())
    }

    /// Flag the library for another save after a failed hand-off
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn snapshot(&self) -> SampleSnapshot {
        SampleSnapshot {
            samples: self.samples.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}
