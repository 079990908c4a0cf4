//! Checkpoint persistence for resumable runs.
//!
//! A [`Checkpoint`] captures how far a session got; the [`CheckpointStore`]
//! persists one durable record per session id, atomically (write to a
//! temp file, then rename). Two encodings are supported: plain JSON for
//! small or debug workloads and gzip-compressed JSON for large ones. The
//! encoding is fixed when the store is constructed, never per call, and
//! both round-trip losslessly.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tablift_common::types::CheckpointStatus;
use tablift_common::{Result, TabliftError};

/// Resume token for one processing session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub file_name: String,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(session_id: &str, file_name: &str, total_rows: u64) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            file_name: file_name.to_string(),
            total_rows,
            processed_rows: 0,
            status: CheckpointStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_rows(&self) -> u64 {
        self.total_rows.saturating_sub(self.processed_rows)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        self.processed_rows as f64 / self.total_rows as f64 * 100.0
    }

    /// A session can resume while it is still ACTIVE and has rows left.
    pub fn can_resume(&self) -> bool {
        self.status == CheckpointStatus::Active && self.processed_rows < self.total_rows
    }

    /// Advance the offset. Progress is monotonic; a stale offset is
    /// ignored rather than rewound.
    pub fn advance(&mut self, processed_rows: u64) {
        if processed_rows > self.processed_rows {
            self.processed_rows = processed_rows;
            self.updated_at = Utc::now();
        }
    }

    pub fn complete(&mut self) {
        self.status = CheckpointStatus::Completed;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self) {
        self.status = CheckpointStatus::Failed;
        self.updated_at = Utc::now();
    }
}

/// On-disk encoding for checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointEncoding {
    /// Human-readable, for small or debug workloads
    #[default]
    Json,
    /// Compressed, for large workloads
    GzipJson,
}

impl CheckpointEncoding {
    fn extension(&self) -> &'static str {
        match self {
            CheckpointEncoding::Json => "json",
            CheckpointEncoding::GzipJson => "json.gz",
        }
    }
}

/// Aggregate counters over all persisted checkpoints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointStatistics {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    /// Completed as a percentage of total; 0 when empty
    pub success_rate: f64,
    /// Failed as a percentage of total; 0 when empty
    pub failure_rate: f64,
}

/// Durable store of checkpoints, one file per session id
pub struct CheckpointStore {
    dir: PathBuf,
    encoding: CheckpointEncoding,
}

impl CheckpointStore {
    /// Open (creating the directory if needed) with the given encoding.
    pub fn open(dir: impl AsRef<Path>, encoding: CheckpointEncoding) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, encoding })
    }

    fn path_for(&self, session_id: &str, encoding: CheckpointEncoding) -> PathBuf {
        self.dir
            .join(format!("{session_id}.{}", encoding.extension()))
    }

    /// Persist atomically: encode into a temp file in the same directory,
    /// then rename over the target.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.session_id.is_empty() {
            return Err(TabliftError::Configuration(
                "checkpoint session_id must not be empty".into(),
            ));
        }

        let encoded = match self.encoding {
            CheckpointEncoding::Json => serde_json::to_vec_pretty(checkpoint)?,
            CheckpointEncoding::GzipJson => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&serde_json::to_vec(checkpoint)?)?;
                encoder.finish()?
            }
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&encoded)?;
        tmp.flush()?;
        let target = self.path_for(&checkpoint.session_id, self.encoding);
        tmp.persist(&target).map_err(|e| e.error)?;

        debug!(
            session_id = %checkpoint.session_id,
            processed_rows = checkpoint.processed_rows,
            status = checkpoint.status.as_str(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Latest persisted checkpoint for the session, if any. Reads the
    /// store's own encoding first and falls back to the other, so a store
    /// reconfigured between runs still finds its sessions.
    pub fn load(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        for encoding in [self.encoding, other(self.encoding)] {
            let path = self.path_for(session_id, encoding);
            if path.exists() {
                return Ok(Some(read_checkpoint(&path, encoding)?));
            }
        }
        Ok(None)
    }

    /// All checkpoints still in ACTIVE status.
    pub fn list_active(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|c| c.status == CheckpointStatus::Active)
            .collect())
    }

    /// Remove checkpoints whose `updated_at` is older than the cutoff,
    /// regardless of status. Returns the number removed.
    pub fn cleanup(&self, older_than_hours: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(older_than_hours);
        let mut removed = 0;

        for (path, checkpoint) in self.read_all_with_paths()? {
            if checkpoint.updated_at < cutoff {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, older_than_hours, "Stale checkpoints removed");
        }
        Ok(removed)
    }

    /// Counters and rates across every persisted checkpoint.
    pub fn statistics(&self) -> Result<CheckpointStatistics> {
        let mut stats = CheckpointStatistics::default();
        for checkpoint in self.read_all()? {
            stats.total += 1;
            match checkpoint.status {
                CheckpointStatus::Active => stats.active += 1,
                CheckpointStatus::Completed => stats.completed += 1,
                CheckpointStatus::Failed => stats.failed += 1,
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64 * 100.0;
            stats.failure_rate = stats.failed as f64 / stats.total as f64 * 100.0;
        }
        Ok(stats)
    }

    fn read_all(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .read_all_with_paths()?
            .into_iter()
            .map(|(_, c)| c)
            .collect())
    }

    fn read_all_with_paths(&self) -> Result<Vec<(PathBuf, Checkpoint)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let encoding = if name.ends_with(".json.gz") {
                CheckpointEncoding::GzipJson
            } else if name.ends_with(".json") {
                CheckpointEncoding::Json
            } else {
                continue;
            };
            out.push((path.clone(), read_checkpoint(&path, encoding)?));
        }
        Ok(out)
    }
}

fn other(encoding: CheckpointEncoding) -> CheckpointEncoding {
    match encoding {
        CheckpointEncoding::Json => CheckpointEncoding::GzipJson,
        CheckpointEncoding::GzipJson => CheckpointEncoding::Json,
    }
}

fn read_checkpoint(path: &Path, encoding: CheckpointEncoding) -> Result<Checkpoint> {
    let bytes = fs::read(path)?;
    let decoded = match encoding {
        CheckpointEncoding::Json => bytes,
        CheckpointEncoding::GzipJson => {
            let mut decoder = GzDecoder::new(bytes.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        }
    };
    Ok(serde_json::from_slice(&decoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(encoding: CheckpointEncoding) -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path(), encoding).unwrap();
        (dir, store)
    }

    #[test]
    fn json_round_trip() {
        let (_dir, store) = store(CheckpointEncoding::Json);
        let mut cp = Checkpoint::new("sess-1", "payroll.xlsx", 1000);
        cp.advance(250);
        store.save(&cp).unwrap();

        let loaded = store.load("sess-1").unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[test]
    fn gzip_round_trip() {
        let (_dir, store) = store(CheckpointEncoding::GzipJson);
        let cp = Checkpoint::new("sess-2", "big.xlsx", 2_000_000);
        store.save(&cp).unwrap();

        let loaded = store.load("sess-2").unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[test]
    fn load_falls_back_to_the_other_encoding() {
        let dir = tempfile::TempDir::new().unwrap();
        let json_store = CheckpointStore::open(dir.path(), CheckpointEncoding::Json).unwrap();
        json_store
            .save(&Checkpoint::new("sess-3", "a.xlsx", 10))
            .unwrap();

        let gz_store = CheckpointStore::open(dir.path(), CheckpointEncoding::GzipJson).unwrap();
        assert!(gz_store.load("sess-3").unwrap().is_some());
    }

    #[test]
    fn missing_session_loads_none() {
        let (_dir, store) = store(CheckpointEncoding::Json);
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn save_overwrites_previous_offset() {
        let (_dir, store) = store(CheckpointEncoding::Json);
        let mut cp = Checkpoint::new("sess-4", "a.xlsx", 100);
        store.save(&cp).unwrap();
        cp.advance(60);
        store.save(&cp).unwrap();

        let loaded = store.load("sess-4").unwrap().unwrap();
        assert_eq!(loaded.processed_rows, 60);
    }

    #[test]
    fn advance_is_monotonic() {
        let mut cp = Checkpoint::new("s", "f", 100);
        cp.advance(50);
        cp.advance(30);
        assert_eq!(cp.processed_rows, 50);
    }

    #[test]
    fn resume_rules() {
        let mut cp = Checkpoint::new("s", "f", 100);
        cp.advance(50);
        assert!(cp.can_resume());

        cp.advance(100);
        assert!(!cp.can_resume());

        let mut failed = Checkpoint::new("s2", "f", 100);
        failed.fail();
        assert!(!failed.can_resume());
    }

    #[test]
    fn derived_progress() {
        let mut cp = Checkpoint::new("s", "f", 200);
        cp.advance(50);
        assert_eq!(cp.remaining_rows(), 150);
        assert!((cp.progress_percent() - 25.0).abs() < f64::EPSILON);

        let empty = Checkpoint::new("s", "f", 0);
        assert_eq!(empty.progress_percent(), 0.0);
    }

    #[test]
    fn list_active_filters_by_status() {
        let (_dir, store) = store(CheckpointEncoding::Json);
        store.save(&Checkpoint::new("a", "f", 10)).unwrap();

        let mut done = Checkpoint::new("b", "f", 10);
        done.complete();
        store.save(&done).unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "a");
    }

    #[test]
    fn cleanup_respects_cutoff_for_all_statuses() {
        let (_dir, store) = store(CheckpointEncoding::Json);

        let mut stale_active = Checkpoint::new("old-active", "f", 10);
        stale_active.updated_at = Utc::now() - Duration::hours(48);
        store.save(&stale_active).unwrap();

        let mut stale_done = Checkpoint::new("old-done", "f", 10);
        stale_done.status = CheckpointStatus::Completed;
        stale_done.updated_at = Utc::now() - Duration::hours(48);
        store.save(&stale_done).unwrap();

        store.save(&Checkpoint::new("fresh-active", "f", 10)).unwrap();

        let removed = store.cleanup(24).unwrap();
        assert_eq!(removed, 2);
        // The young ACTIVE checkpoint survives.
        assert!(store.load("fresh-active").unwrap().is_some());
        assert!(store.load("old-active").unwrap().is_none());
    }

    #[test]
    fn statistics_rates() {
        let (_dir, store) = store(CheckpointEncoding::Json);
        assert_eq!(store.statistics().unwrap(), CheckpointStatistics::default());

        store.save(&Checkpoint::new("a", "f", 10)).unwrap();
        let mut done = Checkpoint::new("b", "f", 10);
        done.complete();
        store.save(&done).unwrap();
        let mut failed = Checkpoint::new("c", "f", 10);
        failed.fail();
        store.save(&failed).unwrap();
        let mut failed2 = Checkpoint::new("d", "f", 10);
        failed2.fail();
        store.save(&failed2).unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 2);
        assert!((stats.success_rate - 25.0).abs() < f64::EPSILON);
        assert!((stats.failure_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_session_id_is_rejected() {
        let (_dir, store) = store(CheckpointEncoding::Json);
        let cp = Checkpoint::new("", "f", 10);
        assert!(store.save(&cp).is_err());
    }
}
