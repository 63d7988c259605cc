//! Stage ledger and lineage lease
//!
//! The ledger records which `(stage, key)` pairs have completed so the
//! engine does not rely on bare file existence alone. The JSON artifacts
//! stay the payload layer: an artifact present without a ledger entry is
//! still treated as complete and the entry is backfilled.
//!
//! Several processes may share one ledger while working different
//! lineages, so every write re-reads the file under `ledger.json.lock` and
//! merges before persisting.
//!
//! The lease keeps two processes from driving the same lineage at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EvolveError, Result};

/// Stages whose completion is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Variants,
    Summary,
    Ranked,
    Champion,
    Leaderboard,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Variants => "variants",
            Stage::Summary => "summary",
            Stage::Ranked => "ranked",
            Stage::Champion => "champion",
            Stage::Leaderboard => "leaderboard",
        }
    }
}

/// One completed stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub completed_at: DateTime<Utc>,
    /// Free-form context (artifact path, score, ...)
    #[serde(default)]
    pub detail: String,
    /// Set when the entry was reconstructed from an artifact already on disk
    #[serde(default)]
    pub backfilled: bool,
}

/// Persistent `(stage, key) -> completed` map stored at `models/ledger.json`
#[derive(Debug)]
pub struct StageLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl StageLedger {
    /// Open the ledger at `path`, starting empty if the file does not exist.
    /// A corrupt ledger is reported as `Malformed` rather than discarded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            super::read_json(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    fn entry_key(stage: Stage, key: &str) -> String {
        format!("{}:{}", stage.as_str(), key)
    }

    pub fn is_complete(&self, stage: Stage, key: &str) -> bool {
        self.entries.contains_key(&Self::entry_key(stage, key))
    }

    pub fn get(&self, stage: Stage, key: &str) -> Option<&LedgerEntry> {
        self.entries.get(&Self::entry_key(stage, key))
    }

    /// Record a completion and persist the ledger atomically
    pub fn mark_complete(
        &mut self,
        stage: Stage,
        key: &str,
        detail: impl Into<String>,
    ) -> Result<()> {
        self.insert(stage, key, detail.into(), false)
    }

    /// Whether a stage is done, consulting the artifact when the ledger has
    /// no entry. Returns true and backfills the entry if `artifact` exists.
    pub fn check_or_backfill(
        &mut self,
        stage: Stage,
        key: &str,
        artifact: &Path,
    ) -> Result<bool> {
        if self.is_complete(stage, key) {
            return Ok(true);
        }
        if artifact.exists() {
            log::debug!(
                "Backfilling ledger entry {} from {}",
                Self::entry_key(stage, key),
                artifact.display()
            );
            self.insert(stage, key, artifact.display().to_string(), true)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn insert(
        &mut self,
        stage: Stage,
        key: &str,
        detail: String,
        backfilled: bool,
    ) -> Result<()> {
        let _lock = WriteLock::acquire(&self.path)?;
        if self.path.exists() {
            let on_disk: BTreeMap<String, LedgerEntry> = super::read_json(&self.path)?;
            for (k, entry) in on_disk {
                self.entries.entry(k).or_insert(entry);
            }
        }
        self.entries.insert(
            Self::entry_key(stage, key),
            LedgerEntry {
                completed_at: Utc::now(),
                detail,
                backfilled,
            },
        );
        super::write_json_atomic(&self.path, &self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Short-lived exclusive lock guarding one ledger read-merge-write cycle
struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    const ATTEMPTS: u32 = 200;
    const BACKOFF: Duration = Duration::from_millis(10);
    /// A lock older than this is left over from a crashed writer
    const STALE_AFTER: Duration = Duration::from_secs(30);

    fn acquire(ledger: &Path) -> Result<Self> {
        let mut name = ledger.as_os_str().to_os_string();
        name.push(".lock");
        let path = PathBuf::from(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..Self::ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) {
                        log::warn!("Removing stale ledger lock {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    std::thread::sleep(Self::BACKOFF);
                }
                Err(e) => {
                    return Err(EvolveError::WriteFailure { path, source: e });
                }
            }
        }
        Err(EvolveError::WriteFailure {
            source: std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "ledger lock not released in time",
            ),
            path,
        })
    }

    fn is_stale(path: &Path) -> bool {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > Self::STALE_AFTER)
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Contents of a lease file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Exclusive claim on one lineage, released when dropped
#[derive(Debug)]
pub struct LineageLease {
    path: PathBuf,
    record: LeaseRecord,
}

impl LineageLease {
    /// Acquire the lease at `path` for `lineage`.
    ///
    /// Fails with `LeaseHeld` while another owner holds a lease younger than
    /// `ttl`. A stale lease is taken over.
    pub fn acquire(path: &Path, lineage: &str, ttl: chrono::Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = LeaseRecord {
            owner: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        match Self::create_exclusive(path, &record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let held = Self::read_record(path);
                match held {
                    Some(existing) if Utc::now() - existing.acquired_at < ttl => {
                        return Err(EvolveError::LeaseHeld {
                            lineage: lineage.to_string(),
                            owner: format!("{} (pid {})", existing.owner, existing.pid),
                            since: existing.acquired_at.to_rfc3339(),
                        });
                    }
                    Some(existing) => {
                        log::warn!(
                            "Taking over stale lease on {} held by pid {} since {}",
                            lineage,
                            existing.pid,
                            existing.acquired_at.to_rfc3339()
                        );
                    }
                    None => {
                        log::warn!("Replacing unreadable lease file {}", path.display());
                    }
                }
                super::write_json_atomic(path, &record)?;
            }
            Err(e) => {
                return Err(EvolveError::WriteFailure {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }

        log::debug!("Acquired lease on {} ({})", lineage, record.owner);
        Ok(Self {
            path: path.to_path_buf(),
            record,
        })
    }

    fn create_exclusive(path: &Path, record: &LeaseRecord) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let json = serde_json::to_vec_pretty(record)?;
        file.write_all(&json)?;
        file.sync_all()
    }

    fn read_record(path: &Path) -> Option<LeaseRecord> {
        let data = std::fs::read(path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    pub fn owner(&self) -> &str {
        &self.record.owner
    }
}

impl Drop for LineageLease {
    fn drop(&mut self) {
        // only remove the file if it is still ours
        match Self::read_record(&self.path) {
            Some(current) if current.owner == self.record.owner => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    log::warn!("Failed to release lease {}: {}", self.path.display(), e);
                }
            }
            _ => log::warn!("Lease {} was taken over, not removing", self.path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("spectrum-ledger-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_mark_and_reopen() {
        let dir = test_dir();
        let path = dir.join("ledger.json");
        {
            let mut ledger = StageLedger::open(&path).unwrap();
            assert!(ledger.is_empty());
            ledger
                .mark_complete(Stage::Summary, "0/float32_Standard/3", "ok")
                .unwrap();
        }
        let ledger = StageLedger::open(&path).unwrap();
        assert!(ledger.is_complete(Stage::Summary, "0/float32_Standard/3"));
        assert!(!ledger.is_complete(Stage::Ranked, "0/float32_Standard/3"));
        assert_eq!(ledger.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_two_handles_keep_each_others_entries() {
        let dir = test_dir();
        let path = dir.join("ledger.json");
        let mut a = StageLedger::open(&path).unwrap();
        let mut b = StageLedger::open(&path).unwrap();

        a.mark_complete(Stage::Ranked, "0/float32_Standard", "a").unwrap();
        b.mark_complete(Stage::Ranked, "0/int8_Standard", "b").unwrap();
        a.mark_complete(Stage::Champion, "0/float32_Standard", "a").unwrap();

        let reopened = StageLedger::open(&path).unwrap();
        assert!(reopened.is_complete(Stage::Ranked, "0/float32_Standard"));
        assert!(reopened.is_complete(Stage::Ranked, "0/int8_Standard"));
        assert!(reopened.is_complete(Stage::Champion, "0/float32_Standard"));
        assert_eq!(reopened.len(), 3);
        assert!(!dir.join("ledger.json.lock").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_backfill_from_existing_artifact() {
        let dir = test_dir();
        let artifact = dir.join("summary.json");
        let mut ledger = StageLedger::open(dir.join("ledger.json")).unwrap();

        assert!(!ledger.check_or_backfill(Stage::Summary, "k", &artifact).unwrap());
        std::fs::write(&artifact, "{}").unwrap();
        assert!(ledger.check_or_backfill(Stage::Summary, "k", &artifact).unwrap());
        assert!(ledger.get(Stage::Summary, "k").unwrap().backfilled);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_ledger_is_reported() {
        let dir = test_dir();
        let path = dir.join("ledger.json");
        std::fs::write(&path, "[[[").unwrap();
        assert!(matches!(
            StageLedger::open(&path),
            Err(EvolveError::Malformed { .. })
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_lease_is_exclusive_and_released() {
        let dir = test_dir();
        let path = dir.join("locks/int8_Replay.lock");
        let ttl = chrono::Duration::seconds(3600);

        let lease = LineageLease::acquire(&path, "int8_Replay", ttl).unwrap();
        let second = LineageLease::acquire(&path, "int8_Replay", ttl);
        assert!(matches!(second, Err(EvolveError::LeaseHeld { .. })));

        drop(lease);
        assert!(!path.exists());
        let again = LineageLease::acquire(&path, "int8_Replay", ttl).unwrap();
        assert!(path.exists());
        drop(again);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_stale_lease_taken_over() {
        let dir = test_dir();
        let path = dir.join("locks/uint8_Standard.lock");
        let stale = LeaseRecord {
            owner: "crashed".into(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let ttl = chrono::Duration::seconds(3600);
        let lease = LineageLease::acquire(&path, "uint8_Standard", ttl).unwrap();
        assert_ne!(lease.owner(), "crashed");
        drop(lease);
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
