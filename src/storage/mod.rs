//! Artifact storage: the on-disk tree is the single source of truth
//!
//! Every artifact is written with write-temp-then-rename so a crash never
//! leaves a truncated file where a later stage would find it. Existence of a
//! file therefore means the stage that produced it finished.

pub mod layout;
pub mod ledger;

pub use layout::ModelsLayout;
pub use ledger::{LineageLease, StageLedger};

use crate::error::{EvolveError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Write `data` to `path` atomically, creating parent directories
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let wrap = |source| EvolveError::WriteFailure {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(wrap(e));
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        wrap(e)
    })
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Write only if nothing exists at `path` yet. Returns whether a write happened.
pub fn write_json_once<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_json_atomic(path, value)?;
    Ok(true)
}

/// Read and parse a JSON file, reporting parse failures as `Malformed`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| EvolveError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Copy a file's bytes atomically
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<()> {
    let data = std::fs::read(src)?;
    write_atomic(dst, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("spectrum-storage-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_write_atomic_creates_parents() {
        let dir = test_dir();
        let path = dir.join("a/b/c.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");

        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.join("a/b"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_write_json_once_skips_existing() {
        let dir = test_dir();
        let path = dir.join("once.json");
        assert!(write_json_once(&path, &vec![1, 2, 3]).unwrap());
        assert!(!write_json_once(&path, &vec![9]).unwrap());
        let back: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_read_json_malformed() {
        let dir = test_dir();
        let path = dir.join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_json::<Vec<i32>>(&path).unwrap_err();
        assert!(matches!(err, EvolveError::Malformed { .. }));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_copy_atomic() {
        let dir = test_dir();
        let src = dir.join("src.json");
        let dst = dir.join("nested/dst.json");
        std::fs::write(&src, b"payload").unwrap();
        copy_atomic(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
