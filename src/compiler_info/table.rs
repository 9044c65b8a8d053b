//! On-disk form of the compiler-info cache
//!
//! The cache serializes to a single JSON file: a deduplicated pool of
//! payload records keyed by content hash, the key-to-hash index on top of
//! it, and a little process metadata. Writes go through a temp file and
//! rename so a crash never leaves a torn cache; reads treat any parse or
//! schema problem as "start empty".

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compiler_info::CompilerInfoData;

/// Schema version for the cache file.
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier written into every cache file.
pub const SCHEMA_ID: &str = "offload/compiler_info_cache@1";

/// Errors from cache persistence.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported schema: found {found}, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
}

/// One primary-index entry: a rendered key string and the content hash of
/// the payload it maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: String,
    pub hash: String,
}

/// One value-pool record. Deduplicated by hash: every key in the alias
/// class points at the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRecord {
    pub hash: String,
    pub data: CompilerInfoData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

/// The serialized cache: primary index, value pool, holding time, and
/// process metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerInfoDataTable {
    pub schema_version: u32,
    pub schema_id: String,
    pub keys: Vec<KeyEntry>,
    pub records: Vec<DataRecord>,
    pub holding_time_secs: u64,
    pub saved_at: DateTime<Utc>,
}

impl CompilerInfoDataTable {
    pub fn new(holding_time_secs: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            keys: Vec::new(),
            records: Vec::new(),
            holding_time_secs,
            saved_at: Utc::now(),
        }
    }

    /// Parse a table from file bytes, rejecting unknown schemas.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let table: CompilerInfoDataTable = serde_json::from_slice(bytes)?;
        if table.schema_version != SCHEMA_VERSION {
            return Err(PersistenceError::SchemaMismatch {
                found: table.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(table)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// The cache file location. An unset filename disables persistence
/// entirely; load and save become no-ops.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: Option<PathBuf>,
}

impl CacheFile {
    /// Build from a cache directory and filename. An empty filename
    /// disables persistence.
    pub fn new(cache_dir: &Path, cache_filename: &str) -> Self {
        let path = if cache_filename.is_empty() {
            None
        } else {
            Some(join_path_respect_absolute(cache_dir, cache_filename))
        };
        Self { path }
    }

    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the whole cache file.
    pub fn load_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        match &self.path {
            Some(path) => Ok(fs::read(path)?),
            None => Ok(Vec::new()),
        }
    }

    /// Atomically replace the cache file: write `<path>.tmp`, then rename
    /// over the target.
    pub fn save_bytes(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Join `filename` onto `dir` unless it is already absolute.
fn join_path_respect_absolute(dir: &Path, filename: &str) -> PathBuf {
    let candidate = Path::new(filename);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        dir.join(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_filename_disables_persistence() {
        let file = CacheFile::new(Path::new("/tmp"), "");
        assert!(!file.enabled());
        assert!(file.save_bytes(b"data").is_ok());
        assert!(file.load_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_absolute_filename_ignores_dir() {
        let file = CacheFile::new(Path::new("/cache"), "/elsewhere/cache.json");
        assert_eq!(file.path().unwrap(), Path::new("/elsewhere/cache.json"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = CacheFile::new(dir.path(), "compiler_info.json");

        let table = CompilerInfoDataTable::new(3600);
        let bytes = table.to_bytes().unwrap();
        file.save_bytes(&bytes).unwrap();

        let loaded = CompilerInfoDataTable::from_bytes(&file.load_bytes().unwrap()).unwrap();
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert_eq!(loaded.schema_id, SCHEMA_ID);
        assert_eq!(loaded.holding_time_secs, 3600);
    }

    #[test]
    fn test_save_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let file = CacheFile::new(dir.path(), "compiler_info.json");
        file.save_bytes(b"{}").unwrap();
        assert!(!dir.path().join("compiler_info.tmp").exists());
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let table = CompilerInfoDataTable::new(60);
        let mut bytes = table.to_bytes().unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(CompilerInfoDataTable::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_schema_drift_is_rejected() {
        let mut table = CompilerInfoDataTable::new(60);
        table.schema_version = 99;
        let bytes = table.to_bytes().unwrap();
        assert!(matches!(
            CompilerInfoDataTable::from_bytes(&bytes),
            Err(PersistenceError::SchemaMismatch { found: 99, .. })
        ));
    }
}
