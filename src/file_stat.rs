//! File identity fingerprints
//!
//! A `FileStat` captures the observable identity of a file at a point in
//! time: size, modification time, and whether it is a directory. Cached
//! compiler records carry these fingerprints so that a later invocation can
//! ask "could this file have changed since I looked?" without re-reading
//! file contents.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel size for files that could not be stat'ed.
pub const INVALID_FILE_SIZE: i64 = -1;

/// A point-in-time fingerprint of a file.
///
/// Equality is structural over `(size, mtime, is_directory)`; `taken_at`
/// records when the fingerprint was captured and participates only in the
/// staleness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStat {
    /// File size in bytes, or [`INVALID_FILE_SIZE`] if the stat failed.
    pub size: i64,

    /// Modification time. `None` if the stat failed or the filesystem did
    /// not report one.
    pub mtime: Option<DateTime<Utc>>,

    /// Whether the path refers to a directory.
    pub is_directory: bool,

    /// When this fingerprint was captured.
    pub taken_at: DateTime<Utc>,
}

impl FileStat {
    /// Stat `path` and capture its fingerprint.
    ///
    /// Missing or unreadable files yield the invalid sentinel rather than
    /// an error; callers distinguish via [`FileStat::is_valid`].
    pub fn new(path: impl AsRef<Path>) -> Self {
        let taken_at = Utc::now();
        match fs::metadata(path.as_ref()) {
            Ok(meta) => Self {
                size: meta.len() as i64,
                mtime: meta.modified().ok().map(DateTime::<Utc>::from),
                is_directory: meta.is_dir(),
                taken_at,
            },
            Err(_) => Self::invalid_at(taken_at),
        }
    }

    /// An invalid fingerprint captured now. Used as the sentinel for
    /// missing files.
    pub fn invalid() -> Self {
        Self::invalid_at(Utc::now())
    }

    fn invalid_at(taken_at: DateTime<Utc>) -> Self {
        Self {
            size: INVALID_FILE_SIZE,
            mtime: None,
            is_directory: false,
            taken_at,
        }
    }

    /// Whether the stat succeeded.
    pub fn is_valid(&self) -> bool {
        self.size != INVALID_FILE_SIZE && self.mtime.is_some()
    }

    /// Whether the file could have been modified after this fingerprint
    /// was taken.
    ///
    /// Filesystems with one-second mtime granularity cannot distinguish a
    /// write that landed just before the stat from one that landed just
    /// after, and virtualized clocks may lag by about a second, so a file
    /// whose mtime falls within one second of `taken_at` must be
    /// re-checked.
    pub fn can_be_stale(&self) -> bool {
        match self.mtime {
            Some(mtime) => mtime + Duration::seconds(1) >= self.taken_at,
            // Invalid stats carry no mtime; treat them as always suspect.
            None => true,
        }
    }

    /// Whether `self` (a fresh stat) could be newer than `old` (a stored
    /// one). True when `old` is in the staleness window or the two differ
    /// structurally.
    pub fn can_be_newer_than(&self, old: &FileStat) -> bool {
        old.can_be_stale() || self != old
    }
}

impl PartialEq for FileStat {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self.mtime == other.mtime
            && self.is_directory == other.is_directory
    }
}

impl Eq for FileStat {}

impl fmt::Display for FileStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ mtime=")?;
        match self.mtime {
            Some(mtime) => write!(f, "{}", mtime)?,
            None => write!(f, "not set")?,
        }
        write!(
            f,
            " size={} is_directory={} }}",
            self.size, self.is_directory
        )
    }
}
