//! Shared cached record for one compiler identity

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};

use chrono::Utc;

use crate::compiler_info::CompilerInfoData;
use crate::file_stat::FileStat;

/// The value side of the compiler-info cache.
///
/// States are shared as `Arc<CompilerInfoState>`: the cache holds one
/// reference for as long as the entry is indexed, and every successful
/// lookup hands the caller another. Dropping the handle releases the
/// caller's reference; the record is freed once the cache has also evicted
/// it.
///
/// The payload is immutable except for the compiler fingerprint, which the
/// cache refreshes in place after revalidating an entry.
pub struct CompilerInfoState {
    data: RwLock<CompilerInfoData>,
    /// Content hash of the payload, fixed at creation.
    hash: String,
    /// First-writer-wins disable reason. `None` while enabled.
    disabled: Mutex<Option<String>>,
    used: AtomicU64,
}

impl CompilerInfoState {
    pub(crate) fn new(data: CompilerInfoData) -> Self {
        let hash = data.content_hash();
        Self {
            data: RwLock::new(data),
            hash,
            disabled: Mutex::new(None),
            used: AtomicU64::new(0),
        }
    }

    /// Read access to the payload.
    pub fn data(&self) -> RwLockReadGuard<'_, CompilerInfoData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Content hash of the payload.
    pub fn content_hash(&self) -> &str {
        &self.hash
    }

    /// Whether this entry records a failed probe.
    pub fn is_failure(&self) -> bool {
        self.data().failed()
    }

    /// Age of a failure entry, `None` for successful probes.
    pub fn failure_age(&self) -> Option<chrono::Duration> {
        self.data().failed_at.map(|t| Utc::now() - t)
    }

    pub fn disabled(&self) -> bool {
        self.disabled_reason().is_some()
    }

    pub fn disabled_reason(&self) -> Option<String> {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark this state disabled. The first reason sticks; later calls are
    /// no-ops and return false.
    pub(crate) fn set_disabled(&self, reason: &str) -> bool {
        let mut guard = self.disabled.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason.to_string());
        true
    }

    /// How many lookups returned this state.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_used(&self) {
        self.used.fetch_add(1, Ordering::Relaxed);
    }

    /// Fingerprint of the compiler binary as stored in the payload.
    pub fn local_compiler_stat(&self) -> FileStat {
        self.data().local_compiler_stat.clone()
    }

    /// Replace the stored compiler fingerprint after revalidation.
    pub(crate) fn refresh_local_compiler_stat(&self, stat: FileStat) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .local_compiler_stat = stat;
    }
}

impl std::fmt::Debug for CompilerInfoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerInfoState")
            .field("hash", &self.hash)
            .field("disabled", &self.disabled_reason())
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler_info::CompilerInfoData;

    fn state() -> CompilerInfoState {
        let mut data = CompilerInfoData::new("/usr/bin/cc");
        data.version = "1.0".to_string();
        CompilerInfoState::new(data)
    }

    #[test]
    fn test_first_disable_reason_wins() {
        let s = state();
        assert!(s.set_disabled("first"));
        assert!(!s.set_disabled("second"));
        assert_eq!(s.disabled_reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_used_counter() {
        let s = state();
        assert_eq!(s.used(), 0);
        s.inc_used();
        s.inc_used();
        assert_eq!(s.used(), 2);
    }

    #[test]
    fn test_stat_refresh_keeps_hash() {
        let s = state();
        let hash = s.content_hash().to_string();
        s.refresh_local_compiler_stat(FileStat::invalid());
        assert_eq!(s.content_hash(), hash);
        assert_eq!(s.data().content_hash(), hash);
    }
}
