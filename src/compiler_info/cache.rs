//! Process-wide cache of compiler probe results
//!
//! Maps a structured key (flag digest + working directory + compiler path)
//! to a shared [`CompilerInfoState`]. A secondary index groups keys by
//! payload content hash so that disabling one broken compiler disables it
//! at every call site that reaches the same binary. The cache persists to
//! a single file on shutdown and reloads on start.
//!
//! Thread-safe: a single reader/writer lock guards both indices and all
//! counters. Reference counting on the states themselves is `Arc`, so
//! callers release handles without touching the cache lock.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::compiler_info::state::CompilerInfoState;
use crate::compiler_info::table::{
    CacheFile, CompilerInfoDataTable, DataRecord, KeyEntry, PersistenceError,
};
use crate::compiler_info::{hex_digest, CompilerInfoData};
use crate::file_stat::FileStat;

/// Cache key: one compiler identity within one working directory.
///
/// `base` is an opaque digest of normalized flags and key environment
/// variables. The key renders to a string either cwd-relative or absolute;
/// the cache uses the cwd-relative form exactly when the compiler path is
/// relative (a relative path means the resolved binary depends on the
/// working directory).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub base: String,
    pub cwd: PathBuf,
    pub local_compiler_path: String,
}

impl Key {
    /// Render the key string. `cwd_relative` selects whether the working
    /// directory participates.
    pub fn to_cache_key(&self, cwd_relative: bool) -> String {
        if cwd_relative {
            format!(
                "{} cwd:{} path:{}",
                self.base,
                self.cwd.display(),
                self.local_compiler_path
            )
        } else {
            format!("{} path:{}", self.base, self.abs_local_compiler_path())
        }
    }

    /// The compiler path resolved against `cwd` when relative.
    pub fn abs_local_compiler_path(&self) -> String {
        let path = Path::new(&self.local_compiler_path);
        if path.is_absolute() {
            self.local_compiler_path.clone()
        } else {
            self.cwd.join(path).display().to_string()
        }
    }

    fn is_cwd_relative(&self) -> bool {
        !Path::new(&self.local_compiler_path).is_absolute()
    }

    /// The string form the cache indexes by.
    pub fn cache_key(&self) -> String {
        self.to_cache_key(self.is_cwd_relative())
    }
}

/// Decides whether a cached payload is still usable for the compiler
/// currently on disk. Replaceable for tests via
/// [`CompilerInfoCache::set_validator`].
pub trait CompilerInfoValidator: Send + Sync {
    fn validate(&self, data: &CompilerInfoData, local_compiler_path: &str) -> bool;
}

/// Default validation: the payload recorded a successful probe and none of
/// its resource files have changed underneath it.
pub struct DefaultValidator;

impl CompilerInfoValidator for DefaultValidator {
    fn validate(&self, data: &CompilerInfoData, _local_compiler_path: &str) -> bool {
        if !data.is_valid() {
            return false;
        }
        for resource in &data.resources {
            let current = FileStat::new(&resource.path);
            if !current.is_valid() {
                return false;
            }
            if current != resource.file_stat {
                return false;
            }
            // Structurally equal but inside the mtime granularity window:
            // fall back to comparing file contents.
            if (resource.file_stat.can_be_stale() || current.can_be_stale())
                && !resource.hash.is_empty()
            {
                match hash_file(&resource.path) {
                    Ok(hash) if hash == resource.hash => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

fn hash_file(path: &str) -> Result<String, std::io::Error> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex_digest(hasher))
}

struct Inner {
    validator: Box<dyn CompilerInfoValidator>,

    /// Primary index: rendered key string to state.
    states: HashMap<String, Arc<CompilerInfoState>>,
    /// Secondary index: payload content hash to the keys that alias it.
    /// Failure entries are not registered here.
    keys_by_hash: HashMap<String, HashSet<String>>,

    num_stores: u64,
    num_store_dups: u64,
    num_miss: u64,
    num_fail: u64,
    loaded_size: u64,
    loaded_timestamp: chrono::DateTime<Utc>,
}

/// The compiler-info cache. See the module docs.
pub struct CompilerInfoCache {
    cache_file: CacheFile,
    holding_time: Duration,
    inner: RwLock<Inner>,
}

impl CompilerInfoCache {
    /// Create a cache persisting to `cache_dir/cache_filename`. An empty
    /// filename disables persistence. `holding_time` bounds how long
    /// failure entries are served.
    pub fn new(cache_dir: &Path, cache_filename: &str, holding_time: Duration) -> Self {
        Self {
            cache_file: CacheFile::new(cache_dir, cache_filename),
            holding_time,
            inner: RwLock::new(Inner {
                validator: Box::new(DefaultValidator),
                states: HashMap::new(),
                keys_by_hash: HashMap::new(),
                num_stores: 0,
                num_store_dups: 0,
                num_miss: 0,
                num_fail: 0,
                loaded_size: 0,
                loaded_timestamp: Utc::now(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a key from the flag parser's digest, the working directory,
    /// the compiler path, and the environment variables that affect
    /// compiler behavior.
    pub fn create_key(
        flags_base: &str,
        cwd: &Path,
        local_compiler_path: &str,
        key_envs: &[String],
    ) -> Key {
        let mut hasher = Sha256::new();
        hasher.update(flags_base.as_bytes());
        for env in key_envs {
            hasher.update(b"\n");
            hasher.update(env.as_bytes());
        }
        Key {
            base: hex_digest(hasher),
            cwd: cwd.to_path_buf(),
            local_compiler_path: local_compiler_path.to_string(),
        }
    }

    /// Look up a state, validating it against the compiler currently on
    /// disk. Returns `None` on miss, on an expired failure entry, or when
    /// validation fails (the entry is evicted). The returned handle keeps
    /// the record alive until dropped.
    pub fn lookup(&self, key: &Key) -> Option<Arc<CompilerInfoState>> {
        let cache_key = key.cache_key();
        let abs_path = key.abs_local_compiler_path();

        // Fast path under the shared lock: a hit that needs neither
        // revalidation nor eviction.
        {
            let inner = self.read();
            if let Some(state) = inner.states.get(&cache_key) {
                if let Some(found) = Self::try_fast_lookup(state, &abs_path, self.holding_time) {
                    found.inc_used();
                    return Some(found);
                }
            } else {
                drop(inner);
                self.write().num_miss += 1;
                return None;
            }
        }

        self.lookup_slow(&cache_key, &abs_path)
    }

    /// Returns the state if it can be served without mutating the cache.
    fn try_fast_lookup(
        state: &Arc<CompilerInfoState>,
        abs_path: &str,
        holding_time: Duration,
    ) -> Option<Arc<CompilerInfoState>> {
        if state.is_failure() {
            if failure_fresh(state, holding_time) {
                return Some(state.clone());
            }
            return None;
        }
        let stored = state.local_compiler_stat();
        let current = FileStat::new(abs_path);
        if current.can_be_newer_than(&stored) {
            return None;
        }
        Some(state.clone())
    }

    /// Slow path: revalidate, refresh, or evict under the exclusive lock.
    fn lookup_slow(&self, cache_key: &str, abs_path: &str) -> Option<Arc<CompilerInfoState>> {
        let mut inner = self.write();

        let Some(state) = inner.states.get(cache_key).cloned() else {
            inner.num_miss += 1;
            return None;
        };

        if state.is_failure() {
            if failure_fresh(&state, self.holding_time) {
                state.inc_used();
                return Some(state);
            }
            debug!(key = cache_key, "evicting expired failure entry");
            evict_unlocked(&mut inner, cache_key, &state);
            inner.num_miss += 1;
            return None;
        }

        let stored = state.local_compiler_stat();
        let current = FileStat::new(abs_path);
        if current.can_be_newer_than(&stored) {
            let valid = {
                let data = state.data();
                inner.validator.validate(&data, abs_path)
            };
            if !valid {
                info!(key = cache_key, "compiler changed, evicting cache entry");
                evict_unlocked(&mut inner, cache_key, &state);
                inner.num_miss += 1;
                return None;
            }
            state.refresh_local_compiler_stat(current);
        }

        state.inc_used();
        Some(state)
    }

    /// Store a probe result. If an entry with the same key and the same
    /// content hash already exists, the new data is dropped and the
    /// existing state returned (counted as a duplicate). A new entry whose
    /// payload aliases a disabled compiler is created disabled with the
    /// same reason.
    pub fn store(&self, key: &Key, data: CompilerInfoData) -> Arc<CompilerInfoState> {
        let cache_key = key.cache_key();
        let hash = data.content_hash();
        let failed = data.failed();

        let mut inner = self.write();
        inner.num_stores += 1;
        if failed {
            inner.num_fail += 1;
        }

        if let Some(existing) = inner.states.get(&cache_key).cloned() {
            if existing.content_hash() == hash {
                inner.num_store_dups += 1;
                debug!(key = %cache_key, "duplicate store, keeping existing entry");
                return existing;
            }
            // Same key, new payload: the compiler changed since the old
            // probe. Replace the entry.
            evict_unlocked(&mut inner, &cache_key, &existing);
        }

        let state = Arc::new(CompilerInfoState::new(data));

        // Disable propagation: if any alias of this payload is disabled,
        // the new entry starts disabled with the same reason.
        let alias_reason = inner.keys_by_hash.get(&hash).and_then(|keys| {
            keys.iter()
                .filter_map(|k| inner.states.get(k))
                .find_map(|s| s.disabled_reason())
        });
        if let Some(reason) = alias_reason {
            warn!(key = %cache_key, reason = %reason, "new entry aliases a disabled compiler");
            state.set_disabled(&reason);
        }

        if !failed {
            inner
                .keys_by_hash
                .entry(hash)
                .or_default()
                .insert(cache_key.clone());
        }
        inner.states.insert(cache_key, state.clone());
        state
    }

    /// Disable `state` and every other state whose payload shares its
    /// content hash. Idempotent: the first reason wins. Returns false if
    /// the state was already disabled.
    pub fn disable(&self, state: &CompilerInfoState, reason: &str) -> bool {
        let inner = self.write();
        if !state.set_disabled(reason) {
            return false;
        }
        warn!(hash = state.content_hash(), reason = %reason, "disabling compiler");
        if let Some(keys) = inner.keys_by_hash.get(state.content_hash()) {
            for key in keys {
                if let Some(aliased) = inner.states.get(key) {
                    aliased.set_disabled(reason);
                }
            }
        }
        true
    }

    /// Whether any cached compiler is disabled or no longer matches the
    /// binary on disk.
    pub fn has_compiler_mismatch(&self) -> bool {
        let inner = self.read();
        for state in inner.states.values() {
            if state.disabled() {
                return true;
            }
            let data = state.data();
            if data.failed() {
                continue;
            }
            let current = FileStat::new(&data.local_compiler_path);
            if current != data.local_compiler_stat {
                return true;
            }
        }
        false
    }

    /// Replace the validator. Test seam.
    pub fn set_validator(&self, validator: Box<dyn CompilerInfoValidator>) {
        self.write().validator = validator;
    }

    pub fn count(&self) -> usize {
        self.read().states.len()
    }

    pub fn num_stores(&self) -> u64 {
        self.read().num_stores
    }

    pub fn num_store_dups(&self) -> u64 {
        self.read().num_store_dups
    }

    pub fn num_miss(&self) -> u64 {
        self.read().num_miss
    }

    pub fn num_fail(&self) -> u64 {
        self.read().num_fail
    }

    /// Number of entries that have served at least one lookup.
    pub fn num_used(&self) -> usize {
        self.read().states.values().filter(|s| s.used() > 0).count()
    }

    pub fn loaded_size(&self) -> u64 {
        self.read().loaded_size
    }

    /// Drop every entry. Counters are preserved.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.states.clear();
        inner.keys_by_hash.clear();
    }

    /// Human-readable summary of the cache contents.
    pub fn dump(&self) -> String {
        let inner = self.read();
        let mut out = String::new();
        out.push_str(&format!(
            "CompilerInfoCache: {} entries, {} stores ({} dups), {} misses, {} fails\n",
            inner.states.len(),
            inner.num_stores,
            inner.num_store_dups,
            inner.num_miss,
            inner.num_fail
        ));
        let mut keys: Vec<&String> = inner.states.keys().collect();
        keys.sort();
        for key in keys {
            let state = &inner.states[key];
            let data = state.data();
            out.push_str(&format!(
                "  {} => {} {} used={} {}\n",
                key,
                data.name,
                data.version,
                state.used(),
                match state.disabled_reason() {
                    Some(reason) => format!("disabled: {}", reason),
                    None => "enabled".to_string(),
                }
            ));
        }
        out
    }

    /// JSON view of every cached compiler, for status pages.
    pub fn dump_compilers_json(&self) -> serde_json::Value {
        let inner = self.read();
        let mut compilers = Vec::new();
        for (key, state) in &inner.states {
            let data = state.data();
            compilers.push(json!({
                "key": key,
                "hash": state.content_hash(),
                "name": data.name,
                "version": data.version,
                "target": data.target,
                "local_compiler_path": data.local_compiler_path,
                "failed": data.failed(),
                "disabled": state.disabled(),
                "disabled_reason": state.disabled_reason(),
                "used": state.used(),
            }));
        }
        json!({
            "num_stores": inner.num_stores,
            "num_store_dups": inner.num_store_dups,
            "num_miss": inner.num_miss,
            "num_fail": inner.num_fail,
            "loaded_size": inner.loaded_size,
            "loaded_timestamp": inner.loaded_timestamp.to_rfc3339(),
            "compilers": compilers,
        })
    }

    /// Load the cache file if persistence is configured. Any failure
    /// degrades to an empty cache; never fatal.
    pub fn load_if_enabled(&self) {
        if !self.cache_file.enabled() {
            return;
        }
        let bytes = match self.cache_file.load_bytes() {
            Ok(bytes) => bytes,
            Err(PersistenceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no compiler info cache file yet");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read compiler info cache, starting empty");
                return;
            }
        };
        let table = match CompilerInfoDataTable::from_bytes(&bytes) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "discarding unreadable compiler info cache");
                return;
            }
        };

        {
            let mut inner = self.write();
            unmarshal_unlocked(&mut inner, table);
            inner.loaded_size = bytes.len() as u64;
            inner.loaded_timestamp = Utc::now();
            info!(
                entries = inner.states.len(),
                bytes = bytes.len(),
                "loaded compiler info cache"
            );
        }

        self.update_older_compiler_info();
    }

    /// Serialize the current mapping to the cache file. Entries whose
    /// compiler binary no longer exists are dropped; failure entries are
    /// kept (they are useful negative results).
    pub fn save(&self) -> Result<(), PersistenceError> {
        if !self.cache_file.enabled() {
            return Ok(());
        }
        let table = {
            let inner = self.read();
            marshal_unlocked(&inner, self.holding_time)
        };
        let bytes = table.to_bytes()?;
        self.cache_file.save_bytes(&bytes)?;
        info!(
            entries = table.keys.len(),
            records = table.records.len(),
            "saved compiler info cache"
        );
        Ok(())
    }

    /// Revalidate every loaded entry against the compilers currently on
    /// disk: refresh fingerprints that still validate, evict the rest. Run
    /// after load so a restart never serves dead compilers.
    pub fn update_older_compiler_info(&self) {
        let mut inner = self.write();

        enum Action {
            Keep,
            Refresh(FileStat),
            Evict,
        }

        let mut decisions: Vec<(String, Arc<CompilerInfoState>, Action)> = Vec::new();
        for (key, state) in &inner.states {
            let action = {
                let data = state.data();
                if data.failed() {
                    if failure_fresh(state, self.holding_time) {
                        Action::Keep
                    } else {
                        Action::Evict
                    }
                } else {
                    let current = FileStat::new(&data.local_compiler_path);
                    if !current.is_valid() {
                        Action::Evict
                    } else if current.can_be_newer_than(&data.local_compiler_stat) {
                        if inner.validator.validate(&data, &data.local_compiler_path) {
                            Action::Refresh(current)
                        } else {
                            Action::Evict
                        }
                    } else {
                        Action::Keep
                    }
                }
            };
            if !matches!(action, Action::Keep) {
                decisions.push((key.clone(), state.clone(), action));
            }
        }

        for (key, state, action) in decisions {
            match action {
                Action::Refresh(stat) => state.refresh_local_compiler_stat(stat),
                Action::Evict => {
                    info!(key = %key, "dropping outdated compiler info");
                    evict_unlocked(&mut inner, &key, &state);
                }
                Action::Keep => {}
            }
        }
    }
}

fn failure_fresh(state: &CompilerInfoState, holding_time: Duration) -> bool {
    match state.failure_age() {
        Some(age) => age.to_std().map(|age| age < holding_time).unwrap_or(false),
        None => false,
    }
}

/// Remove an entry from both indices.
fn evict_unlocked(inner: &mut Inner, cache_key: &str, state: &CompilerInfoState) {
    inner.states.remove(cache_key);
    let hash = state.content_hash();
    if let Some(keys) = inner.keys_by_hash.get_mut(hash) {
        keys.remove(cache_key);
        if keys.is_empty() {
            inner.keys_by_hash.remove(hash);
        }
    }
}

fn marshal_unlocked(inner: &Inner, holding_time: Duration) -> CompilerInfoDataTable {
    let mut table = CompilerInfoDataTable::new(holding_time.as_secs());
    let mut recorded: HashSet<String> = HashSet::new();
    let mut keys: Vec<(&String, &Arc<CompilerInfoState>)> = inner.states.iter().collect();
    keys.sort_by(|a, b| a.0.cmp(b.0));
    for (key, state) in keys {
        let data = state.data();
        if !data.failed() && !FileStat::new(&data.local_compiler_path).is_valid() {
            debug!(key = %key, "compiler gone, not persisting entry");
            continue;
        }
        let hash = state.content_hash().to_string();
        table.keys.push(KeyEntry {
            key: key.clone(),
            hash: hash.clone(),
        });
        if recorded.insert(hash.clone()) {
            table.records.push(DataRecord {
                hash,
                data: data.clone(),
                disabled_reason: state.disabled_reason(),
            });
        }
    }
    table
}

fn unmarshal_unlocked(inner: &mut Inner, table: CompilerInfoDataTable) {
    inner.states.clear();
    inner.keys_by_hash.clear();

    let mut pool: HashMap<String, DataRecord> = HashMap::new();
    for record in table.records {
        pool.insert(record.hash.clone(), record);
    }

    for entry in table.keys {
        let Some(record) = pool.get(&entry.hash) else {
            warn!(key = %entry.key, "cache file references missing record, skipping");
            continue;
        };
        let state = Arc::new(CompilerInfoState::new(record.data.clone()));
        if let Some(reason) = &record.disabled_reason {
            state.set_disabled(reason);
        }
        if !record.data.failed() {
            inner
                .keys_by_hash
                .entry(state.content_hash().to_string())
                .or_default()
                .insert(entry.key.clone());
        }
        inner.states.insert(entry.key, state);
    }
}

// === Process-wide singleton ===
//
// The cache is a process singleton in production. It is created by
// `init`, torn down by `quit`, and never constructed during static
// initialization. Tests use `CompilerInfoCache::new` directly.

static INSTANCE: RwLock<Option<Arc<CompilerInfoCache>>> = RwLock::new(None);

/// Initialize the process-wide cache. Panics if called again before
/// [`quit`]; that is a programming error, not a runtime condition.
pub fn init(cache_dir: &Path, cache_filename: &str, holding_time: Duration) {
    let mut guard = INSTANCE.write().unwrap_or_else(PoisonError::into_inner);
    assert!(
        guard.is_none(),
        "compiler info cache initialized twice without quit"
    );
    *guard = Some(Arc::new(CompilerInfoCache::new(
        cache_dir,
        cache_filename,
        holding_time,
    )));
}

/// Load the process-wide cache from disk, if one is initialized and
/// persistence is configured.
pub fn load_if_enabled() {
    if let Some(cache) = instance() {
        cache.load_if_enabled();
    }
}

/// The process-wide cache, if initialized.
pub fn instance() -> Option<Arc<CompilerInfoCache>> {
    INSTANCE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Save and release the process-wide cache.
pub fn quit() {
    let cache = INSTANCE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(cache) = cache {
        if let Err(e) = cache.save() {
            warn!(error = %e, "failed to save compiler info cache on quit");
        }
    }
}
