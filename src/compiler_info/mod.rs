//! Compiler identity payloads and their cache
//!
//! A `CompilerInfoData` describes everything the remote executor needs to
//! know about one local compiler: version, target, built-in macros, system
//! include paths, and the resource files the compiler reads at runtime.
//! Probing a compiler for this information is expensive, so results
//! (failed probes included) are cached in [`cache::CompilerInfoCache`]
//! and persisted across restarts.

pub mod cache;
pub mod state;
pub mod table;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::file_stat::FileStat;

/// A file the compiler reads at runtime (resource directory contents,
/// linked shared objects, wrapper scripts). Tracked so a cached probe can
/// be invalidated when the compiler installation changes underneath it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFile {
    /// Path as recorded by the prober.
    pub path: String,
    /// Hex SHA-256 of the file contents at probe time.
    pub hash: String,
    /// Fingerprint at probe time.
    pub file_stat: FileStat,
}

/// The result of probing one compiler binary under one set of flags.
///
/// Treated as immutable once stored, with one exception: the cache
/// refreshes `local_compiler_stat` in place after revalidating an entry.
/// The refreshable fingerprints are therefore excluded from
/// [`CompilerInfoData::content_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerInfoData {
    /// Compiler path as it appeared in the invocation.
    pub local_compiler_path: String,
    /// Fingerprint of the compiler binary at probe time.
    pub local_compiler_stat: FileStat,
    /// Hex SHA-256 of the compiler binary.
    pub local_compiler_hash: String,

    /// Compiler family, e.g. "gcc" or "clang".
    pub name: String,
    pub version: String,
    /// Target triple, e.g. "x86_64-unknown-linux-gnu".
    pub target: String,
    /// Source language, e.g. "c++".
    pub lang: String,

    /// Predefined macro lines as the compiler reports them.
    #[serde(default)]
    pub predefined_macros: Vec<String>,
    #[serde(default)]
    pub system_include_paths: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceFile>,

    /// Set when the probe failed. Failed probes are cached as negative
    /// entries and age out after the cache holding time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Identity-stable view serialized for content hashing. Excludes the
/// refreshable `FileStat` fingerprints and the failure timestamp.
#[derive(Serialize)]
struct HashInput<'a> {
    local_compiler_path: &'a str,
    local_compiler_hash: &'a str,
    name: &'a str,
    version: &'a str,
    target: &'a str,
    lang: &'a str,
    predefined_macros: &'a [String],
    system_include_paths: &'a [String],
    resources: Vec<(&'a str, &'a str)>,
    failed: bool,
    error_message: Option<&'a str>,
}

impl CompilerInfoData {
    /// Create a payload for a compiler that was found at `path`.
    /// The prober fills in the identity fields afterwards.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let local_compiler_stat = FileStat::new(&path);
        Self {
            local_compiler_path: path,
            local_compiler_stat,
            local_compiler_hash: String::new(),
            name: String::new(),
            version: String::new(),
            target: String::new(),
            lang: String::new(),
            predefined_macros: Vec::new(),
            system_include_paths: Vec::new(),
            resources: Vec::new(),
            failed_at: None,
            error_message: None,
        }
    }

    /// Create a negative entry recording a failed probe.
    pub fn failure(path: impl Into<String>, message: impl Into<String>) -> Self {
        let mut data = Self::new(path);
        data.failed_at = Some(Utc::now());
        data.error_message = Some(message.into());
        data
    }

    /// Whether this payload records a failed probe.
    pub fn failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Whether the payload itself is usable (probe succeeded).
    pub fn is_valid(&self) -> bool {
        !self.failed()
    }

    /// Stable, cheap-to-recompute digest of the compiler identity.
    ///
    /// Keys that resolve to payloads with equal hashes form one alias
    /// class: the same physical compiler reached through different working
    /// directories or flag permutations.
    pub fn content_hash(&self) -> String {
        let input = HashInput {
            local_compiler_path: &self.local_compiler_path,
            local_compiler_hash: &self.local_compiler_hash,
            name: &self.name,
            version: &self.version,
            target: &self.target,
            lang: &self.lang,
            predefined_macros: &self.predefined_macros,
            system_include_paths: &self.system_include_paths,
            resources: self
                .resources
                .iter()
                .map(|r| (r.path.as_str(), r.hash.as_str()))
                .collect(),
            failed: self.failed(),
            error_message: self.error_message.as_deref(),
        };
        // Struct serialization order is fixed, so the JSON bytes are a
        // canonical form.
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex_digest(hasher)
    }
}

/// Hex-encode a finished SHA-256 digest.
pub(crate) fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> CompilerInfoData {
        let mut data = CompilerInfoData::new("/usr/bin/clang");
        data.name = "clang".to_string();
        data.version = "17.0.1".to_string();
        data.target = "x86_64-unknown-linux-gnu".to_string();
        data.lang = "c++".to_string();
        data.predefined_macros = vec!["#define __clang__ 1".to_string()];
        data.system_include_paths = vec!["/usr/include".to_string()];
        data
    }

    #[test]
    fn test_content_hash_stable() {
        let data = sample_data();
        assert_eq!(data.content_hash(), data.content_hash());
    }

    #[test]
    fn test_content_hash_ignores_stat_refresh() {
        let mut data = sample_data();
        let before = data.content_hash();
        data.local_compiler_stat = FileStat::invalid();
        assert_eq!(before, data.content_hash());
    }

    #[test]
    fn test_content_hash_differs_by_version() {
        let a = sample_data();
        let mut b = sample_data();
        b.version = "18.0.0".to_string();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_failure_entry() {
        let data = CompilerInfoData::failure("/usr/bin/badcc", "exec failed");
        assert!(data.failed());
        assert!(!data.is_valid());
        assert_eq!(data.error_message.as_deref(), Some("exec failed"));
    }

    #[test]
    fn test_failure_hash_differs_from_success() {
        let ok = sample_data();
        let mut failed = sample_data();
        failed.failed_at = Some(Utc::now());
        assert_ne!(ok.content_hash(), failed.content_hash());
    }

    #[test]
    fn test_serde_round_trip() {
        let data = sample_data();
        let json = serde_json::to_string(&data).unwrap();
        let parsed: CompilerInfoData = serde_json::from_str(&json).unwrap();
        assert_eq!(data, parsed);
        assert_eq!(data.content_hash(), parsed.content_hash());
    }
}
