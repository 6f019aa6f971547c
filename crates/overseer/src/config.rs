use std::{fs, io, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Per-root configuration knobs.
///
/// Loaded from an optional JSON file at the root; unknown keys are ignored so
/// that configuration written for richer builds keeps working.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settle window: how long the pending collection must stay empty before
    /// the root is considered settled.
    pub settle_ms: u64,
    /// Don't age out more often than this. Zero disables age-out.
    pub gc_interval_secs: u64,
    /// When aging out, prune deleted nodes older than this.
    pub gc_age_secs: u64,
    /// Reap the watch after this much idle time. Zero disables reaping.
    pub idle_reap_age_secs: u64,
    /// Size hint for per-directory file maps during crawl.
    pub hint_num_files_per_dir: usize,
    pub content_hash_max_items: usize,
    pub symlink_target_max_items: usize,
    pub content_hash_negative_cache_ttl_ms: u64,
    /// Warm the content hash cache for recently changed files on settle.
    pub content_hash_warming: bool,
    pub content_hash_max_warm_per_settle: usize,
    /// Wait for warmed hashes before dispatching the settle broadcast.
    pub content_hash_warm_wait_before_settle: bool,
    /// Watch the targets of symlinks found inside the root.
    pub watch_symlinks: bool,
    /// Sleep before processing notifications, for kernels that emit events
    /// before the page cache is consistent.
    pub notify_sleep_ms: u64,
    pub sync_timeout_default_ms: u64,
    /// Directory names (relative to the root) that are never examined.
    pub ignore_dirs: Vec<String>,
    /// VCS control directories; ignored except for the cookie directory.
    pub ignore_vcs: Vec<String>,
    /// Filesystem types that refuse to be watched.
    pub illegal_fstypes: Vec<String>,
    /// If non-empty, at least one of these files must exist at the root.
    pub root_restrict_files: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settle_ms: 20,
            gc_interval_secs: 86400,
            gc_age_secs: 86400 / 2,
            idle_reap_age_secs: 0,
            hint_num_files_per_dir: 64,
            content_hash_max_items: 128 * 1024,
            symlink_target_max_items: 32 * 1024,
            content_hash_negative_cache_ttl_ms: 2000,
            content_hash_warming: false,
            content_hash_max_warm_per_settle: 1024,
            content_hash_warm_wait_before_settle: false,
            watch_symlinks: false,
            notify_sleep_ms: 0,
            sync_timeout_default_ms: 60_000,
            ignore_dirs: Vec::new(),
            ignore_vcs: vec![".git".into(), ".hg".into(), ".svn".into()],
            illegal_fstypes: Vec::new(),
            root_restrict_files: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the config file if it exists, falling back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn gc_age(&self) -> Duration {
        Duration::from_secs(self.gc_age_secs)
    }

    pub fn idle_reap_age(&self) -> Duration {
        Duration::from_secs(self.idle_reap_age_secs)
    }

    pub fn error_ttl(&self) -> Duration {
        Duration::from_millis(self.content_hash_negative_cache_ttl_ms)
    }

    pub fn default_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_default_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.settle(), Duration::from_millis(20));
        assert_eq!(config.gc_interval(), Duration::from_secs(86400));
        assert_eq!(config.gc_age(), Duration::from_secs(43200));
        assert!(config.ignore_vcs.contains(&".git".to_string()));
    }

    #[test]
    fn load_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"settle_ms": 5, "some_future_knob": true}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.settle_ms, 5);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.settle_ms, 20);
    }
}
