use rustc_hash::FxHashSet;

use crate::{config::Config, name::{is_path_prefix, path_cat}};

/// Ignore rules for a root: fully ignored directories plus VCS control
/// directories, which are skipped during crawls except when one of them
/// serves as the cookie directory.
#[derive(Debug, Default)]
pub struct IgnoreSet {
    ignore_dirs: FxHashSet<String>,
    ignore_vcs: FxHashSet<String>,
}

impl IgnoreSet {
    pub fn new(root_path: &str, config: &Config) -> Self {
        let mut set = Self::default();
        for dir in &config.ignore_dirs {
            set.ignore_dirs.insert(path_cat(root_path, dir));
        }
        for name in &config.ignore_vcs {
            set.ignore_vcs.insert(path_cat(root_path, name));
        }
        set
    }

    pub fn add_ignore_dir(&mut self, path: impl Into<String>) {
        self.ignore_dirs.insert(path.into());
    }

    /// True when `path` is one of the ignore dirs or lives below one.
    pub fn is_ignore_dir(&self, path: &str) -> bool {
        self.ignore_dirs
            .iter()
            .any(|dir| is_path_prefix(path, dir))
    }

    /// True when `path` is a VCS control dir or lives below one.
    pub fn is_ignore_vcs(&self, path: &str) -> bool {
        self.ignore_vcs
            .iter()
            .any(|dir| is_path_prefix(path, dir))
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.is_ignore_dir(path) || self.is_ignore_vcs(path)
    }

    pub fn vcs_dirs(&self) -> impl Iterator<Item = &str> {
        self.ignore_vcs.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_semantics() {
        let mut config = Config::default();
        config.ignore_dirs = vec!["node_modules".into()];
        let ignore = IgnoreSet::new("/r", &config);

        assert!(ignore.is_ignore_dir("/r/node_modules"));
        assert!(ignore.is_ignore_dir("/r/node_modules/pkg/index.js"));
        assert!(!ignore.is_ignore_dir("/r/node_modules_backup"));
        assert!(!ignore.is_ignore_dir("/r/src"));

        assert!(ignore.is_ignore_vcs("/r/.git"));
        assert!(ignore.is_ignore_vcs("/r/.git/objects/ab"));
        assert!(!ignore.is_ignore_vcs("/r/.github"));
        assert!(ignore.is_ignored("/r/.hg"));
    }
}
