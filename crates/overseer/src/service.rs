use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::{
    config::Config,
    errors::RootError,
    name::is_path_prefix,
    query::ExprRegistry,
    root::Root,
    watcher::{NotifyWatcher, Watcher},
    ClockId,
};

/// Name of the optional per-root configuration file.
pub const CONFIG_FILENAME: &str = ".overseerrc";

/// Owns every watched root, the process-wide clock identity and the
/// expression-term registry. The explicit replacement for process-global
/// state: command handlers thread a `Service` through instead.
pub struct Service {
    config: Arc<Config>,
    clock_id: Arc<ClockId>,
    roots: Mutex<FxHashMap<String, Arc<Root>>>,
    /// Root numbers are process-lifetime unique and never reused, even
    /// after a root is reaped and re-watched.
    next_root_number: AtomicU32,
    registry: ExprRegistry,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            clock_id: Arc::new(ClockId::new()),
            roots: Mutex::new(FxHashMap::default()),
            next_root_number: AtomicU32::new(1),
            registry: ExprRegistry::new(),
        }
    }

    pub fn clock_id(&self) -> &Arc<ClockId> {
        &self.clock_id
    }

    pub fn registry(&self) -> &ExprRegistry {
        &self.registry
    }

    pub fn capabilities(&self) -> Vec<String> {
        crate::query::capabilities(Some(&self.registry))
    }

    /// Resolves `path` to a watched root. An existing watch on the path or
    /// on any ancestor is reused; otherwise, when `auto_watch` is set, a
    /// new root is created and its threads started.
    pub fn resolve_root(&self, path: &Path, auto_watch: bool) -> Result<Arc<Root>, RootError> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|_| RootError::NotADirectory(path.display().to_string()))?;
        let canonical_str = canonical
            .to_str()
            .ok_or_else(|| RootError::NotADirectory(path.display().to_string()))?
            .trim_end_matches('/')
            .to_owned();

        {
            let mut roots = self.roots.lock();
            roots.retain(|_, root| !root.is_cancelled());
            if let Some(root) = roots.get(&canonical_str) {
                root.note_cmd();
                return Ok(Arc::clone(root));
            }
            // An enclosing watch covers this path.
            if let Some(root) = roots
                .values()
                .find(|root| is_path_prefix(&canonical_str, root.root_path()))
            {
                root.note_cmd();
                return Ok(Arc::clone(root));
            }
        }

        if !auto_watch {
            return Err(RootError::NotADirectory(format!(
                "{canonical_str} is not watched"
            )));
        }

        // A config file at the root overrides the service-wide settings.
        let config_path = canonical.join(CONFIG_FILENAME);
        let config = if config_path.exists() {
            match Config::load(&config_path) {
                Ok(config) => Arc::new(config),
                Err(err) => {
                    return Err(RootError::WatcherTerminal {
                        path: canonical_str,
                        reason: err.to_string(),
                    });
                }
            }
        } else {
            Arc::clone(&self.config)
        };

        let watcher: Arc<dyn Watcher> = Arc::new(NotifyWatcher::new());
        let root_number = self.next_root_number.fetch_add(1, Ordering::AcqRel);
        let root = Root::open(
            &canonical,
            config,
            watcher,
            root_number,
            Arc::clone(&self.clock_id),
        )?;

        Arc::clone(root.engine()).start_threads(&root);

        let mut roots = self.roots.lock();
        roots.insert(canonical_str, Arc::clone(&root));
        Ok(root)
    }

    pub fn watched_roots(&self) -> Vec<Arc<Root>> {
        self.roots.lock().values().cloned().collect()
    }

    /// Stops watching `path`. Returns whether a watch was removed.
    pub fn remove_root(&self, path: &str) -> bool {
        let removed = self.roots.lock().remove(path.trim_end_matches('/'));
        match removed {
            Some(root) => {
                root.stop_watch();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let roots: Vec<Arc<Root>> = {
            let mut map = self.roots.lock();
            map.drain().map(|(_, root)| root).collect()
        };
        for root in roots {
            info!(root = %root.root_path(), "stopping watch");
            root.stop_watch();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::query::{self, Query};

    /// End-to-end through the real watcher and both background threads.
    #[test]
    fn watch_query_and_incremental_change() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present.txt"), b"hello").unwrap();

        let service = Service::new(Config::default());
        let root = service.resolve_root(dir.path(), true).unwrap();

        let ready = root.engine().wait_until_ready_to_query(&root);
        ready
            .recv_timeout(Duration::from_secs(10))
            .expect("initial crawl should complete");

        let spec = json!({"expression": ["exists"], "fields": ["name"]});
        let query = Query::parse(&root, &spec, None).unwrap();
        let first = query::execute(&root, &query).unwrap();
        assert!(first.is_fresh_instance);
        assert_eq!(first.files, vec![serde_json::Value::String("present.txt".into())]);

        fs::write(dir.path().join("added.txt"), b"world").unwrap();

        let spec = json!({
            "since": first.clock,
            "expression": ["exists"],
            "fields": ["name"],
        });
        let query = Query::parse(&root, &spec, None).unwrap();
        let second = query::execute(&root, &query).unwrap();
        assert!(!second.is_fresh_instance);
        assert_eq!(
            second.files,
            vec![serde_json::Value::String("added.txt".into())]
        );

        // Resolving again reuses the same watch, as does a subdirectory.
        let again = service.resolve_root(dir.path(), false).unwrap();
        assert_eq!(again.root_path(), root.root_path());

        service.stop_all();
        assert!(root.is_cancelled());
    }

    #[test]
    fn resolve_unwatched_without_auto_watch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = Service::new(Config::default());
        assert!(service.resolve_root(dir.path(), false).is_err());
    }

    #[test]
    fn root_numbers_are_never_reused() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let service = Service::new(Config::default());

        let a = service.resolve_root(dir_a.path(), true).unwrap();
        let clock_a = a.current_clock_string();
        service.remove_root(a.root_path());

        let b = service.resolve_root(dir_b.path(), true).unwrap();
        let clock_b = b.current_clock_string();

        // c:<start>:<root_number>:<unique>:<tick>
        let number = |clock: &str| clock.split(':').nth(2).unwrap().parse::<u32>().unwrap();
        assert_ne!(number(&clock_a), number(&clock_b));

        service.stop_all();
    }
}
