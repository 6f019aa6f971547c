use std::{
    collections::VecDeque,
    fs, io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::{
    clock::{ClockId, ClockPosition, QuerySince, SinceSpec},
    config::Config,
    cookies::CookieSync,
    engine::InMemoryView,
    errors::{CookieSyncError, QueryExecError, RootError},
    ignore::IgnoreSet,
    pending::PendingFlags,
    publisher::Publisher,
    watcher::{Watcher, WatcherCaps},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSensitivity {
    CaseSensitive,
    CaseInSensitive,
}

impl CaseSensitivity {
    /// What the host platform's default filesystem does.
    pub fn platform_default() -> Self {
        if cfg!(any(target_os = "macos", target_os = "windows")) {
            Self::CaseInSensitive
        } else {
            Self::CaseSensitive
        }
    }
}

#[derive(Debug, Default)]
pub struct RecrawlInfo {
    pub recrawl_count: u32,
    /// Set when we have decided to re-crawl the root for consistency.
    pub should_recrawl: bool,
    /// Last ad-hoc warning message.
    pub warning: Option<String>,
    pub crawl_start: Option<Instant>,
    pub crawl_finish: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateDisposition {
    PendingEnter,
    Asserted,
}

#[derive(Debug)]
struct StateAssertion {
    metadata: Option<Value>,
    disposition: StateDisposition,
}

/// FIFO queues of client state assertions, keyed by state name. The front
/// assertion of each queue is the asserted one; its enter payload is
/// broadcast when it reaches the front.
#[derive(Default)]
struct AssertedStates {
    states: FxHashMap<String, VecDeque<StateAssertion>>,
}

/// A watched root: the per-root lifecycle, policy and bookkeeping around
/// the in-memory view.
pub struct Root {
    root_path: String,
    pub fs_type: String,
    pub case_sensitive: CaseSensitivity,
    pub config: Arc<Config>,
    pub cookies: CookieSync,
    pub ignore: IgnoreSet,
    pub unilateral: Publisher,

    engine: Arc<InMemoryView>,
    clock_id: Arc<ClockId>,

    recrawl_info: Mutex<RecrawlInfo>,
    /// Named since-cursors: cursor name -> last observed tick.
    cursors: Mutex<FxHashMap<String, u32>>,
    asserted_states: Mutex<AssertedStates>,
    state_trans_count: AtomicU32,

    cancelled: AtomicBool,
    failure_reason: Mutex<Option<String>>,
    /// Set on system-wide resource exhaustion; queries fail until restart.
    poison: Mutex<Option<String>>,

    last_cmd_at: Mutex<Instant>,
}

impl Root {
    /// Opens a root without starting its threads: canonicalizes and checks
    /// the path, applies the resolve-time policy checks, and builds the
    /// engine. `Service::resolve_root` layers watching on top.
    pub fn open(
        path: &Path,
        config: Arc<Config>,
        watcher: Arc<dyn Watcher>,
        root_number: u32,
        clock_id: Arc<ClockId>,
    ) -> Result<Arc<Self>, RootError> {
        let canonical = fs::canonicalize(path)
            .map_err(|_| RootError::NotADirectory(path.display().to_string()))?;
        if !canonical.is_dir() {
            return Err(RootError::NotADirectory(path.display().to_string()));
        }
        let root_path = canonical
            .to_str()
            .ok_or_else(|| RootError::NotADirectory(path.display().to_string()))?
            .trim_end_matches('/')
            .to_owned();

        if !config.root_restrict_files.is_empty() {
            let satisfied = config
                .root_restrict_files
                .iter()
                .any(|name| canonical.join(name).exists());
            if !satisfied {
                return Err(RootError::RestrictionFailed { path: root_path });
            }
        }

        // Filesystem type detection is platform-specific; "unknown" never
        // trips the allowlist.
        let fs_type = "unknown".to_owned();
        if config.illegal_fstypes.iter().any(|t| t == &fs_type) {
            return Err(RootError::DisallowedFilesystem {
                path: root_path,
                fs_type,
            });
        }

        let ignore = IgnoreSet::new(&root_path, &config);
        let cookies = CookieSync::new(root_path.clone());
        let engine = InMemoryView::new(root_path.clone(), root_number, Arc::clone(&config), watcher);

        info!(root = %root_path, root_number, "watching new root");
        Ok(Arc::new(Self {
            root_path,
            fs_type,
            case_sensitive: CaseSensitivity::platform_default(),
            config,
            cookies,
            ignore,
            unilateral: Publisher::new(),
            engine,
            clock_id,
            recrawl_info: Mutex::new(RecrawlInfo {
                should_recrawl: true,
                ..RecrawlInfo::default()
            }),
            cursors: Mutex::new(FxHashMap::default()),
            asserted_states: Mutex::new(AssertedStates::default()),
            state_trans_count: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            failure_reason: Mutex::new(None),
            poison: Mutex::new(None),
            last_cmd_at: Mutex::new(Instant::now()),
        }))
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn engine(&self) -> &Arc<InMemoryView> {
        &self.engine
    }

    pub fn clock_id(&self) -> &ClockId {
        &self.clock_id
    }

    pub fn current_clock_string(&self) -> String {
        self.clock_id.format(self.engine.current_clock())
    }

    pub fn state_trans_count(&self) -> u32 {
        self.state_trans_count.load(Ordering::Acquire)
    }

    /// Records client activity for idle-reap accounting.
    pub fn note_cmd(&self) {
        *self.last_cmd_at.lock() = Instant::now();
    }

    pub fn evaluate_since(
        &self,
        spec: &SinceSpec,
        current: ClockPosition,
        last_age_out_tick: u32,
    ) -> QuerySince {
        let mut cursors = self.cursors.lock();
        spec.evaluate(&self.clock_id, current, last_age_out_tick, &mut cursors)
    }

    pub fn check_healthy(&self) -> Result<(), QueryExecError> {
        if self.is_cancelled() {
            return Err(QueryExecError::RootCancelled);
        }
        if let Some(reason) = self.poison.lock().clone() {
            return Err(QueryExecError::Poisoned(reason));
        }
        Ok(())
    }

    pub fn warning(&self) -> Option<String> {
        self.recrawl_info.lock().warning.clone()
    }

    /// Ensures the view reflects every filesystem change made before this
    /// call: cookie round trip, then the watcher's own flush when it has
    /// one.
    pub fn sync_to_now(&self, timeout: Duration) -> Result<(), CookieSyncError> {
        self.sync_to_now_cookies(timeout)?;
        // Watchers that may reorder events relative to cookie observation
        // provide an explicit flush.
        if let Some(flush) = self.engine.watcher().flush_pending_events() {
            flush.wait(timeout)?;
        }
        Ok(())
    }

    fn sync_to_now_cookies(&self, timeout: Duration) -> Result<(), CookieSyncError> {
        match self.cookies.sync_to_now(timeout) {
            Ok(()) => Ok(()),
            Err(err) if err.is_cookie_dir_gone() => {
                let cookie_dirs = self.cookies.cookie_dirs();
                if self
                    .engine
                    .watcher()
                    .caps()
                    .contains(WatcherCaps::SPLIT_WATCH)
                {
                    // Split watchers only fail when every watched piece is
                    // gone, root included.
                    self.cancel();
                    return Err(CookieSyncError::RootGone(self.root_path.clone()));
                }
                if cookie_dirs.contains(&self.root_path) {
                    // The root itself is gone. We may never receive a
                    // notification for this (btrfs subvolume deletion), so
                    // cancel here.
                    self.cancel();
                    return Err(CookieSyncError::RootGone(self.root_path.clone()));
                }
                // The cookie dir was a VCS subdir and it was removed; fall
                // back to the root and retry once.
                warn!(root = %self.root_path, "cookie directory disappeared, falling back to root");
                self.cookies.set_cookie_dir(self.root_path.clone());
                self.cookies.sync_to_now(timeout)
            }
            Err(err) => {
                // Best effort against replacement classes we were never
                // notified about: pretend the cookie dirs changed so the IO
                // thread takes a look.
                let now = SystemTime::now();
                {
                    let mut lock = self.engine.pending().lock();
                    for dir in self.cookies.cookie_dirs() {
                        lock.add(&dir, now, PendingFlags::CRAWL_ONLY);
                    }
                }
                self.engine.pending().ping();
                Err(err)
            }
        }
    }

    pub fn schedule_recrawl(&self, reason: &str) {
        let mut info = self.recrawl_info.lock();
        if !info.should_recrawl {
            info.warning = Some(format!(
                "Recrawled this watch {} times, most recently because: {reason}",
                info.recrawl_count + 1
            ));
            error!(root = %self.root_path, reason, "scheduling recrawl");
        }
        info.should_recrawl = true;
    }

    pub(crate) fn recrawl_flagged(&self) -> bool {
        self.recrawl_info.lock().should_recrawl
    }

    pub(crate) fn note_recrawl_started(&self) {
        self.recrawl_info.lock().recrawl_count += 1;
    }

    pub(crate) fn note_crawl_start(&self) {
        self.recrawl_info.lock().crawl_start = Some(Instant::now());
    }

    pub(crate) fn note_crawl_finish(&self) -> u32 {
        let mut info = self.recrawl_info.lock();
        info.should_recrawl = false;
        info.crawl_finish = Some(Instant::now());
        info.recrawl_count
    }

    /// Maps open/stat errno to policy: losing the root cancels the watch,
    /// fd exhaustion poisons the root, anything else is left to the caller
    /// (which marks the subtree deleted).
    pub(crate) fn handle_open_errno(&self, dir_path: &str, syscall: &str, err: &io::Error) {
        let transient = matches!(
            err.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
        );
        if transient {
            if dir_path == self.root_path {
                error!(root = %self.root_path, syscall, error = %err, "root has been removed, cancelling watch");
                self.set_failure_reason(format!("{syscall}({dir_path}): {err}"));
                self.cancel();
            } else {
                debug!(path = dir_path, syscall, error = %err, "dir vanished");
            }
            return;
        }
        // EMFILE/ENFILE: the system is out of descriptors and we can no
        // longer trust our picture of the filesystem.
        if matches!(err.raw_os_error(), Some(23) | Some(24)) {
            self.set_poison(format!(
                "{syscall}({dir_path}) -> {err}; queries will fail until the server is restarted"
            ));
            return;
        }
        warn!(path = dir_path, syscall, error = %err, "unhandled open error");
    }

    fn set_poison(&self, reason: String) {
        let mut poison = self.poison.lock();
        if poison.is_none() {
            error!(root = %self.root_path, %reason, "poisoning root");
            *poison = Some(reason);
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison.lock().is_some()
    }

    pub fn set_failure_reason(&self, reason: String) {
        *self.failure_reason.lock() = Some(reason);
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure_reason.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Idempotent. Stops the threads, fails outstanding cookies and tells
    /// subscribers the root is gone.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(root = %self.root_path, "cancelling root");
        self.engine.signal_threads();
        self.cookies.abort_all_cookies();
        self.unilateral
            .enqueue(json!({"canceled": true, "root": self.root_path}));
    }

    pub fn signal_threads(&self) {
        self.engine.signal_threads();
    }

    /// Stops watching; returns true when this call performed the stop.
    pub fn stop_watch(&self) -> bool {
        let stopped = !self.is_cancelled();
        self.cancel();
        self.engine.watcher().stop();
        stopped
    }

    /// True when the watch has been idle long enough to be reaped: no
    /// subscribers, no recent commands, no outstanding cookies.
    pub fn consider_reap(&self) -> bool {
        let reap_age = self.config.idle_reap_age();
        if reap_age.is_zero() {
            return false;
        }
        if self.unilateral.subscriber_count() > 0 {
            return false;
        }
        if !self.cookies.outstanding_cookie_files().is_empty() {
            return false;
        }
        let idle_for = self.last_cmd_at.lock().elapsed();
        if idle_for <= reap_age {
            return false;
        }
        info!(
            root = %self.root_path,
            idle_secs = idle_for.as_secs(),
            "root is idle, reaping"
        );
        true
    }

    /// Age out deleted nodes, at most once per `gc_interval`. Cursors whose
    /// tick predates the age-out are dropped with the nodes they refer to.
    pub fn consider_age_out(&self) {
        let interval = self.config.gc_interval();
        if interval.is_zero() {
            return;
        }
        if let Some(last) = self.engine.last_age_out_at() {
            if last.elapsed() <= interval {
                return;
            }
        }
        self.perform_age_out();
    }

    pub fn perform_age_out(&self) {
        self.engine.age_out(self.config.gc_age());
        let last_age_out_tick = self.engine.last_age_out_tick();
        self.cursors
            .lock()
            .retain(|_, ticks| *ticks >= last_age_out_tick);
    }

    /// Queues a named state assertion. When the assertion reaches the front
    /// of its queue the `state-enter` payload is broadcast.
    pub fn assert_state(&self, name: &str, metadata: Option<Value>) {
        let mut states = self.asserted_states.lock();
        let queue = states.states.entry(name.to_owned()).or_default();
        let at_front = queue.is_empty();
        queue.push_back(StateAssertion {
            metadata: metadata.clone(),
            disposition: if at_front {
                StateDisposition::Asserted
            } else {
                StateDisposition::PendingEnter
            },
        });
        drop(states);
        if at_front {
            self.state_trans_count.fetch_add(1, Ordering::AcqRel);
            self.broadcast_state("state-enter", name, metadata, false);
        }
    }

    /// Releases the front assertion for `name`. A queued successor becomes
    /// asserted and its enter payload is broadcast.
    pub fn leave_state(&self, name: &str, abandoned: bool) {
        let mut states = self.asserted_states.lock();
        let Some(queue) = states.states.get_mut(name) else {
            return;
        };
        let Some(left) = queue.pop_front() else {
            return;
        };
        let successor = queue.front_mut().map(|next| {
            next.disposition = StateDisposition::Asserted;
            next.metadata.clone()
        });
        if queue.is_empty() {
            states.states.remove(name);
        }
        drop(states);

        self.state_trans_count.fetch_add(1, Ordering::AcqRel);
        self.broadcast_state("state-leave", name, left.metadata, abandoned);
        if let Some(metadata) = successor {
            self.state_trans_count.fetch_add(1, Ordering::AcqRel);
            self.broadcast_state("state-enter", name, metadata, false);
        }
    }

    pub fn is_state_asserted(&self, name: &str) -> bool {
        self.asserted_states
            .lock()
            .states
            .get(name)
            .and_then(|queue| queue.front())
            .is_some_and(|front| front.disposition == StateDisposition::Asserted)
    }

    fn broadcast_state(&self, kind: &str, name: &str, metadata: Option<Value>, abandoned: bool) {
        let mut payload = serde_json::Map::new();
        payload.insert(kind.to_owned(), Value::String(name.to_owned()));
        payload.insert(
            "clock".to_owned(),
            Value::String(self.current_clock_string()),
        );
        if let Some(metadata) = metadata {
            payload.insert("metadata".to_owned(), metadata);
        }
        if abandoned {
            payload.insert("abandoned".to_owned(), Value::Bool(true));
        }
        self.unilateral.enqueue(Value::Object(payload));
    }

    /// Diagnostic snapshot of the root's health and progress.
    pub fn status(&self) -> Value {
        let info = self.recrawl_info.lock();
        json!({
            "path": self.root_path,
            "fstype": self.fs_type,
            "case_sensitive": self.case_sensitive == CaseSensitivity::CaseSensitive,
            "clock": self.current_clock_string(),
            "cancelled": self.is_cancelled(),
            "poisoned": self.is_poisoned(),
            "done_initial": self.engine.is_done_initial(),
            "recrawl_count": info.recrawl_count,
            "should_recrawl": info.should_recrawl,
            "warning": info.warning,
            "outstanding_cookies": self.cookies.outstanding_cookie_files(),
            "content_hash_cache": cache_stats_json(self.engine.caches().content_hash.stats()),
            "symlink_target_cache": cache_stats_json(self.engine.caches().symlink_targets.stats()),
        })
    }
}

fn cache_stats_json(stats: crate::caches::CacheStats) -> Value {
    json!({
        "cacheHit": stats.hit,
        "cacheShare": stats.share,
        "cacheMiss": stats.miss,
        "cacheEvict": stats.evict,
        "cacheStore": stats.store,
        "cacheLoad": stats.load,
        "cacheErase": stats.erase,
        "clearCount": stats.clear_count,
        "size": stats.size,
    })
}
