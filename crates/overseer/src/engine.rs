use std::{
    cmp,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use crossbeam_channel::{Receiver, bounded};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    caches::{ContentHashCache, ContentHashKey, SymlinkTargetCache},
    clock::{ClockPosition, ClockStamp},
    config::Config,
    fileinfo::{FileInformation, did_file_change},
    name::{base_name, dir_name, path_cat},
    pending::{PendingChange, PendingChanges, PendingCollection, PendingFlags},
    root::{CaseSensitivity, Root},
    view::{DirId, ViewDatabase},
    watcher::{Watcher, WatcherCaps},
};

/// Cap on how many events the notify thread batches before handing them to
/// the IO thread.
const NOTIFY_BATCH_LIMIT: usize = 4096;

/// A day, used as the ceiling for settle back-off and as the notify thread's
/// wait quantum.
const ONE_DAY: Duration = Duration::from_secs(86400);

pub struct ViewCaches {
    pub content_hash: ContentHashCache,
    pub symlink_targets: SymlinkTargetCache,
}

#[derive(Default)]
struct CrawlState {
    waiters: Vec<crossbeam_channel::Sender<()>>,
}

/// Keeps the state of the filesystem in memory and drives the notify and IO
/// threads that keep it current.
pub struct InMemoryView {
    root_path: String,
    root_number: u32,
    config: Arc<Config>,
    watcher: Arc<dyn Watcher>,

    view: RwLock<ViewDatabase>,
    /// Bumped once per IO pass that processes changes; every file marked
    /// changed in one pass shares the tick.
    most_recent_tick: AtomicU32,
    last_age_out_tick: AtomicU32,
    last_age_out_at: Mutex<Option<Instant>>,

    /// Work queue shared by the notify thread (producer) and IO thread
    /// (consumer); the IO thread also re-enqueues into it while crawling.
    pending: PendingCollection,
    pending_symlink_targets: PendingCollection,

    stop_threads: AtomicBool,
    done_initial: AtomicBool,
    crawl_state: Mutex<CrawlState>,

    caches: ViewCaches,
    last_warmed_tick: AtomicU32,
}

impl InMemoryView {
    pub fn new(
        root_path: impl Into<String>,
        root_number: u32,
        config: Arc<Config>,
        watcher: Arc<dyn Watcher>,
    ) -> Arc<Self> {
        let root_path = root_path.into();
        let caches = ViewCaches {
            content_hash: ContentHashCache::new(
                root_path.clone(),
                config.content_hash_max_items,
                config.error_ttl(),
            ),
            symlink_targets: SymlinkTargetCache::new(
                root_path.clone(),
                config.symlink_target_max_items,
                config.error_ttl(),
            ),
        };
        Arc::new(Self {
            view: RwLock::new(ViewDatabase::new(root_path.clone())),
            root_path,
            root_number,
            config,
            watcher,
            most_recent_tick: AtomicU32::new(1),
            last_age_out_tick: AtomicU32::new(0),
            last_age_out_at: Mutex::new(None),
            pending: PendingCollection::new(),
            pending_symlink_targets: PendingCollection::new(),
            stop_threads: AtomicBool::new(false),
            done_initial: AtomicBool::new(false),
            crawl_state: Mutex::new(CrawlState::default()),
            caches,
            last_warmed_tick: AtomicU32::new(0),
        })
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn watcher(&self) -> &Arc<dyn Watcher> {
        &self.watcher
    }

    pub fn caches(&self) -> &ViewCaches {
        &self.caches
    }

    pub fn view(&self) -> &RwLock<ViewDatabase> {
        &self.view
    }

    pub fn pending(&self) -> &PendingCollection {
        &self.pending
    }

    pub fn current_clock(&self) -> ClockPosition {
        ClockPosition {
            root_number: self.root_number,
            ticks: self.most_recent_tick.load(Ordering::Acquire),
        }
    }

    pub fn last_age_out_tick(&self) -> u32 {
        self.last_age_out_tick.load(Ordering::Acquire)
    }

    pub fn is_done_initial(&self) -> bool {
        self.done_initial.load(Ordering::Acquire)
    }

    fn get_clock(&self, now: SystemTime) -> ClockStamp {
        ClockStamp {
            ticks: self.most_recent_tick.load(Ordering::Acquire),
            timestamp: now,
        }
    }

    /// A receiver that becomes ready once the initial crawl (or a recrawl in
    /// progress) has completed. Already ready when the view is queryable.
    pub fn wait_until_ready_to_query(&self, root: &Root) -> Receiver<()> {
        let mut state = self.crawl_state.lock();
        let (tx, rx) = bounded(1);
        if self.is_done_initial() && !root.recrawl_flagged() {
            let _ = tx.try_send(());
        } else {
            state.waiters.push(tx);
        }
        rx
    }

    /// Starts the notify and IO threads. Both detach and exit when
    /// [`Self::signal_threads`] is invoked.
    ///
    /// The initial crawl must not begin until the watcher is live, or
    /// changes made between the crawl and the watch would be lost; the
    /// notify thread pings the pending collection once the watcher has
    /// started and we hold the IO thread back until then.
    pub fn start_threads(self: Arc<Self>, root: &Arc<Root>) {
        let engine = Arc::clone(&self);
        let notify_root = Arc::clone(root);
        std::thread::Builder::new()
            .name(format!("notify {}", self.root_path))
            .spawn(move || engine.notify_thread(&notify_root))
            .expect("spawning notify thread");

        let (_guard, _pinged) = self.pending.lock_and_wait(Duration::from_secs(30));
        drop(_guard);

        let engine = Arc::clone(&self);
        let io_root = Arc::clone(root);
        std::thread::Builder::new()
            .name(format!("io {}", self.root_path))
            .spawn(move || engine.io_thread(&io_root))
            .expect("spawning io thread");
    }

    pub fn signal_threads(&self) {
        self.stop_threads.store(true, Ordering::Release);
        self.watcher.signal_threads();
        self.pending.ping();
    }

    fn stopping(&self) -> bool {
        self.stop_threads.load(Ordering::Acquire)
    }

    /// Consumes OS events as fast as possible to minimize the risk of the
    /// kernel buffer overflowing, then queues the filesystem work for the IO
    /// thread.
    fn notify_thread(&self, root: &Arc<Root>) {
        if let Err(err) = self.watcher.start(&self.root_path) {
            error!(root = %self.root_path, error = %err, "failed to start watcher, cancelling root");
            root.set_failure_reason(err.to_string());
            root.cancel();
            return;
        }

        // Handshake: the IO thread waits for this ping before crawling.
        self.pending.ping();

        let mut from_watcher = PendingChanges::new();
        while !self.stopping() {
            if !self.watcher.wait_notify(ONE_DAY) {
                continue;
            }
            loop {
                let result = self.watcher.consume_notify(&self.root_path, &mut from_watcher);
                if result.cancel_self {
                    root.cancel();
                    break;
                }
                if !result.added_pending
                    || from_watcher.len() >= NOTIFY_BATCH_LIMIT
                    || !self.watcher.wait_notify(Duration::ZERO)
                {
                    break;
                }
            }
            if !from_watcher.is_empty() {
                let mut lock = self.pending.lock();
                lock.append(&mut from_watcher);
                drop(lock);
                self.pending.ping();
            }
        }
    }

    fn io_thread(&self, root: &Arc<Root>) {
        let mut local = PendingChanges::new();
        let mut timeout = self.config.settle();
        let biggest_timeout = [
            self.config.gc_interval(),
            self.config.idle_reap_age(),
            ONE_DAY,
        ]
        .into_iter()
        .filter(|d| !d.is_zero())
        .max()
        .unwrap_or(ONE_DAY);

        while !self.stopping() {
            if !self.is_done_initial() {
                // First order of business is to find all the files under the
                // root.
                self.full_crawl(root, &mut local);
                timeout = self.config.settle();
            }

            let pinged = {
                debug!(timeout_ms = timeout.as_millis() as u64, "waiting for pending changes");
                let (mut guard, pinged) = self.pending.lock_and_wait(timeout);
                local.append(&mut guard);
                pinged
            };

            if self.handle_should_recrawl(root) {
                // done_initial was cleared; the next loop iteration crawls.
                continue;
            }

            if !pinged && local.is_empty() {
                // Waiting timed out: the root has settled.
                if self.do_settle_things(root) {
                    break;
                }
                timeout = cmp::min(biggest_timeout, timeout * 2);
                continue;
            }

            // We are by definition unsettled now.
            timeout = self.config.settle();

            // Some kernels report notifications before the page cache is
            // consistent; optionally give them a moment.
            if self.config.notify_sleep_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.notify_sleep_ms));
            }

            let desynced = {
                let mut view = self.view.write();
                debug_assert!(
                    self.is_done_initial(),
                    "a full crawl must not be pending at this point in the loop"
                );
                self.most_recent_tick.fetch_add(1, Ordering::AcqRel);
                self.process_all_pending(root, &mut view, &mut local)
            };
            if desynced {
                info!("recrawl complete, aborting all pending cookies");
                root.cookies.abort_all_cookies();
            }
        }
    }

    /// Performs a crawl without starting any threads; useful for one-shot
    /// examination of a tree.
    pub fn client_mode_crawl(&self, root: &Arc<Root>) {
        let mut local = PendingChanges::new();
        self.full_crawl(root, &mut local);
    }

    /// One synchronous IO-thread pass over whatever is currently pending.
    pub fn process_pending_now(&self, root: &Arc<Root>) {
        let mut local = PendingChanges::new();
        {
            let mut guard = self.pending.lock();
            local.append(&mut guard);
        }
        if self.handle_should_recrawl(root) {
            self.full_crawl(root, &mut local);
            return;
        }
        if local.is_empty() {
            return;
        }
        let desynced = {
            let mut view = self.view.write();
            self.most_recent_tick.fetch_add(1, Ordering::AcqRel);
            self.process_all_pending(root, &mut view, &mut local)
        };
        if desynced {
            root.cookies.abort_all_cookies();
        }
    }

    fn handle_should_recrawl(&self, root: &Arc<Root>) -> bool {
        if !root.recrawl_flagged() {
            return false;
        }
        if !root.is_cancelled() {
            root.note_recrawl_started();
            self.done_initial.store(false, Ordering::Release);
        }
        true
    }

    // Settle-time actions. Returns true when the root was reaped and the IO
    // thread should terminate.
    fn do_settle_things(&self, root: &Arc<Root>) -> bool {
        self.process_pending_symlink_targets();

        if !self.is_done_initial() {
            // A recrawl is queued; don't pretend to be settled.
            return false;
        }

        self.warm_content_cache();

        root.unilateral.enqueue(json!({"settled": true}));

        if root.consider_reap() {
            root.stop_watch();
            return true;
        }

        root.consider_age_out();
        false
    }

    fn full_crawl(&self, root: &Arc<Root>, local: &mut PendingChanges) {
        root.note_crawl_start();

        let mut view = self.view.write();
        // Observe the crawl with a fresh, distinct tick, otherwise a
        // subscription established immediately after a watch can be stuck
        // with an empty view until another change arrives.
        self.most_recent_tick.fetch_add(1, Ordering::AcqRel);
        // Re-learn the root inode; a full crawl starts from scratch and must
        // not re-trigger the replacement detection against a stale value.
        view.set_root_inode(0);
        let start = SystemTime::now();
        self.pending
            .lock()
            .add(&self.root_path, start, PendingFlags::RECURSIVE);

        loop {
            // Consume the outstanding set before merging in new kernel
            // notifications, or we risk missing changes that race the
            // initial crawl.
            {
                let mut lock = self.pending.lock();
                local.append(&mut lock);
            }
            if local.is_empty() {
                break;
            }
            self.process_all_pending(root, &mut view, local);
        }

        let recrawl_count = root.note_crawl_finish();
        self.done_initial.store(true, Ordering::Release);
        for waiter in self.crawl_state.lock().waiters.drain(..) {
            let _ = waiter.try_send(());
        }
        drop(view);

        // Clients' cookies may pre-date this crawl; fail them so they
        // re-sync against the now-consistent view.
        root.cookies.abort_all_cookies();

        info!(
            root = %self.root_path,
            "{}crawl complete",
            if recrawl_count > 0 { "re" } else { "" }
        );
    }

    /// Drains `coll` in FIFO order, following any work each item re-enqueues
    /// until the collection is exhausted. Returns true when a desynced crawl
    /// item was observed, signalling the caller to abort cookies.
    fn process_all_pending(
        &self,
        root: &Arc<Root>,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
    ) -> bool {
        let mut desynced = false;
        while !coll.is_empty() {
            debug!(count = coll.len(), root = %self.root_path, "processing pending events");
            for item in coll.steal_items() {
                if self.stopping() {
                    continue;
                }
                if item
                    .flags
                    .contains(PendingFlags::IS_DESYNCED | PendingFlags::CRAWL_ONLY)
                {
                    // The watcher dropped events and a recursive crawl is in
                    // flight; cookies observed during it cannot be trusted.
                    desynced = true;
                }
                self.process_path(root, view, coll, &item, None);
            }
        }
        desynced
    }

    fn process_path(
        &self,
        root: &Arc<Root>,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
        pending: &PendingChange,
        pre_stat: Option<&FileInformation>,
    ) {
        if root.cookies.is_cookie_prefix(&pending.path) {
            let consider_cookie = if self
                .watcher
                .caps()
                .contains(WatcherCaps::PER_FILE_NOTIFICATIONS)
            {
                // Only cookies that came straight from the watcher count as
                // observed; a recursive crawl rediscovering a cookie must
                // not satisfy a sync prematurely.
                pending.flags.contains(PendingFlags::VIA_NOTIFY) || !self.is_done_initial()
            } else {
                !pending.flags.contains(PendingFlags::IS_DESYNCED)
            };
            if consider_cookie {
                root.cookies.notify_cookie(&pending.path);
            }
            // Cookie files never appear in the tree.
            return;
        }

        if pending.path == self.root_path || pending.flags.contains(PendingFlags::CRAWL_ONLY) {
            self.crawler(root, view, coll, pending);
        } else {
            self.stat_path(root, view, coll, pending, pre_stat);
        }
    }

    fn crawler(
        &self,
        root: &Arc<Root>,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
        pending: &PendingChange,
    ) {
        let mut recursive = pending.flags.contains(PendingFlags::RECURSIVE);
        let caps = self.watcher.caps();
        let stat_all = if caps.contains(WatcherCaps::PER_FILE_NOTIFICATIONS) {
            caps.contains(WatcherCaps::COALESCED_RENAME)
        } else {
            // Watchers that only tell us "this directory changed" get a
            // non-recursive scan of the directory they reported.
            pending.flags.contains(PendingFlags::NONRECURSIVE_SCAN)
        };

        let Some(dir) = view.resolve_dir(&pending.path, true) else {
            warn!(path = %pending.path, "crawler could not resolve dir under root");
            return;
        };

        // Root replacement detection. Filesystems like BTRFS don't emit
        // events for subvolume replacement; the inode check is the only
        // reliable signal, and without it cookie sync would wedge forever.
        if pending.path == self.root_path {
            match FileInformation::from_path(&pending.path) {
                Ok(st) => {
                    if st.ino != view.root_inode() {
                        if view.root_inode() != 0 {
                            root.schedule_recrawl(
                                "root was replaced and we didn't get notified by the kernel",
                            );
                            return;
                        }
                        recursive = true;
                        view.set_root_inode(st.ino);
                    }
                }
                Err(err) => {
                    root.handle_open_errno(&pending.path, "stat", &err);
                    view.mark_dir_deleted(dir, self.get_clock(pending.now), true);
                    return;
                }
            }
        }

        debug!(path = %pending.path, recursive, stat_all, "opendir");
        let osdir = match self.watcher.start_watch_dir(&pending.path) {
            Ok(osdir) => osdir,
            Err(err) => {
                debug!(path = %pending.path, error = %err, "start_watch_dir failed");
                root.handle_open_errno(&pending.path, "opendir", &err);
                view.mark_dir_deleted(dir, self.get_clock(pending.now), true);
                return;
            }
        };

        if view.dir(dir).files.is_empty() {
            // Pre-size to avoid rehashing during the initial crawl.
            // st_nlink is usually the number of child dirs + 2.
            let num_dirs = osdir.nlink_hint.unwrap_or(0).saturating_sub(2) as usize;
            view.dir_mut(dir)
                .files
                .reserve(self.config.hint_num_files_per_dir);
            view.dir_mut(dir).dirs.reserve(num_dirs);
        }

        // Flag the existing children for delete detection.
        let existing: Vec<crate::view::FileId> = view.dir(dir).files.values().copied().collect();
        for file_id in &existing {
            if view.file(*file_id).exists {
                view.file_mut(*file_id).maybe_deleted = true;
            }
        }

        for entry in &osdir.entries {
            let known = view.dir(dir).files.get(entry.name.as_str()).copied();
            if let Some(file_id) = known {
                view.file_mut(file_id).maybe_deleted = false;
            }
            let needs_look = match known {
                Some(file_id) => !view.file(file_id).exists || stat_all || recursive,
                None => true,
            };
            if needs_look {
                let full_path = path_cat(&pending.path, &entry.name);
                let mut new_flags = PendingFlags::empty();
                let is_new = known.is_none_or(|file_id| !view.file(file_id).exists);
                if recursive || is_new {
                    new_flags |= PendingFlags::RECURSIVE;
                }
                if pending.flags.contains(PendingFlags::IS_DESYNCED) {
                    new_flags |= PendingFlags::IS_DESYNCED;
                }
                self.process_path(
                    root,
                    view,
                    coll,
                    &PendingChange {
                        path: full_path,
                        now: pending.now,
                        flags: new_flags,
                    },
                    entry.pre_stat.as_ref(),
                );
            }
        }

        // An error partway through the listing is transient: keep what we
        // observed and re-queue the directory to re-assess it. The entries
        // we did not reach keep their maybe_deleted flag and are re-statted
        // by the sweep below, which finds them still present.
        if let Some(err) = &osdir.read_error {
            warn!(
                path = %pending.path,
                error = %err,
                "error while reading dir, re-adding to pending list to re-assess"
            );
            coll.add(&pending.path, pending.now, PendingFlags::empty());
        }

        // Anything still flagged is actually deleted; re-enqueue so the stat
        // pass reconciles it. Existing dirs are also re-examined when the
        // crawl is recursive.
        let children: Vec<crate::view::FileId> = view.dir(dir).files.values().copied().collect();
        for file_id in children {
            let file = view.file(file_id);
            if file.exists
                && (file.maybe_deleted
                    || (recursive && file.stat.is_some_and(|st| st.is_dir())))
            {
                let child_path = path_cat(&pending.path, &file.name);
                coll.add(
                    &child_path,
                    pending.now,
                    if recursive {
                        PendingFlags::RECURSIVE
                    } else {
                        PendingFlags::empty()
                    },
                );
            }
        }
    }

    fn stat_path(
        &self,
        root: &Arc<Root>,
        view: &mut ViewDatabase,
        coll: &mut PendingChanges,
        pending: &PendingChange,
        pre_stat: Option<&FileInformation>,
    ) {
        let mut recursive = pending.flags.contains(PendingFlags::RECURSIVE);
        let via_notify = pending.flags.contains(PendingFlags::VIA_NOTIFY);
        let desynced_flag = pending.flags & PendingFlags::IS_DESYNCED;

        if root.ignore.is_ignore_dir(&pending.path) {
            debug!(path = %pending.path, "matches ignore_dir rules");
            return;
        }

        let parent_path = dir_name(&pending.path);
        let file_name = base_name(&pending.path);
        let Some(parent) = view.resolve_dir(parent_path, true) else {
            warn!(path = %pending.path, "stat_path could not resolve parent under root");
            return;
        };

        let file = view.dir(parent).files.get(file_name).copied();
        let dir_ent = view.dir(parent).dirs.get(file_name).copied();
        let clock = self.get_clock(pending.now);

        let stat_result: Result<FileInformation, std::io::Error> = match pre_stat {
            Some(st) => Ok(*st),
            None => FileInformation::from_path(&pending.path),
        };

        match stat_result {
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                // It's not there; update our state.
                if let Some(dir_ent) = dir_ent {
                    view.mark_dir_deleted(dir_ent, clock, true);
                    debug!(path = %pending.path, "dir vanished, marking subtree deleted");
                }
                let old_stat = file.and_then(|id| view.file(id).stat);
                match file {
                    Some(file_id) => {
                        if view.file(file_id).exists {
                            debug!(path = %pending.path, "marking file deleted");
                            view.file_mut(file_id).exists = false;
                            view.mark_file_changed(file_id, clock);
                        }
                    }
                    None => {
                        // Created and removed before we ever observed it;
                        // generate a deleted node so since-queries can still
                        // report the event.
                        let (file_id, _) = view.get_or_create_child_file(parent, file_name, clock);
                        view.file_mut(file_id).exists = false;
                        view.mark_file_changed(file_id, clock);
                    }
                }

                let propagated = self.propagate_to_parent_dir_if_appropriate(
                    root,
                    view,
                    coll,
                    pending.now,
                    old_stat.as_ref(),
                    parent_path,
                    parent,
                    true,
                );
                if !propagated
                    && root.case_sensitive == CaseSensitivity::CaseInSensitive
                    && parent_path != self.root_path
                    && view.dir(parent).last_check_existed
                {
                    // The name may have been rejected because it wasn't
                    // canonical; look at the parent to discover replacements.
                    coll.add(parent_path, pending.now, PendingFlags::CRAWL_ONLY);
                }
            }
            Err(err) => {
                error!(path = %pending.path, error = %err, "stat failed and not handled");
            }
            Ok(st) => {
                let (file_id, created) = view.get_or_create_child_file(parent, file_name, clock);
                if created {
                    self.watcher.start_watch_file(&pending.path);
                }

                let old_stat = view.file(file_id).stat;
                if !view.file(file_id).exists {
                    // Transitioning from deleted to existing: effectively new
                    // again, and a dir resurrected this way must be recrawled.
                    view.file_mut(file_id).ctime = clock;
                    recursive = true;
                }
                let changed = !view.file(file_id).exists
                    || via_notify
                    || old_stat.map_or(true, |old| did_file_change(&old, &st));
                if changed {
                    debug!(
                        path = %pending.path,
                        exists = view.file(file_id).exists,
                        via_notify,
                        "file changed"
                    );
                    view.file_mut(file_id).exists = true;
                    view.mark_file_changed(file_id, clock);
                    // An inode change means the kernel's hints cannot be
                    // trusted for the children either (BTRFS).
                    if old_stat.is_some_and(|old| old.ino != st.ino) {
                        recursive = true;
                    }
                }
                view.file_mut(file_id).stat = Some(st);

                if st.is_symlink() && self.config.watch_symlinks {
                    self.pending_symlink_targets.lock().add(
                        &pending.path,
                        pending.now,
                        PendingFlags::empty(),
                    );
                }

                if st.is_dir() {
                    match dir_ent {
                        None => recursive = true,
                        Some(dir_ent) => view.dir_mut(dir_ent).last_check_existed = true,
                    }

                    // Don't descend into VCS control dirs, unless this is
                    // the cookie dir itself.
                    if !root.ignore.is_ignore_vcs(parent_path)
                        || root.cookies.is_cookie_dir(&pending.path)
                    {
                        if recursive {
                            coll.add(
                                &pending.path,
                                pending.now,
                                desynced_flag | PendingFlags::RECURSIVE | PendingFlags::CRAWL_ONLY,
                            );
                        } else if pending.flags.contains(PendingFlags::NONRECURSIVE_SCAN) {
                            coll.add(
                                &pending.path,
                                pending.now,
                                desynced_flag
                                    | PendingFlags::NONRECURSIVE_SCAN
                                    | PendingFlags::CRAWL_ONLY,
                            );
                        } else if !self
                            .watcher
                            .caps()
                            .contains(WatcherCaps::PER_FILE_NOTIFICATIONS)
                        {
                            coll.add(
                                &pending.path,
                                pending.now,
                                desynced_flag | PendingFlags::CRAWL_ONLY,
                            );
                        }
                    }
                } else if let Some(dir_ent) = dir_ent {
                    // Transitioned from dir to file; prune the former tree.
                    view.mark_dir_deleted(dir_ent, clock, true);
                }

                self.propagate_to_parent_dir_if_appropriate(
                    root,
                    view,
                    coll,
                    pending.now,
                    Some(&st),
                    parent_path,
                    parent,
                    false,
                );
            }
        }
    }

    /// Not all systems report the containing directory as changed when a
    /// file inside it changes. For per-file watchers we re-examine the
    /// parent ourselves; unlinks force a notify-grade event because mtime
    /// granularity may otherwise hide them.
    #[allow(clippy::too_many_arguments)]
    fn propagate_to_parent_dir_if_appropriate(
        &self,
        _root: &Arc<Root>,
        view: &ViewDatabase,
        coll: &mut PendingChanges,
        now: SystemTime,
        entry_stat: Option<&FileInformation>,
        parent_path: &str,
        parent: DirId,
        is_unlink: bool,
    ) -> bool {
        if self
            .watcher
            .caps()
            .contains(WatcherCaps::PER_FILE_NOTIFICATIONS)
            && parent_path != self.root_path
            && !entry_stat.is_some_and(|st| st.is_dir())
            && view.dir(parent).last_check_existed
        {
            coll.add(
                parent_path,
                now,
                if is_unlink {
                    PendingFlags::VIA_NOTIFY
                } else {
                    PendingFlags::empty()
                },
            );
            true
        } else {
            false
        }
    }

    fn process_pending_symlink_targets(&self) {
        let items = {
            let mut guard = self.pending_symlink_targets.lock();
            guard.steal_items()
        };
        for item in items {
            match std::fs::read_link(&item.path) {
                Ok(target) => {
                    let target = if target.is_absolute() {
                        target
                    } else {
                        std::path::Path::new(dir_name(&item.path)).join(target)
                    };
                    if let Some(target) = target.to_str() {
                        self.watcher.start_watch_file(target);
                    }
                }
                Err(err) => {
                    debug!(path = %item.path, error = %err, "failed to read symlink target");
                }
            }
        }
    }

    /// Warm the content cache for recently changed files so queries asking
    /// for hashes find them precomputed.
    fn warm_content_cache(&self) {
        if !self.config.content_hash_warming {
            return;
        }
        let upper_tick = self.most_recent_tick.load(Ordering::Acquire);
        let last_warmed = self.last_warmed_tick.load(Ordering::Acquire);

        let mut keys = Vec::new();
        {
            let view = self.view.read();
            let mut cursor = view.latest_file();
            while let Some(file_id) = cursor {
                if keys.len() >= self.config.content_hash_max_warm_per_settle {
                    break;
                }
                let file = view.file(file_id);
                if file.otime.ticks <= last_warmed {
                    break;
                }
                if file.exists {
                    if let Some(st) = &file.stat {
                        if st.is_file() {
                            let full = view.file_path(file_id);
                            let relative = full
                                .strip_prefix(&self.root_path)
                                .and_then(|p| p.strip_prefix('/'))
                                .unwrap_or(&full);
                            keys.push(ContentHashKey::new(relative, st));
                        }
                    }
                }
                cursor = view.next_changed(file_id);
            }
        }

        debug!(count = keys.len(), "warming content cache");
        let lookups: Vec<_> = keys
            .iter()
            .map(|key| self.caches.content_hash.get(key))
            .collect();
        if self.config.content_hash_warm_wait_before_settle {
            for lookup in lookups {
                let _ = lookup.wait();
            }
        }
        self.last_warmed_tick.store(upper_tick, Ordering::Release);
    }

    /// Prunes deleted nodes older than `min_age` and advances the age-out
    /// tick that forces stale since-queries to fresh-instance semantics.
    pub fn age_out(&self, min_age: Duration) {
        let now = SystemTime::now();
        *self.last_age_out_at.lock() = Some(Instant::now());
        let stats = {
            let mut view = self.view.write();
            view.age_out(min_age, now)
        };
        if stats.max_aged_tick > 0 {
            self.last_age_out_tick
                .fetch_max(stats.max_aged_tick, Ordering::AcqRel);
        }
        if stats.aged_files + stats.aged_dirs > 0 {
            info!(
                files = stats.aged_files,
                dirs = stats.aged_dirs,
                walked = stats.walked,
                "aged out"
            );
        }
    }

    pub fn last_age_out_at(&self) -> Option<Instant> {
        *self.last_age_out_at.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{Value, json};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        clock::ClockId,
        query::{self, Query, QueryResult},
        watcher::fake::FakeWatcher,
    };

    struct Fixture {
        _dir: TempDir,
        root: Arc<Root>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_dir(tempfile::tempdir().unwrap())
        }

        fn with_dir(dir: TempDir) -> Self {
            let watcher = Arc::new(FakeWatcher::per_file());
            let root = Root::open(
                dir.path(),
                Arc::new(Config::default()),
                watcher,
                1,
                Arc::new(ClockId::new()),
            )
            .unwrap();
            root.engine().client_mode_crawl(&root);
            Fixture { _dir: dir, root }
        }

        fn path(&self, relative: &str) -> String {
            path_cat(self.root.root_path(), relative)
        }

        fn notify(&self, relative: &str) {
            self.root.engine().pending().lock().add(
                &self.path(relative),
                SystemTime::now(),
                PendingFlags::VIA_NOTIFY,
            );
        }

        fn process(&self) {
            self.root.engine().process_pending_now(&self.root);
        }

        fn query(&self, spec: Value) -> QueryResult {
            let query = Query::parse(&self.root, &spec, None).unwrap();
            query::execute(&self.root, &query).unwrap()
        }
    }

    fn names_and_exists(result: &QueryResult) -> Vec<(String, bool)> {
        result
            .files
            .iter()
            .map(|file| {
                (
                    file["name"].as_str().unwrap().to_owned(),
                    file["exists"].as_bool().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn fresh_instance_with_empty_on_fresh_instance() {
        let fixture = Fixture::new();
        fs::write(fixture.path("a.txt"), b"contents").unwrap();
        fixture.notify("a.txt");
        fixture.process();

        let result = fixture.query(json!({
            "since": "c:0:0",
            "expression": ["exists"],
            "empty_on_fresh_instance": true,
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert!(result.is_fresh_instance);
        assert!(result.files.is_empty());
        assert!(result.clock.starts_with("c:"));
    }

    #[test]
    fn existence_transition_reports_new_file() {
        let fixture = Fixture::new();
        let first = fixture.query(json!({
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert!(first.is_fresh_instance);
        assert!(first.files.is_empty());

        fs::write(fixture.path("foo"), b"x").unwrap();
        fixture.notify("foo");
        fixture.process();

        let result = fixture.query(json!({
            "since": first.clock,
            "expression": ["allof", ["exists"], ["type", "f"]],
            "fields": ["name", "new"],
            "sync_timeout": 0,
        }));
        assert!(!result.is_fresh_instance);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0]["name"], "foo");
        assert_eq!(result.files[0]["new"], true);
    }

    #[test]
    fn rename_reports_old_and_new_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"a").unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        let fixture = Fixture::with_dir(dir);

        let before = fixture.query(json!({"fields": ["name"], "sync_timeout": 0}));

        fs::rename(fixture.path("a"), fixture.path("b/a")).unwrap();
        fixture.notify("a");
        fixture.notify("b/a");
        fixture.process();

        let result = fixture.query(json!({
            "since": before.clock,
            "fields": ["name", "exists"],
            "sync_timeout": 0,
        }));
        let entries = names_and_exists(&result);
        assert!(entries.contains(&("a".to_owned(), false)), "{entries:?}");
        assert!(entries.contains(&("b/a".to_owned(), true)), "{entries:?}");
    }

    #[test]
    fn recursive_delete_reports_whole_subtree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        for name in ["x", "y", "z"] {
            fs::write(dir.path().join("d").join(name), name).unwrap();
        }
        let fixture = Fixture::with_dir(dir);

        let before = fixture.query(json!({"fields": ["name"], "sync_timeout": 0}));
        assert_eq!(before.files.len(), 4);

        fs::remove_dir_all(fixture.path("d")).unwrap();
        fixture.notify("d");
        fixture.process();

        let result = fixture.query(json!({
            "since": before.clock,
            "fields": ["name", "exists"],
            "sync_timeout": 0,
        }));
        let entries = names_and_exists(&result);
        for name in ["d", "d/x", "d/y", "d/z"] {
            assert!(
                entries.contains(&(name.to_owned(), false)),
                "missing deleted entry {name}: {entries:?}"
            );
        }
        fixture.root.engine().view().read().check_coherence();
    }

    #[test]
    fn dedup_on_glob_and_path_overlap() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"int main;").unwrap();
        let fixture = Fixture::with_dir(dir);

        let result = fixture.query(json!({
            "glob": ["*.c"],
            "paths": [{"path": "", "depth": -1}],
            "dedup_results": true,
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert_eq!(result.files, vec![Value::String("a.c".into())]);
        let deduped = result.deduped_file_names.as_ref().unwrap();
        assert!(deduped.contains("a.c"));
    }

    #[test]
    fn content_hash_cache_hit_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"hello").unwrap();
        let fixture = Fixture::with_dir(dir);

        let spec = json!({"fields": ["content.sha1hex"], "sync_timeout": 0});
        let first = fixture.query(spec.clone());
        assert_eq!(
            first.files,
            vec![Value::String(
                "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".into()
            )]
        );
        let stats_after_first = fixture.root.engine().caches().content_hash.stats();
        assert!(stats_after_first.miss >= 1);

        let second = fixture.query(spec.clone());
        assert_eq!(second.files, first.files);
        let stats_after_second = fixture.root.engine().caches().content_hash.stats();
        assert!(stats_after_second.hit > stats_after_first.hit);

        // Changing the contents changes the cache key.
        fs::write(fixture.path("f"), b"world").unwrap();
        fixture.notify("f");
        fixture.process();
        let third = fixture.query(spec);
        assert_ne!(third.files, first.files);
        let stats_after_third = fixture.root.engine().caches().content_hash.stats();
        assert!(stats_after_third.miss > stats_after_second.miss);
    }

    #[test]
    fn suffix_query_is_case_insensitive_and_deduped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.C"), b"x").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.c"), b"y").unwrap();
        fs::write(dir.path().join("readme.md"), b"z").unwrap();
        let fixture = Fixture::with_dir(dir);

        let result = fixture.query(json!({
            "suffix": "c",
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        let mut names: Vec<&str> = result
            .files
            .iter()
            .map(|file| file.as_str().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["main.C", "src/lib.c"]);
    }

    #[test]
    fn cookie_round_trip_is_observed_not_materialized() {
        let fixture = Fixture::new();
        let subscription = fixture.root.cookies.sync().unwrap();
        let outstanding = fixture.root.cookies.outstanding_cookie_files();
        assert_eq!(outstanding.len(), 1);

        fixture.root.engine().pending().lock().add(
            &outstanding[0],
            SystemTime::now(),
            PendingFlags::VIA_NOTIFY,
        );
        fixture.process();
        subscription.wait(Duration::from_secs(1)).unwrap();

        // Cookie files never show up in the tree.
        let result = fixture.query(json!({"fields": ["name"], "sync_timeout": 0}));
        assert!(result.files.is_empty(), "{:?}", result.files);
    }

    #[test]
    fn desync_aborts_outstanding_cookies() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file"), b"x").unwrap();
        let fixture = Fixture::with_dir(dir);

        let subscription = fixture.root.cookies.sync().unwrap();
        // The watcher reports dropped events with a desynced recursive
        // rescan of the root.
        fixture.root.engine().pending().lock().add(
            fixture.root.root_path(),
            SystemTime::now(),
            PendingFlags::RECURSIVE | PendingFlags::IS_DESYNCED,
        );
        fixture.process();

        assert!(matches!(
            subscription.wait(Duration::from_secs(1)),
            Err(crate::errors::CookieSyncError::Aborted)
        ));
    }

    #[test]
    fn age_out_degrades_old_clocks_to_fresh_instances() {
        let fixture = Fixture::new();
        fs::write(fixture.path("doomed"), b"x").unwrap();
        fixture.notify("doomed");
        fixture.process();

        let before_delete = fixture.query(json!({"fields": ["name"], "sync_timeout": 0}));

        fs::remove_file(fixture.path("doomed")).unwrap();
        fixture.notify("doomed");
        fixture.process();

        fixture.root.engine().age_out(Duration::ZERO);
        assert!(fixture.root.engine().last_age_out_tick() > 0);

        let result = fixture.query(json!({
            "since": before_delete.clock,
            "fields": ["name", "exists"],
            "sync_timeout": 0,
        }));
        // The deletion record is gone, so the query must not pretend to be
        // incremental.
        assert!(result.is_fresh_instance);
        assert!(names_and_exists(&result).is_empty());
    }

    #[test]
    fn ignored_directories_stay_out_of_the_view() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), b"x").unwrap();
        fs::create_dir(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/objects/ab"), b"y").unwrap();
        fs::write(dir.path().join("tracked"), b"z").unwrap();
        let fixture = Fixture::with_dir(dir);

        let result = fixture.query(json!({"fields": ["name"], "sync_timeout": 0}));
        let names: Vec<&str> = result
            .files
            .iter()
            .map(|file| file.as_str().unwrap())
            .collect();
        assert!(names.contains(&"tracked"));
        // The VCS dir itself is observed at the top level, but nothing
        // below it is crawled.
        assert!(!names.iter().any(|name| name.starts_with(".git/objects/")));
    }

    #[test]
    fn pcre_and_match_terms() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha.rs"), b"x").unwrap();
        fs::write(dir.path().join("beta.txt"), b"y").unwrap();
        let fixture = Fixture::with_dir(dir);

        let result = fixture.query(json!({
            "expression": ["match", "*.rs"],
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert_eq!(result.files, vec![Value::String("alpha.rs".into())]);

        let result = fixture.query(json!({
            "expression": ["pcre", "^al.*\\.rs$"],
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert_eq!(result.files, vec![Value::String("alpha.rs".into())]);

        let result = fixture.query(json!({
            "expression": ["anyof", ["suffix", "txt"], ["name", "alpha.rs"]],
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert_eq!(result.files.len(), 2);
    }

    #[test]
    fn size_and_empty_terms() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("small"), b"").unwrap();
        fs::write(dir.path().join("large"), vec![0u8; 2048]).unwrap();
        let fixture = Fixture::with_dir(dir);

        let result = fixture.query(json!({
            "expression": ["size", "gt", 1024],
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert_eq!(result.files, vec![Value::String("large".into())]);

        let result = fixture.query(json!({
            "expression": ["empty"],
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert_eq!(result.files, vec![Value::String("small".into())]);
    }

    #[test]
    fn relative_root_scopes_results() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"x").unwrap();
        fs::write(dir.path().join("outer.txt"), b"y").unwrap();
        let fixture = Fixture::with_dir(dir);

        let result = fixture.query(json!({
            "relative_root": "sub",
            "fields": ["name"],
            "sync_timeout": 0,
        }));
        assert_eq!(result.files, vec![Value::String("inner.txt".into())]);
    }

    #[test]
    fn transient_read_error_does_not_delete_subtree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a"), b"a").unwrap();
        fs::write(dir.path().join("sub/b"), b"b").unwrap();

        let watcher = Arc::new(FakeWatcher::per_file());
        let root = Root::open(
            dir.path(),
            Arc::new(Config::default()),
            Arc::clone(&watcher) as Arc<dyn Watcher>,
            1,
            Arc::new(ClockId::new()),
        )
        .unwrap();
        let sub_path = path_cat(root.root_path(), "sub");
        watcher.fail_next_read_of(&sub_path, 1);
        root.engine().client_mode_crawl(&root);

        let run_query = |spec: Value| {
            let query = Query::parse(&root, &spec, None).unwrap();
            query::execute(&root, &query).unwrap()
        };
        let spec = json!({"fields": ["name", "exists"], "sync_timeout": 0});

        // The partial listing is applied as far as it got; nothing in the
        // subtree is reported as deleted.
        let result = run_query(spec.clone());
        let entries = names_and_exists(&result);
        assert!(entries.contains(&("sub".to_owned(), true)), "{entries:?}");
        assert!(entries.contains(&("sub/a".to_owned(), true)), "{entries:?}");
        assert!(
            entries.iter().all(|(_, exists)| *exists),
            "transient read error must not synthesize deletions: {entries:?}"
        );

        // A later recursive look at the directory restores the full
        // listing.
        root.engine().pending().lock().add(
            &sub_path,
            SystemTime::now(),
            PendingFlags::RECURSIVE | PendingFlags::CRAWL_ONLY,
        );
        root.engine().process_pending_now(&root);
        let result = run_query(spec);
        let entries = names_and_exists(&result);
        assert!(entries.contains(&("sub/b".to_owned(), true)), "{entries:?}");
        root.engine().view().read().check_coherence();
    }

    #[test]
    fn root_replacement_schedules_recrawl() {
        let fixture = Fixture::new();
        assert!(!fixture.root.recrawl_flagged());
        // Simulate an inode change on the root by lying about the recorded
        // inode.
        fixture.root.engine().view().write().set_root_inode(u64::MAX);
        fixture.root.engine().pending().lock().add(
            fixture.root.root_path(),
            SystemTime::now(),
            PendingFlags::RECURSIVE,
        );
        fixture.process();
        assert!(fixture.root.recrawl_flagged());

        // The next pass performs the recrawl and clears the flag.
        fixture.process();
        assert!(!fixture.root.recrawl_flagged());
        assert!(fixture.root.engine().is_done_initial());
    }
}
