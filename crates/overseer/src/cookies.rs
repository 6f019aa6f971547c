use std::{
    fs,
    io::Write as _,
    process,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::{
    errors::CookieSyncError,
    name::{base_name, path_cat},
};

/// Filename prefix shared by every cookie file.
pub const COOKIE_PREFIX: &str = ".watchman-cookie-";

/// Cheap test used by the pending collection: we cannot know the precise
/// per-root prefix there, so a substring match keeps cookie notifications
/// from being coalesced away.
pub fn is_possibly_a_cookie(path: &str) -> bool {
    path.contains(COOKIE_PREFIX)
}

/// A completion handle for one `sync` call. The promise is fulfilled on the
/// IO thread when every cookie written for the call has been observed, or
/// failed when the cookies are aborted.
#[derive(Debug)]
pub struct SyncSubscription {
    rx: Receiver<Result<(), CookieSyncError>>,
}

impl SyncSubscription {
    /// Blocks until the sync completes or the timeout expires.
    pub fn wait(&self, timeout: Duration) -> Result<(), CookieSyncError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(CookieSyncError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(CookieSyncError::Aborted)
            }
        }
    }

    /// An already-completed subscription, used by watchers whose
    /// `flush_pending_events` has nothing to flush.
    pub fn ready(result: Result<(), CookieSyncError>) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.try_send(result);
        Self { rx }
    }

    pub(crate) fn from_receiver(rx: Receiver<Result<(), CookieSyncError>>) -> Self {
        Self { rx }
    }
}

struct Cookie {
    num_pending: AtomicUsize,
    tx: Sender<Result<(), CookieSyncError>>,
}

impl Cookie {
    fn fulfill(&self, result: Result<(), CookieSyncError>) {
        // The channel holds a single slot; the first of fulfill/abort wins.
        let _ = self.tx.try_send(result);
    }
}

struct CookieDirectories {
    dirs: FxHashSet<String>,
}

/// Writes marker files and maps their observation back to completion
/// promises, guaranteeing that a successful sync has observed every
/// filesystem change made before it started.
pub struct CookieSync {
    /// Host component of cookie filenames; kept process-wide unique.
    unique: String,
    dirs: RwLock<CookieDirectories>,
    serial: AtomicU32,
    /// Outstanding cookies, keyed by the full path of each cookie file.
    cookies: DashMap<String, Arc<Cookie>>,
}

impl CookieSync {
    pub fn new(dir: impl Into<String>) -> Self {
        let mut dirs = FxHashSet::default();
        dirs.insert(dir.into());
        Self {
            unique: hostname_or_pid(),
            dirs: RwLock::new(CookieDirectories { dirs }),
            serial: AtomicU32::new(0),
            cookies: DashMap::new(),
        }
    }

    /// Replaces the set of cookie directories with exactly `dir`.
    pub fn set_cookie_dir(&self, dir: impl Into<String>) {
        let mut guard = self.dirs.write();
        guard.dirs.clear();
        guard.dirs.insert(dir.into());
    }

    pub fn add_cookie_dir(&self, dir: impl Into<String>) {
        self.dirs.write().dirs.insert(dir.into());
    }

    pub fn remove_cookie_dir(&self, dir: &str) {
        self.dirs.write().dirs.remove(dir);
    }

    pub fn cookie_dirs(&self) -> FxHashSet<String> {
        self.dirs.read().dirs.clone()
    }

    pub fn is_cookie_dir(&self, path: &str) -> bool {
        self.dirs.read().dirs.contains(path)
    }

    /// True when `path` is a file that this root's sync machinery would have
    /// created: it lives directly in a cookie directory and carries the
    /// cookie filename prefix.
    pub fn is_cookie_prefix(&self, path: &str) -> bool {
        let base = base_name(path);
        if !base.starts_with(COOKIE_PREFIX) {
            return false;
        }
        let dir = crate::name::dir_name(path);
        self.dirs.read().dirs.contains(dir)
    }

    /// Writes one cookie file per configured cookie directory and returns a
    /// promise that completes when all of them have been observed.
    pub fn sync(&self) -> Result<SyncSubscription, CookieSyncError> {
        let serial = self.serial.fetch_add(1, Ordering::AcqRel);
        let dirs: Vec<String> = self.dirs.read().dirs.iter().cloned().collect();
        debug_assert!(!dirs.is_empty(), "cookie sync requires a cookie directory");

        let (tx, rx) = bounded(1);
        let cookie = Arc::new(Cookie {
            num_pending: AtomicUsize::new(dirs.len()),
            tx,
        });

        let filename = format!("{COOKIE_PREFIX}{}-{}-{serial}", self.unique, process::id());
        let mut written = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            let path = path_cat(dir, &filename);
            if let Err(err) = write_cookie_file(&path) {
                // Roll back whatever we already registered; the caller
                // decides whether to retry against a different cookie dir.
                for prior in &written {
                    self.cookies.remove(prior);
                    let _ = fs::remove_file(prior);
                }
                return Err(CookieSyncError::io("create", path, &err));
            }
            self.cookies.insert(path.clone(), Arc::clone(&cookie));
            written.push(path);
        }
        debug!(serial, cookies = written.len(), "cookie sync started");
        Ok(SyncSubscription::from_receiver(rx))
    }

    /// Convenience wrapper: sync and wait with a deadline.
    pub fn sync_to_now(&self, timeout: Duration) -> Result<(), CookieSyncError> {
        self.sync()?.wait(timeout)
    }

    /// Called by the IO thread when a path with the cookie prefix has been
    /// observed. Fulfills the owning promise once every cookie written by
    /// its `sync` call has arrived.
    pub fn notify_cookie(&self, path: &str) {
        let Some((path, cookie)) = self.cookies.remove(path) else {
            return;
        };
        let _ = fs::remove_file(&path);
        if cookie.num_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(path = %path, "cookie observed, fulfilling sync");
            cookie.fulfill(Ok(()));
        }
    }

    /// Fails every outstanding cookie promise. Used after a desync-driven
    /// recrawl so that clients re-issue their sync against the recrawled
    /// watcher.
    pub fn abort_all_cookies(&self) {
        let outstanding: Vec<(String, Arc<Cookie>)> = {
            let mut drained = Vec::new();
            self.cookies.retain(|path, cookie| {
                drained.push((path.clone(), Arc::clone(cookie)));
                false
            });
            drained
        };
        if !outstanding.is_empty() {
            debug!(count = outstanding.len(), "aborting outstanding cookies");
        }
        for (path, cookie) in outstanding {
            let _ = fs::remove_file(&path);
            cookie.fulfill(Err(CookieSyncError::Aborted));
        }
    }

    /// The cookies currently awaiting observation; diagnostic only.
    pub fn outstanding_cookie_files(&self) -> Vec<String> {
        self.cookies.iter().map(|e| e.key().clone()).collect()
    }
}

fn write_cookie_file(path: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    // The contents are irrelevant; the pid aids manual debugging.
    write!(file, "{}", process::id())
}

fn hostname_or_pid() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| process::id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_sync() -> (tempfile::TempDir, CookieSync) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_owned();
        (dir, CookieSync::new(root))
    }

    #[test]
    fn sync_completes_when_cookie_observed() {
        let (_dir, cookies) = temp_sync();
        let subscription = cookies.sync().unwrap();

        let outstanding = cookies.outstanding_cookie_files();
        assert_eq!(outstanding.len(), 1);
        assert!(base_name(&outstanding[0]).starts_with(COOKIE_PREFIX));

        cookies.notify_cookie(&outstanding[0]);
        subscription.wait(Duration::from_secs(1)).unwrap();
        assert!(cookies.outstanding_cookie_files().is_empty());
    }

    #[test]
    fn sync_times_out_without_observation() {
        let (_dir, cookies) = temp_sync();
        let subscription = cookies.sync().unwrap();
        match subscription.wait(Duration::from_millis(10)) {
            Err(CookieSyncError::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        // The cookie stays in place; a later observation still fires the
        // promise harmlessly.
        assert_eq!(cookies.outstanding_cookie_files().len(), 1);
    }

    #[test]
    fn abort_fails_all_outstanding() {
        let (_dir, cookies) = temp_sync();
        let first = cookies.sync().unwrap();
        let second = cookies.sync().unwrap();
        cookies.abort_all_cookies();
        assert!(matches!(
            first.wait(Duration::from_secs(1)),
            Err(CookieSyncError::Aborted)
        ));
        assert!(matches!(
            second.wait(Duration::from_secs(1)),
            Err(CookieSyncError::Aborted)
        ));
    }

    #[test]
    fn multi_dir_sync_requires_all_cookies() {
        let (dir, cookies) = temp_sync();
        let second_dir = dir.path().join("sub");
        fs::create_dir(&second_dir).unwrap();
        cookies.add_cookie_dir(second_dir.to_str().unwrap());

        let subscription = cookies.sync().unwrap();
        let outstanding = cookies.outstanding_cookie_files();
        assert_eq!(outstanding.len(), 2);

        cookies.notify_cookie(&outstanding[0]);
        assert!(matches!(
            subscription.wait(Duration::from_millis(10)),
            Err(CookieSyncError::Timeout)
        ));
        cookies.notify_cookie(&outstanding[1]);
        subscription.wait(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn missing_cookie_dir_reports_io_error() {
        let (dir, cookies) = temp_sync();
        let gone = dir.path().join("vanished");
        cookies.set_cookie_dir(gone.to_str().unwrap());
        match cookies.sync() {
            Err(err @ CookieSyncError::Io { .. }) => assert!(err.is_cookie_dir_gone()),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn cookie_prefix_detection() {
        let (dir, cookies) = temp_sync();
        let root = dir.path().to_str().unwrap();
        let cookie_path = format!("{root}/{COOKIE_PREFIX}h-1-0");
        assert!(cookies.is_cookie_prefix(&cookie_path));
        assert!(!cookies.is_cookie_prefix(&format!("{root}/regular-file")));
        assert!(!cookies.is_cookie_prefix(&format!(
            "{root}/nested/{COOKIE_PREFIX}h-1-0"
        )));
        assert!(is_possibly_a_cookie(&cookie_path));
    }
}
