use std::{collections::VecDeque, io, time::Duration};

use parking_lot::Mutex;

use super::{ConsumeResult, DirHandle, Watcher, WatcherCaps, read_dir_handle};
use crate::pending::{PendingChange, PendingChanges};

/// A watcher fed directly by tests. Directory iteration reads the real
/// filesystem; "OS events" are whatever the test injects.
pub(crate) struct FakeWatcher {
    caps: WatcherCaps,
    queue: Mutex<VecDeque<PendingChange>>,
    cancel_next: Mutex<bool>,
    /// One-shot fault: the next listing of this path is truncated and
    /// reports a transient read error.
    fail_read_of: Mutex<Option<(String, usize)>>,
}

impl FakeWatcher {
    pub fn new(caps: WatcherCaps) -> Self {
        Self {
            caps,
            queue: Mutex::new(VecDeque::new()),
            cancel_next: Mutex::new(false),
            fail_read_of: Mutex::new(None),
        }
    }

    pub fn per_file() -> Self {
        Self::new(WatcherCaps::PER_FILE_NOTIFICATIONS | WatcherCaps::COALESCED_RENAME)
    }

    pub fn inject(&self, change: PendingChange) {
        self.queue.lock().push_back(change);
    }

    #[allow(dead_code)]
    pub fn request_cancel(&self) {
        *self.cancel_next.lock() = true;
    }

    /// Makes the next `start_watch_dir` of `path` keep only the first
    /// `keep` entries (by name) and report a mid-iteration error.
    pub fn fail_next_read_of(&self, path: &str, keep: usize) {
        *self.fail_read_of.lock() = Some((path.to_owned(), keep));
    }
}

impl Watcher for FakeWatcher {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn caps(&self) -> WatcherCaps {
        self.caps
    }

    fn start(&self, _root_path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn start_watch_dir(&self, path: &str) -> io::Result<DirHandle> {
        let mut handle = read_dir_handle(path)?;
        let mut fail = self.fail_read_of.lock();
        if fail.as_ref().is_some_and(|(fail_path, _)| fail_path == path) {
            let (_, keep) = fail.take().unwrap();
            handle.entries.sort_by(|a, b| a.name.cmp(&b.name));
            handle.entries.truncate(keep);
            handle.read_error = Some(io::Error::new(
                io::ErrorKind::Interrupted,
                "injected transient read error",
            ));
        }
        Ok(handle)
    }

    fn wait_notify(&self, _timeout: Duration) -> bool {
        !self.queue.lock().is_empty()
    }

    fn consume_notify(&self, _root_path: &str, out: &mut PendingChanges) -> ConsumeResult {
        let mut result = ConsumeResult {
            added_pending: false,
            cancel_self: std::mem::take(&mut *self.cancel_next.lock()),
        };
        while let Some(change) = self.queue.lock().pop_front() {
            out.add(&change.path, change.now, change.flags);
            result.added_pending = true;
        }
        result
    }
}
