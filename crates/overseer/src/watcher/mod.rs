use std::{fs, io, time::Duration};

use bitflags::bitflags;

use crate::{
    cookies::SyncSubscription,
    fileinfo::{DType, FileInformation},
    pending::PendingChanges,
};

mod notify_watcher;

pub use notify_watcher::NotifyWatcher;

#[cfg(test)]
pub(crate) mod fake;

bitflags! {
    /// Capabilities a concrete watcher advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WatcherCaps: u8 {
        /// Emits per-file paths rather than per-directory hints.
        const PER_FILE_NOTIFICATIONS = 1 << 0;
        /// Renames arrive as a single event instead of paired events.
        const COALESCED_RENAME = 1 << 1;
        /// The watch may span multiple independent sub-watches and is
        /// allowed to have multiple cookie directories.
        const SPLIT_WATCH = 1 << 2;
    }
}

/// Result of draining available events from the OS source.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumeResult {
    pub added_pending: bool,
    /// The watcher observed a condition that requires the root to be
    /// cancelled (unmounted, deleted, ...).
    pub cancel_self: bool,
}

/// One directory entry produced while opening a directory for crawling.
#[derive(Debug)]
pub struct DirEntryInfo {
    pub name: String,
    pub dtype: DType,
    /// Filled when the watcher could obtain the entry's stat while
    /// iterating, saving the crawler a second syscall.
    pub pre_stat: Option<FileInformation>,
}

/// An opened directory plus a hint for pre-sizing the child maps.
///
/// A failure to open the directory at all is an `Err` from
/// [`Watcher::start_watch_dir`]; an error partway through iterating it is
/// transient and lands in `read_error` alongside whatever entries were read,
/// so the caller can re-assess the directory instead of treating it as gone.
#[derive(Debug)]
pub struct DirHandle {
    pub entries: Vec<DirEntryInfo>,
    pub nlink_hint: Option<u64>,
    pub read_error: Option<io::Error>,
}

/// The contract between the core and an OS event source.
///
/// Adapters that cannot observe all events reliably must emit
/// `RECURSIVE | IS_DESYNCED` items covering the affected subtree.
pub trait Watcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn caps(&self) -> WatcherCaps;

    /// One-shot setup for the root; called from the notify thread before
    /// anything else.
    fn start(&self, root_path: &str) -> anyhow::Result<()>;

    /// Opens and iterates a directory, ensuring further changes inside it
    /// produce events.
    fn start_watch_dir(&self, path: &str) -> io::Result<DirHandle>;

    /// Optional per-file registration for watchers that need it.
    fn start_watch_file(&self, _path: &str) -> bool {
        true
    }

    /// Blocks until events are available, a signal arrives, or the timeout
    /// expires. Returns whether events may be available.
    fn wait_notify(&self, timeout: Duration) -> bool;

    /// Drains available events into `out`, mapping OS event types to pending
    /// flags.
    fn consume_notify(&self, root_path: &str, out: &mut PendingChanges) -> ConsumeResult;

    /// Wakes any blocked `wait_notify` call.
    fn signal_threads(&self) {}

    /// For watchers that may reorder events relative to cookie observation:
    /// arranges that the IO thread will observe everything emitted so far.
    /// `None` means cookie files alone are sufficient.
    fn flush_pending_events(&self) -> Option<SyncSubscription> {
        None
    }

    /// Tears down OS resources; further events are not required.
    fn stop(&self) {}
}

/// Shared helper: open `path`, collect its entries and the nlink size hint.
pub(crate) fn read_dir_handle(path: &str) -> io::Result<DirHandle> {
    let nlink_hint = FileInformation::from_path(path).ok().map(|info| info.nlink);
    let mut entries = Vec::new();
    let mut read_error = None;
    for entry in fs::read_dir(path)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // The open succeeded but iteration failed partway; hand back
                // what we have rather than pretending the dir is gone.
                read_error = Some(err);
                break;
            }
        };
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(
                path,
                name = ?entry.file_name(),
                "skipping directory entry with non-unicode name"
            );
            continue;
        };
        let pre_stat = entry.metadata().ok().map(|m| FileInformation::from_metadata(&m));
        let dtype = pre_stat.map_or(DType::Unknown, |s| s.dtype());
        entries.push(DirEntryInfo {
            name,
            dtype,
            pre_stat,
        });
    }
    Ok(DirHandle {
        entries,
        nlink_hint,
        read_error,
    })
}
