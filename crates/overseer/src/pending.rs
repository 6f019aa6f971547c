use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime},
};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{cookies::is_possibly_a_cookie, name::is_path_prefix, path_map::OrderedPathMapExt};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingFlags: u8 {
        /// Requires a recursive scan of the children of this path.
        const RECURSIVE = 1 << 0;
        /// The change event came from the watcher.
        const VIA_NOTIFY = 1 << 1;
        /// Describes a directory to crawl; skip the stat pass for the path
        /// itself.
        const CRAWL_ONLY = 1 << 2;
        /// Produced while the watcher was desynced and may be incomplete.
        /// Cookies observed under this flag must be ignored.
        const IS_DESYNCED = 1 << 3;
        /// Stat every direct child once but do not descend.
        const NONRECURSIVE_SCAN = 1 << 4;
    }
}

/// A coalesced record of "something changed at this path; re-examine it".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub path: String,
    pub now: SystemTime,
    pub flags: PendingFlags,
}

#[derive(Debug)]
struct PendingEntry {
    seq: u64,
    now: SystemTime,
    flags: PendingFlags,
}

/// An ordered set of pending changes keyed by path, with ancestor/descendant
/// coalescing. The caller provides locking; see [`PendingCollection`].
#[derive(Debug, Default)]
pub struct PendingChanges {
    tree: BTreeMap<String, PendingEntry>,
    next_seq: u64,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn clear(&mut self) {
        self.tree.clear();
    }

    /// Adds a pending change, consolidating with an existing entry at the
    /// same path and applying both coalescing rules:
    ///
    /// - a path covered by a pending `RECURSIVE` ancestor is a no-op;
    /// - a newly `RECURSIVE` path obsoletes its pending descendants,
    ///   absorbing their flags and the latest observation time.
    ///
    /// Cookie notifications are exempt: they must be observed via the
    /// notification path for synchronization to be correct, so they are
    /// never collapsed into a containing directory.
    pub fn add(&mut self, path: &str, now: SystemTime, flags: PendingFlags) {
        if let Some(entry) = self.tree.get_mut(path) {
            let newly_recursive =
                flags.contains(PendingFlags::RECURSIVE) && !entry.flags.contains(PendingFlags::RECURSIVE);
            entry.flags |= flags;
            if now > entry.now {
                entry.now = now;
            }
            if newly_recursive {
                self.prune_obsoleted_children(path);
            }
            return;
        }

        if !is_possibly_a_cookie(path) && self.is_obsoleted_by_containing_dir(path) {
            return;
        }

        let mut entry = PendingEntry {
            seq: self.next_seq,
            now,
            flags,
        };
        self.next_seq += 1;

        if flags.contains(PendingFlags::RECURSIVE) {
            for (_, child) in self.collect_obsoleted_children(path) {
                entry.flags |= child.flags;
                if child.now > entry.now {
                    entry.now = child.now;
                }
            }
        }

        self.tree.insert(path.to_owned(), entry);
    }

    /// Merges the full contents of `other` into this collection, preserving
    /// the relative order of its items.
    pub fn append(&mut self, other: &mut PendingChanges) {
        for item in other.steal_items() {
            self.add(&item.path, item.now, item.flags);
        }
    }

    /// Removes and returns all items in insertion order. Items that were
    /// obsoleted by a later `RECURSIVE` ancestor have already been removed
    /// from the tree and are therefore not yielded.
    pub fn steal_items(&mut self) -> Vec<PendingChange> {
        let tree = std::mem::take(&mut self.tree);
        let mut items: Vec<(u64, PendingChange)> = tree
            .into_iter()
            .map(|(path, entry)| {
                (
                    entry.seq,
                    PendingChange {
                        path,
                        now: entry.now,
                        flags: entry.flags,
                    },
                )
            })
            .collect();
        items.sort_by_key(|(seq, _)| *seq);
        items.into_iter().map(|(_, item)| item).collect()
    }

    fn is_obsoleted_by_containing_dir(&self, path: &str) -> bool {
        // Walk the ancestor chain; any pending recursive ancestor covers us.
        let mut end = path.len();
        while let Some(idx) = path[..end].rfind('/') {
            let ancestor = &path[..idx];
            if let Some(entry) = self.tree.get(ancestor) {
                debug_assert!(is_path_prefix(path, ancestor));
                if entry.flags.contains(PendingFlags::RECURSIVE) {
                    return true;
                }
            }
            end = idx;
        }
        false
    }

    fn collect_obsoleted_children(&mut self, path: &str) -> Vec<(String, PendingEntry)> {
        let mut removed = self.tree.extract_path_with_children(path);
        // Cookies must survive: re-insert any we swept up.
        removed.retain(|(child, entry)| {
            if is_possibly_a_cookie(child) {
                self.tree.insert(
                    child.clone(),
                    PendingEntry {
                        seq: entry.seq,
                        now: entry.now,
                        flags: entry.flags,
                    },
                );
                false
            } else {
                true
            }
        });
        removed
    }

    fn prune_obsoleted_children(&mut self, path: &str) {
        let survivor = self.tree.get(path).map(|e| e.seq);
        let children = self.collect_obsoleted_children(path);
        if let Some(seq) = survivor {
            // collect_obsoleted_children also removed `path` itself.
            let (absorb_flags, absorb_now) = children.iter().fold(
                (PendingFlags::empty(), SystemTime::UNIX_EPOCH),
                |(flags, now), (_, entry)| (flags | entry.flags, now.max(entry.now)),
            );
            if let Some((_, mut entry)) = children.into_iter().find(|(p, _)| p == path) {
                entry.seq = seq;
                entry.flags |= absorb_flags;
                if absorb_now > entry.now {
                    entry.now = absorb_now;
                }
                self.tree.insert(path.to_owned(), entry);
            }
        }
    }
}

/// The shared pending queue between the notify and IO threads: a
/// [`PendingChanges`] behind a mutex with an associated condition variable
/// and ping flag.
#[derive(Default)]
pub struct PendingCollection {
    inner: Mutex<PendingChanges>,
    cond: Condvar,
    pinged: AtomicBool,
}

impl PendingCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, PendingChanges> {
        self.inner.lock()
    }

    /// Marks the collection as signalled and wakes one waiter, even when the
    /// collection is empty. Does not require the lock.
    pub fn ping(&self) {
        self.pinged.store(true, Ordering::Release);
        self.cond.notify_one();
    }

    /// Acquires the lock; when the collection is empty and not pinged, waits
    /// for a ping or the timeout. Returns the guard and whether a ping was
    /// consumed.
    pub fn lock_and_wait(&self, timeout: Duration) -> (MutexGuard<'_, PendingChanges>, bool) {
        let mut guard = self.inner.lock();
        if guard.is_empty() && !self.check_and_reset_pinged() {
            self.cond.wait_for(&mut guard, timeout);
        }
        let pinged = self.check_and_reset_pinged();
        (guard, pinged)
    }

    fn check_and_reset_pinged(&self) -> bool {
        self.pinged.swap(false, Ordering::AcqRel)
    }
}
