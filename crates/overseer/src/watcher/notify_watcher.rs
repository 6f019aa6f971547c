use std::{
    io,
    time::{Duration, SystemTime},
};

use std::collections::VecDeque;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::{
    Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
    event::{MetadataKind, ModifyKind, RenameMode},
};
use parking_lot::Mutex;
use tracing::warn;

use super::{ConsumeResult, DirHandle, Watcher, WatcherCaps, read_dir_handle};
use crate::pending::{PendingChanges, PendingFlags};

enum Message {
    Event(notify::Result<notify::Event>),
    Signal,
}

/// The default watcher adapter, backed by the `notify` crate's recommended
/// platform watcher in recursive mode.
pub struct NotifyWatcher {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    /// Holds the OS watcher; dropping it disconnects the event stream.
    state: Mutex<Option<RecommendedWatcher>>,
    /// Events pulled off the channel by `wait_notify` ahead of the next
    /// `consume_notify` drain; preserves arrival order.
    buffered: Mutex<VecDeque<Message>>,
    /// Set when the event channel disconnects underneath us.
    disconnected: Mutex<bool>,
}

impl NotifyWatcher {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            state: Mutex::new(None),
            buffered: Mutex::new(VecDeque::new()),
            disconnected: Mutex::new(false),
        }
    }

    fn apply_event(
        &self,
        root_path: &str,
        event: notify::Event,
        out: &mut PendingChanges,
    ) -> bool {
        let now = SystemTime::now();

        // The OS dropped events; everything we know may be stale. Emit a
        // single desynced recursive item at the root and let the IO thread
        // recrawl.
        if event.need_rescan() {
            out.add(
                root_path,
                now,
                PendingFlags::RECURSIVE | PendingFlags::IS_DESYNCED,
            );
            return true;
        }

        let mut added = false;
        let mut add_path = |path: &std::path::Path, flags: PendingFlags| {
            let Some(path) = path.to_str() else {
                warn!(?path, "ignoring change with non-unicode path");
                return;
            };
            out.add(path, now, flags);
            added = true;
        };

        match event.kind {
            // Metadata(Any) is included alongside Data changes: some
            // platforms only report an inode metadata change for content
            // writes.
            EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(
                ModifyKind::Data(_)
                | ModifyKind::Metadata(MetadataKind::Any)
                | ModifyKind::Name(RenameMode::Both | RenameMode::From | RenameMode::To)
                | ModifyKind::Any,
            )
            | EventKind::Any => {
                for path in &event.paths {
                    add_path(path, PendingFlags::VIA_NOTIFY);
                }
            }
            EventKind::Modify(ModifyKind::Metadata(..) | ModifyKind::Name(..) | ModifyKind::Other)
            | EventKind::Access(_)
            | EventKind::Other => {}
        }
        added
    }
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher for NotifyWatcher {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn caps(&self) -> WatcherCaps {
        WatcherCaps::PER_FILE_NOTIFICATIONS | WatcherCaps::COALESCED_RENAME
    }

    fn start(&self, root_path: &str) -> anyhow::Result<()> {
        let tx = self.tx.clone();
        // Symlink chains are tracked by the core itself.
        let config = Config::default().with_follow_symlinks(false);
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = tx.send(Message::Event(event));
            },
            config,
        )
        .context("creating platform watcher")?;
        watcher
            .watch(std::path::Path::new(root_path), RecursiveMode::Recursive)
            .with_context(|| format!("watching {root_path}"))?;
        *self.state.lock() = Some(watcher);
        Ok(())
    }

    fn start_watch_dir(&self, path: &str) -> io::Result<DirHandle> {
        // The recursive OS watch already covers this directory; opening it
        // is all that is required.
        read_dir_handle(path)
    }

    fn wait_notify(&self, timeout: Duration) -> bool {
        if !self.buffered.lock().is_empty() || !self.rx.is_empty() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(message @ Message::Event(_)) => {
                self.buffered.lock().push_back(message);
                true
            }
            Ok(Message::Signal) => false,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => false,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                *self.disconnected.lock() = true;
                true
            }
        }
    }

    fn consume_notify(&self, root_path: &str, out: &mut PendingChanges) -> ConsumeResult {
        let mut result = ConsumeResult::default();
        if *self.disconnected.lock() {
            result.cancel_self = true;
            return result;
        }
        let mut next_message = {
            let mut buffered = self.buffered.lock();
            move || -> Option<Message> {
                if let Some(message) = buffered.pop_front() {
                    return Some(message);
                }
                self.rx.try_recv().ok()
            }
        };
        while let Some(message) = next_message() {
            match message {
                Message::Event(Ok(event)) => {
                    if self.apply_event(root_path, event, out) {
                        result.added_pending = true;
                    }
                }
                Message::Event(Err(err)) => {
                    warn!(error = %err, "watcher error; rescanning affected paths");
                    let now = SystemTime::now();
                    if err.paths.is_empty() {
                        out.add(root_path, now, PendingFlags::RECURSIVE);
                    } else {
                        for path in &err.paths {
                            if let Some(path) = path.to_str() {
                                out.add(path, now, PendingFlags::RECURSIVE);
                            }
                        }
                    }
                    result.added_pending = true;
                }
                Message::Signal => {}
            }
        }
        result
    }

    fn signal_threads(&self) {
        let _ = self.tx.send(Message::Signal);
    }

    fn stop(&self) {
        *self.state.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: Vec<std::path::PathBuf>) -> notify::Event {
        let mut event = notify::Event::new(kind);
        event.paths = paths;
        event
    }

    #[test]
    fn create_event_becomes_via_notify_pending() {
        let watcher = NotifyWatcher::new();
        let mut out = PendingChanges::new();
        watcher
            .tx
            .send(Message::Event(Ok(event(
                EventKind::Create(notify::event::CreateKind::File),
                vec!["/r/new.txt".into()],
            ))))
            .unwrap();

        let result = watcher.consume_notify("/r", &mut out);
        assert!(result.added_pending);
        assert!(!result.cancel_self);

        let items = out.steal_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "/r/new.txt");
        assert!(items[0].flags.contains(PendingFlags::VIA_NOTIFY));
    }

    #[test]
    fn rescan_event_desyncs_the_root() {
        let watcher = NotifyWatcher::new();
        let mut out = PendingChanges::new();
        let mut rescan = event(EventKind::Any, vec![]);
        rescan = rescan.set_flag(notify::event::Flag::Rescan);
        watcher.tx.send(Message::Event(Ok(rescan))).unwrap();

        watcher.consume_notify("/r", &mut out);
        let items = out.steal_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "/r");
        assert!(items[0].flags.contains(PendingFlags::RECURSIVE));
        assert!(items[0].flags.contains(PendingFlags::IS_DESYNCED));
    }

    #[test]
    fn access_events_are_ignored() {
        let watcher = NotifyWatcher::new();
        let mut out = PendingChanges::new();
        watcher
            .tx
            .send(Message::Event(Ok(event(
                EventKind::Access(notify::event::AccessKind::Read),
                vec!["/r/file".into()],
            ))))
            .unwrap();
        let result = watcher.consume_notify("/r", &mut out);
        assert!(!result.added_pending);
        assert!(out.is_empty());
    }
}
