use std::time::{Duration, SystemTime};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::{
    clock::ClockStamp,
    fileinfo::FileInformation,
    name::{Name, base_name, dir_name, path_cat},
};

/// Index of a directory node in the view's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(u32);

/// Index of a file node in the view's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u32);

/// One path entry (file, dir entry, symlink, socket, ...) ever observed
/// under the root.
///
/// Deleted entries stay in the tree with `exists == false` until aged out so
/// that since-queries can report the deletion.
#[derive(Debug)]
pub struct FileNode {
    pub name: Name,
    pub parent: DirId,
    pub exists: bool,
    /// Transient flag used while crawling the containing directory.
    pub maybe_deleted: bool,
    /// Clock at which we first observed existence, or the most recent
    /// transition from deleted back to existing.
    pub ctime: ClockStamp,
    /// Clock of the most recent observed change.
    pub otime: ClockStamp,
    pub stat: Option<FileInformation>,
    recency_prev: Option<FileId>,
    recency_next: Option<FileId>,
}

#[derive(Debug)]
pub struct DirNode {
    pub name: Name,
    pub parent: Option<DirId>,
    pub files: FxHashMap<Name, FileId>,
    pub dirs: FxHashMap<Name, DirId>,
    /// True unless we have affirmatively observed non-existence.
    pub last_check_existed: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AgeOutStats {
    pub walked: usize,
    pub aged_files: usize,
    pub aged_dirs: usize,
    /// Highest otime tick among aged-out files; zero when nothing aged.
    pub max_aged_tick: u32,
}

/// The in-memory representation of a watched root: the directory/file graph
/// plus the recency-ordered file list. Owns every node.
#[derive(Debug)]
pub struct ViewDatabase {
    root_path: String,
    dirs: Vec<Option<DirNode>>,
    files: Vec<Option<FileNode>>,
    free_dirs: Vec<DirId>,
    free_files: Vec<FileId>,
    root_dir: DirId,
    latest_file: Option<FileId>,
    root_inode: u64,
}

impl ViewDatabase {
    pub fn new(root_path: impl Into<String>) -> Self {
        let root = DirNode {
            name: Name::new(""),
            parent: None,
            files: FxHashMap::default(),
            dirs: FxHashMap::default(),
            last_check_existed: true,
        };
        Self {
            root_path: root_path.into(),
            dirs: vec![Some(root)],
            files: Vec::new(),
            free_dirs: Vec::new(),
            free_files: Vec::new(),
            root_dir: DirId(0),
            latest_file: None,
            root_inode: 0,
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn root_dir(&self) -> DirId {
        self.root_dir
    }

    pub fn root_inode(&self) -> u64 {
        self.root_inode
    }

    pub fn set_root_inode(&mut self, ino: u64) {
        self.root_inode = ino;
    }

    pub fn dir(&self, id: DirId) -> &DirNode {
        self.dirs[id.0 as usize].as_ref().expect("live dir node")
    }

    pub fn dir_mut(&mut self, id: DirId) -> &mut DirNode {
        self.dirs[id.0 as usize].as_mut().expect("live dir node")
    }

    pub fn file(&self, id: FileId) -> &FileNode {
        self.files[id.0 as usize].as_ref().expect("live file node")
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut FileNode {
        self.files[id.0 as usize].as_mut().expect("live file node")
    }

    /// Head of the recency list: the most recently changed file.
    pub fn latest_file(&self) -> Option<FileId> {
        self.latest_file
    }

    /// Walks the recency list towards older entries.
    pub fn next_changed(&self, id: FileId) -> Option<FileId> {
        self.file(id).recency_next
    }

    /// Full path of a directory, rooted at the watched root path.
    pub fn dir_path(&self, id: DirId) -> String {
        let mut components = Vec::new();
        let mut cursor = Some(id);
        while let Some(dir_id) = cursor {
            let dir = self.dir(dir_id);
            if dir.parent.is_some() {
                components.push(dir.name.as_str());
            }
            cursor = dir.parent;
        }
        let mut path = self.root_path.clone();
        for component in components.iter().rev() {
            path.push('/');
            path.push_str(component);
        }
        path
    }

    pub fn file_path(&self, id: FileId) -> String {
        let file = self.file(id);
        path_cat(&self.dir_path(file.parent), &file.name)
    }

    /// Walks from the root along `path`, optionally creating intermediate
    /// directory nodes. `path` must be the root path itself or an absolute
    /// path below it.
    pub fn resolve_dir(&mut self, path: &str, create: bool) -> Option<DirId> {
        let relative = self.relative_part(path)?;
        let mut current = self.root_dir;
        if relative.is_empty() {
            return Some(current);
        }
        for component in relative.split('/') {
            if let Some(&child) = self.dir(current).dirs.get(component) {
                current = child;
                continue;
            }
            if !create {
                return None;
            }
            let child = self.alloc_dir(DirNode {
                name: Name::new(component),
                parent: Some(current),
                files: FxHashMap::default(),
                dirs: FxHashMap::default(),
                last_check_existed: true,
            });
            let name = self.dir(child).name.clone();
            self.dir_mut(current).dirs.insert(name, child);
            current = child;
        }
        Some(current)
    }

    /// Read-only variant of [`Self::resolve_dir`].
    pub fn resolve_dir_readonly(&self, path: &str) -> Option<DirId> {
        let relative = self.relative_part(path)?;
        let mut current = self.root_dir;
        if relative.is_empty() {
            return Some(current);
        }
        for component in relative.split('/') {
            current = *self.dir(current).dirs.get(component)?;
        }
        Some(current)
    }

    fn relative_part<'a>(&self, path: &'a str) -> Option<&'a str> {
        if path == self.root_path {
            return Some("");
        }
        let rest = path.strip_prefix(&self.root_path)?;
        rest.strip_prefix('/')
    }

    /// Returns the existing child file node, or creates one with the given
    /// ctime. Creation never implies existence; `exists` is set only after a
    /// successful stat. The second element reports whether a node was
    /// created, so the caller can register it with the watcher.
    pub fn get_or_create_child_file(
        &mut self,
        dir: DirId,
        name: &str,
        ctime: ClockStamp,
    ) -> (FileId, bool) {
        if let Some(&existing) = self.dir(dir).files.get(name) {
            return (existing, false);
        }
        let file = self.alloc_file(FileNode {
            name: Name::new(name),
            parent: dir,
            exists: false,
            maybe_deleted: false,
            ctime,
            otime: ctime,
            stat: None,
            recency_prev: None,
            recency_next: None,
        });
        let name = self.file(file).name.clone();
        self.dir_mut(dir).files.insert(name, file);
        self.insert_at_head_of_file_list(file);
        (file, true)
    }

    /// Updates the otime for the file and bubbles it to the front of the
    /// recency list.
    pub fn mark_file_changed(&mut self, file: FileId, otime: ClockStamp) {
        self.file_mut(file).otime = otime;
        self.remove_from_file_list(file);
        self.insert_at_head_of_file_list(file);
    }

    /// Marks a directory as removed. Contained files transition to
    /// `exists == false` and are bubbled on the recency list; child dirs are
    /// visited when `recursive` is set.
    pub fn mark_dir_deleted(&mut self, dir: DirId, otime: ClockStamp, recursive: bool) {
        self.dir_mut(dir).last_check_existed = false;
        let file_ids: Vec<FileId> = self.dir(dir).files.values().copied().collect();
        for file_id in file_ids {
            if self.file(file_id).exists {
                self.file_mut(file_id).exists = false;
                self.mark_file_changed(file_id, otime);
            }
        }
        if recursive {
            let child_dirs: Vec<DirId> = self.dir(dir).dirs.values().copied().collect();
            for child in child_dirs {
                self.mark_dir_deleted(child, otime, true);
            }
        }
    }

    pub fn insert_at_head_of_file_list(&mut self, file: FileId) {
        debug_assert!(self.file(file).recency_prev.is_none());
        debug_assert!(self.file(file).recency_next.is_none());
        let old_head = self.latest_file;
        self.file_mut(file).recency_next = old_head;
        if let Some(head) = old_head {
            self.file_mut(head).recency_prev = Some(file);
        }
        self.latest_file = Some(file);
    }

    fn remove_from_file_list(&mut self, file: FileId) {
        let (prev, next) = {
            let node = self.file_mut(file);
            (node.recency_prev.take(), node.recency_next.take())
        };
        match prev {
            Some(prev) => self.file_mut(prev).recency_next = next,
            None => {
                if self.latest_file == Some(file) {
                    self.latest_file = next;
                }
            }
        }
        if let Some(next) = next {
            self.file_mut(next).recency_prev = prev;
        }
    }

    /// Prunes deleted files whose last change is older than `min_age`,
    /// destroying their nodes and any directory subtrees that correspond to
    /// them. Returns what was pruned so the caller can advance its
    /// `last_age_out_tick`.
    pub fn age_out(&mut self, min_age: Duration, now: SystemTime) -> AgeOutStats {
        let mut stats = AgeOutStats::default();
        let mut dirs_to_erase: FxHashSet<String> = FxHashSet::default();

        let mut cursor = self.latest_file;
        while let Some(file_id) = cursor {
            cursor = self.file(file_id).recency_next;
            stats.walked += 1;

            let file = self.file(file_id);
            if file.exists || file.otime.timestamp + min_age > now {
                continue;
            }

            let full_path = self.file_path(file_id);
            debug!(path = %full_path, "age_out file");
            stats.max_aged_tick = stats.max_aged_tick.max(file.otime.ticks);
            stats.aged_files += 1;

            // A directory node of the same name may remain; arrange to
            // remove it after the file pass.
            dirs_to_erase.insert(full_path);

            let parent = self.file(file_id).parent;
            let name = self.file(file_id).name.clone();
            self.dir_mut(parent).files.remove(name.as_str());
            self.remove_from_file_list(file_id);
            self.free_file(file_id);
        }

        for full_path in dirs_to_erase {
            let Some(parent) = self.resolve_dir_readonly(dir_name(&full_path)) else {
                continue;
            };
            let base = base_name(&full_path);
            if let Some(&child) = self.dir(parent).dirs.get(base) {
                self.dir_mut(parent).dirs.remove(base);
                self.free_dir_recursive(child);
                stats.aged_dirs += 1;
            }
        }

        stats
    }

    fn free_dir_recursive(&mut self, dir: DirId) {
        let (file_ids, dir_ids): (Vec<FileId>, Vec<DirId>) = {
            let node = self.dir(dir);
            (
                node.files.values().copied().collect(),
                node.dirs.values().copied().collect(),
            )
        };
        for file_id in file_ids {
            self.remove_from_file_list(file_id);
            self.free_file(file_id);
        }
        for child in dir_ids {
            self.free_dir_recursive(child);
        }
        self.dirs[dir.0 as usize] = None;
        self.free_dirs.push(dir);
    }

    fn alloc_dir(&mut self, node: DirNode) -> DirId {
        if let Some(id) = self.free_dirs.pop() {
            self.dirs[id.0 as usize] = Some(node);
            id
        } else {
            let id = DirId(self.dirs.len() as u32);
            self.dirs.push(Some(node));
            id
        }
    }

    fn alloc_file(&mut self, node: FileNode) -> FileId {
        if let Some(id) = self.free_files.pop() {
            self.files[id.0 as usize] = Some(node);
            id
        } else {
            let id = FileId(self.files.len() as u32);
            self.files.push(Some(node));
            id
        }
    }

    fn free_file(&mut self, file: FileId) {
        self.files[file.0 as usize] = None;
        self.free_files.push(file);
    }

    /// Verifies the tree/list invariants; test support.
    #[cfg(test)]
    pub fn check_coherence(&self) {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        let mut cursor = self.latest_file;
        let mut last_ticks = u32::MAX;
        let mut prev: Option<FileId> = None;
        while let Some(file_id) = cursor {
            assert!(seen.insert(file_id), "file appears twice in recency list");
            let file = self.file(file_id);
            assert!(
                file.otime.ticks <= last_ticks,
                "recency list is not ordered by otime"
            );
            assert_eq!(file.recency_prev, prev, "broken prev link");
            assert_eq!(
                self.dir(file.parent).files.get(file.name.as_str()),
                Some(&file_id),
                "file is not reachable from its parent"
            );
            last_ticks = file.otime.ticks;
            prev = Some(file_id);
            cursor = file.recency_next;
        }

        // Every live file node must be on the list exactly once.
        let live = self.files.iter().filter(|f| f.is_some()).count();
        assert_eq!(live, seen.len(), "recency list does not cover all files");
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    fn stamp(ticks: u32, secs: u64) -> ClockStamp {
        ClockStamp {
            ticks,
            timestamp: UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    #[test]
    fn resolve_dir_creates_intermediates() {
        let mut view = ViewDatabase::new("/r");
        assert_eq!(view.resolve_dir("/r", false), Some(view.root_dir()));
        assert_eq!(view.resolve_dir("/r/a/b", false), None);

        let b = view.resolve_dir("/r/a/b", true).unwrap();
        assert_eq!(view.dir_path(b), "/r/a/b");
        assert_eq!(view.resolve_dir("/r/a/b", false), Some(b));
        assert_eq!(view.resolve_dir("/elsewhere", true), None);
    }

    #[test]
    fn recency_list_orders_by_change() {
        let mut view = ViewDatabase::new("/r");
        let root = view.root_dir();
        let (a, created_a) = view.get_or_create_child_file(root, "a", stamp(1, 10));
        let (b, created_b) = view.get_or_create_child_file(root, "b", stamp(1, 10));
        assert!(created_a && created_b);

        view.file_mut(a).exists = true;
        view.file_mut(b).exists = true;
        view.mark_file_changed(a, stamp(2, 11));
        view.check_coherence();

        assert_eq!(view.latest_file(), Some(a));
        assert_eq!(view.next_changed(a), Some(b));
        assert_eq!(view.next_changed(b), None);

        view.mark_file_changed(b, stamp(3, 12));
        view.check_coherence();
        assert_eq!(view.latest_file(), Some(b));
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut view = ViewDatabase::new("/r");
        let root = view.root_dir();
        let (a, created) = view.get_or_create_child_file(root, "a", stamp(1, 10));
        assert!(created);
        let (again, created) = view.get_or_create_child_file(root, "a", stamp(2, 11));
        assert!(!created);
        assert_eq!(a, again);
        // ctime is not clobbered by the lookup path.
        assert_eq!(view.file(a).ctime, stamp(1, 10));
    }

    #[test]
    fn mark_dir_deleted_propagates() {
        let mut view = ViewDatabase::new("/r");
        let d = view.resolve_dir("/r/d", true).unwrap();
        let sub = view.resolve_dir("/r/d/sub", true).unwrap();
        let (x, _) = view.get_or_create_child_file(d, "x", stamp(1, 10));
        let (y, _) = view.get_or_create_child_file(sub, "y", stamp(1, 10));
        view.file_mut(x).exists = true;
        view.file_mut(y).exists = true;

        let t = stamp(5, 20);
        view.mark_dir_deleted(d, t, true);
        view.check_coherence();

        assert!(!view.dir(d).last_check_existed);
        assert!(!view.dir(sub).last_check_existed);
        assert!(!view.file(x).exists);
        assert!(!view.file(y).exists);
        assert_eq!(view.file(x).otime, t);
        assert_eq!(view.file(y).otime, t);
    }

    #[test]
    fn age_out_prunes_old_deleted_files() {
        let mut view = ViewDatabase::new("/r");
        let root = view.root_dir();
        let (stale, _) = view.get_or_create_child_file(root, "stale", stamp(2, 100));
        let (fresh, _) = view.get_or_create_child_file(root, "fresh", stamp(3, 1000));
        let (alive, _) = view.get_or_create_child_file(root, "alive", stamp(4, 100));
        view.file_mut(alive).exists = true;
        // stale and fresh are deleted; only stale is old enough to prune.
        view.file_mut(stale).exists = false;
        view.file_mut(fresh).exists = false;

        let now = UNIX_EPOCH + Duration::from_secs(1100);
        let stats = view.age_out(Duration::from_secs(500), now);

        assert_eq!(stats.aged_files, 1);
        assert_eq!(stats.max_aged_tick, 2);
        assert!(view.dir(root).files.get("stale").is_none());
        assert!(view.dir(root).files.get("fresh").is_some());
        assert!(view.dir(root).files.get("alive").is_some());
        view.check_coherence();
    }

    #[test]
    fn age_out_removes_deleted_dir_shadows() {
        let mut view = ViewDatabase::new("/r");
        let root = view.root_dir();
        // A dir entry is modeled as both a file node (for reporting) and a
        // dir node (for structure).
        let (d_file, _) = view.get_or_create_child_file(root, "d", stamp(1, 100));
        view.file_mut(d_file).exists = false;
        let d_dir = view.resolve_dir("/r/d", true).unwrap();
        view.dir_mut(d_dir).last_check_existed = false;

        let now = UNIX_EPOCH + Duration::from_secs(10_000);
        let stats = view.age_out(Duration::from_secs(100), now);
        assert_eq!(stats.aged_files, 1);
        assert_eq!(stats.aged_dirs, 1);
        assert!(view.dir(root).dirs.get("d").is_none());
        view.check_coherence();
    }
}
