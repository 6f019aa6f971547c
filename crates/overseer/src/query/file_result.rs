use std::{io, sync::Arc, time::SystemTime};

use bitflags::bitflags;

use crate::{
    caches::{CacheLookup, ContentHashKey, Sha1Digest, SymlinkTargetKey},
    clock::ClockStamp,
    engine::InMemoryView,
    errors::CacheError,
    fileinfo::{DType, FileInformation},
    name::path_cat,
    view::{FileId, ViewDatabase},
};

bitflags! {
    /// The file properties a query needs but does not have yet; accumulated
    /// by the accessors and satisfied by a batched fetch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Properties: u16 {
        const NAME = 1 << 0;
        const STAT_TIMESTAMPS = 1 << 1;
        const FILE_DTYPE = 1 << 2;
        const CTIME = 1 << 3;
        const OTIME = 1 << 4;
        const CONTENT_SHA1 = 1 << 5;
        const EXISTS = 1 << 6;
        const SIZE = 1 << 7;
        const SYMLINK_TARGET = 1 << 8;
        const FULL_FILE_INFORMATION = 1 << 9;
    }
}

/// Everything a batched fetch has in flight for one file.
#[derive(Default)]
pub struct BatchFetch {
    sha1: Option<CacheLookup<Sha1Digest>>,
    link: Option<CacheLookup<String>>,
}

/// View-independent access to file properties for the query engine.
///
/// Accessors return `None` when the data is not yet loaded; the caller
/// parks the file in a batch, fetches the needed properties for the whole
/// batch at once, and re-evaluates.
pub trait FileResult: Send {
    fn base_name(&self) -> &str;

    /// Full path of the containing directory, rooted at the watched root.
    fn dir_name(&self) -> &str;

    fn exists(&mut self) -> Option<bool>;
    fn stat(&mut self) -> Option<FileInformation>;
    fn size(&mut self) -> Option<u64>;
    fn dtype(&mut self) -> Option<DType>;
    fn ctime(&mut self) -> Option<ClockStamp>;
    fn otime(&mut self) -> Option<ClockStamp>;
    fn accessed_time(&mut self) -> Option<SystemTime>;
    fn modified_time(&mut self) -> Option<SystemTime>;
    fn changed_time(&mut self) -> Option<SystemTime>;

    /// SHA-1 of the contents. `Some(Err(..))` carries a per-file error that
    /// the renderer embeds in the output rather than failing the query.
    fn content_sha1(&mut self) -> Option<Result<Sha1Digest, CacheError>>;

    /// `Some(None)` means "not a symlink / unreadable"; `None` means the
    /// target has not been loaded yet.
    fn read_link(&mut self) -> Option<Option<String>>;

    fn needed_properties(&self) -> Properties;
    fn clear_needed_properties(&mut self);

    /// Issues asynchronous loads for the needed properties.
    fn begin_batch_fetch(&mut self) -> BatchFetch;

    /// Waits for the loads issued by [`Self::begin_batch_fetch`] and stores
    /// the results, clearing the needed set.
    fn complete_batch_fetch(&mut self, fetch: BatchFetch);
}

/// Loads all outstanding properties for a batch of deferred files. All
/// loads are issued before any are awaited so the cache can serve them
/// concurrently.
pub fn batch_fetch_properties(files: &mut [Box<dyn FileResult>]) {
    let fetches: Vec<BatchFetch> = files.iter_mut().map(|f| f.begin_batch_fetch()).collect();
    for (file, fetch) in files.iter_mut().zip(fetches) {
        file.complete_batch_fetch(fetch);
    }
}

/// A snapshot of one file node taken under the view lock, plus lazily
/// fetched content hash and symlink target.
pub struct InMemoryFileResult {
    engine: Arc<InMemoryView>,
    base_name: String,
    dir_path: String,
    exists: bool,
    /// Nodes that were generated for a deletion we never observed on disk
    /// carry a zeroed stat, like the tree they were snapshotted from.
    stat: FileInformation,
    ctime: ClockStamp,
    otime: ClockStamp,
    sha1: Option<Result<Sha1Digest, CacheError>>,
    symlink_target: Option<Option<String>>,
    needed: Properties,
}

impl InMemoryFileResult {
    pub fn new(engine: Arc<InMemoryView>, view: &ViewDatabase, file_id: FileId) -> Self {
        let file = view.file(file_id);
        Self {
            base_name: file.name.to_string(),
            dir_path: view.dir_path(file.parent),
            exists: file.exists,
            stat: file.stat.unwrap_or_else(FileInformation::zeroed),
            ctime: file.ctime,
            otime: file.otime,
            engine,
            sha1: None,
            symlink_target: None,
            needed: Properties::empty(),
        }
    }

    fn relative_path(&self) -> String {
        let full = path_cat(&self.dir_path, &self.base_name);
        full.strip_prefix(self.engine.root_path())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_owned)
            .unwrap_or(full)
    }
}

impl FileResult for InMemoryFileResult {
    fn base_name(&self) -> &str {
        &self.base_name
    }

    fn dir_name(&self) -> &str {
        &self.dir_path
    }

    fn exists(&mut self) -> Option<bool> {
        Some(self.exists)
    }

    fn stat(&mut self) -> Option<FileInformation> {
        Some(self.stat)
    }

    fn size(&mut self) -> Option<u64> {
        Some(self.stat.size)
    }

    fn dtype(&mut self) -> Option<DType> {
        Some(self.stat.dtype())
    }

    fn ctime(&mut self) -> Option<ClockStamp> {
        Some(self.ctime)
    }

    fn otime(&mut self) -> Option<ClockStamp> {
        Some(self.otime)
    }

    fn accessed_time(&mut self) -> Option<SystemTime> {
        Some(self.stat.atime)
    }

    fn modified_time(&mut self) -> Option<SystemTime> {
        Some(self.stat.mtime)
    }

    fn changed_time(&mut self) -> Option<SystemTime> {
        Some(self.stat.ctime)
    }

    fn content_sha1(&mut self) -> Option<Result<Sha1Digest, CacheError>> {
        if let Some(sha1) = &self.sha1 {
            return Some(sha1.clone());
        }
        self.needed |= Properties::CONTENT_SHA1;
        None
    }

    fn read_link(&mut self) -> Option<Option<String>> {
        if !self.stat.is_symlink() {
            return Some(None);
        }
        if let Some(target) = &self.symlink_target {
            return Some(target.clone());
        }
        self.needed |= Properties::SYMLINK_TARGET;
        None
    }

    fn needed_properties(&self) -> Properties {
        self.needed
    }

    fn clear_needed_properties(&mut self) {
        self.needed = Properties::empty();
    }

    fn begin_batch_fetch(&mut self) -> BatchFetch {
        let mut fetch = BatchFetch::default();
        if self.needed.contains(Properties::CONTENT_SHA1) && self.sha1.is_none() {
            if self.exists && self.stat.is_file() {
                let key = ContentHashKey::new(self.relative_path(), &self.stat);
                fetch.sha1 = Some(self.engine.caches().content_hash.get(&key));
            } else if self.exists && self.stat.is_dir() {
                self.sha1 = Some(Err(CacheError {
                    kind: io::ErrorKind::IsADirectory,
                    message: "is a directory".into(),
                }));
            } else {
                self.sha1 = Some(Err(CacheError {
                    kind: io::ErrorKind::NotFound,
                    message: "file does not exist".into(),
                }));
            }
        }
        if self.needed.contains(Properties::SYMLINK_TARGET) && self.symlink_target.is_none() {
            let key = SymlinkTargetKey::new(self.relative_path(), self.otime);
            fetch.link = Some(self.engine.caches().symlink_targets.get(&key));
        }
        fetch
    }

    fn complete_batch_fetch(&mut self, fetch: BatchFetch) {
        if let Some(lookup) = fetch.sha1 {
            self.sha1 = Some(lookup.wait());
        }
        if let Some(lookup) = fetch.link {
            self.symlink_target = Some(lookup.wait().ok());
        }
        self.clear_needed_properties();
    }
}
