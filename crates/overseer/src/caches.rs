use std::{
    hash::Hash,
    io::Read,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::{clock::ClockStamp, errors::CacheError, fileinfo::{FileInformation, systime_parts}, name::path_cat};

/// Counters exposed by every cache; `share` counts getters that joined an
/// in-flight load.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hit: u64,
    pub share: u64,
    pub miss: u64,
    pub evict: u64,
    pub store: u64,
    pub load: u64,
    pub erase: u64,
    pub clear_count: u64,
    pub size: usize,
}

/// The result of a cache probe: either immediately available or a receiver
/// for a load in flight.
pub enum CacheLookup<V> {
    Ready(Result<V, CacheError>),
    Pending(Receiver<Result<V, CacheError>>),
}

impl<V> CacheLookup<V> {
    /// Blocks until the value is available.
    pub fn wait(self) -> Result<V, CacheError> {
        match self {
            Self::Ready(result) => result,
            Self::Pending(rx) => rx.recv().unwrap_or_else(|_| {
                Err(CacheError {
                    kind: std::io::ErrorKind::Other,
                    message: "cache load abandoned".into(),
                })
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Loader-thread handle shared between a pending slot and the thread
/// performing the load. Evicting the slot drops only the cache's reference;
/// the load still completes and delivers to its waiters.
struct PendingLoad<V> {
    waiters: Mutex<Vec<Sender<Result<V, CacheError>>>>,
}

enum SlotState<V> {
    Pending(Arc<PendingLoad<V>>),
    Ready {
        value: Result<V, CacheError>,
        stored_at: Instant,
    },
}

struct Slot<K, V> {
    key: K,
    state: SlotState<V>,
    lru_prev: Option<u32>,
    lru_next: Option<u32>,
}

struct Inner<K, V> {
    map: FxHashMap<K, u32>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<u32>,
    /// Most recently used.
    head: Option<u32>,
    tail: Option<u32>,
    stats: CacheStats,
}

struct Shared<K, V> {
    inner: Mutex<Inner<K, V>>,
    loader: Box<dyn Fn(&K) -> Result<V, CacheError> + Send + Sync>,
    max_items: usize,
    error_ttl: Duration,
}

/// A bounded LRU cache with single-flight loads and negative-result
/// caching.
///
/// `get` returns a ready result for cached values; otherwise it starts (or
/// joins) a load running on a worker thread. Loader errors are cached for
/// `error_ttl` and then retried.
pub struct LruCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        max_items: usize,
        error_ttl: Duration,
        loader: impl Fn(&K) -> Result<V, CacheError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    map: FxHashMap::default(),
                    slots: Vec::new(),
                    free: Vec::new(),
                    head: None,
                    tail: None,
                    stats: CacheStats::default(),
                }),
                loader: Box::new(loader),
                max_items,
                error_ttl,
            }),
        }
    }

    pub fn get(&self, key: &K) -> CacheLookup<V> {
        enum Probe<V> {
            Hit(Result<V, CacheError>),
            Share(Arc<PendingLoad<V>>),
            ExpiredError,
        }

        let mut inner = self.shared.inner.lock();
        if let Some(&idx) = inner.map.get(key) {
            let probe = match &inner.slot(idx).state {
                SlotState::Ready {
                    value: Err(_),
                    stored_at,
                } if stored_at.elapsed() >= self.shared.error_ttl => Probe::ExpiredError,
                SlotState::Ready { value, .. } => Probe::Hit(value.clone()),
                SlotState::Pending(load) => Probe::Share(Arc::clone(load)),
            };
            match probe {
                Probe::Hit(value) => {
                    inner.stats.hit += 1;
                    inner.touch(idx);
                    return CacheLookup::Ready(value);
                }
                Probe::Share(load) => {
                    let (tx, rx) = bounded(1);
                    load.waiters.lock().push(tx);
                    inner.stats.share += 1;
                    return CacheLookup::Pending(rx);
                }
                Probe::ExpiredError => {
                    // A cached error past its TTL: retry as if it were a miss.
                    inner.stats.erase += 1;
                    inner.stats.miss += 1;
                    let load = Arc::new(PendingLoad {
                        waiters: Mutex::new(Vec::new()),
                    });
                    inner.slot_mut(idx).state = SlotState::Pending(Arc::clone(&load));
                    inner.touch(idx);
                    let (tx, rx) = bounded(1);
                    load.waiters.lock().push(tx);
                    drop(inner);
                    self.spawn_load(key.clone(), load);
                    return CacheLookup::Pending(rx);
                }
            }
        }

        inner.stats.miss += 1;
        if inner.map.len() >= self.shared.max_items {
            inner.evict_one();
        }
        let load = Arc::new(PendingLoad {
            waiters: Mutex::new(Vec::new()),
        });
        let (tx, rx) = bounded(1);
        load.waiters.lock().push(tx);
        inner.insert(key.clone(), SlotState::Pending(Arc::clone(&load)));
        drop(inner);
        self.spawn_load(key.clone(), load);
        CacheLookup::Pending(rx)
    }

    pub fn erase(&self, key: &K) {
        let mut inner = self.shared.inner.lock();
        if let Some(idx) = inner.map.remove(key) {
            inner.unlink(idx);
            inner.slots[idx as usize] = None;
            inner.free.push(idx);
            inner.stats.erase += 1;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.shared.inner.lock();
        inner.map.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
        inner.stats.clear_count += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.inner.lock();
        let mut stats = inner.stats;
        stats.size = inner.map.len();
        stats
    }

    fn spawn_load(&self, key: K, load: Arc<PendingLoad<V>>) {
        let shared = Arc::clone(&self.shared);
        {
            let mut inner = shared.inner.lock();
            inner.stats.load += 1;
        }
        std::thread::Builder::new()
            .name("cache-load".into())
            .spawn(move || {
                let result = (shared.loader)(&key);
                let mut inner = shared.inner.lock();
                if let Some(&idx) = inner.map.get(&key) {
                    let same_load = matches!(
                        &inner.slot(idx).state,
                        SlotState::Pending(current) if Arc::ptr_eq(current, &load)
                    );
                    if same_load {
                        inner.slot_mut(idx).state = SlotState::Ready {
                            value: result.clone(),
                            stored_at: Instant::now(),
                        };
                        inner.stats.store += 1;
                    }
                }
                drop(inner);
                for waiter in load.waiters.lock().drain(..) {
                    let _ = waiter.try_send(result.clone());
                }
            })
            .expect("spawning cache load thread");
    }
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn slot(&self, idx: u32) -> &Slot<K, V> {
        self.slots[idx as usize].as_ref().expect("live cache slot")
    }

    fn slot_mut(&mut self, idx: u32) -> &mut Slot<K, V> {
        self.slots[idx as usize].as_mut().expect("live cache slot")
    }

    fn insert(&mut self, key: K, state: SlotState<V>) -> u32 {
        let slot = Slot {
            key: key.clone(),
            state,
            lru_prev: None,
            lru_next: None,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(slot));
            idx
        };
        self.map.insert(key, idx);
        self.link_head(idx);
        idx
    }

    fn touch(&mut self, idx: u32) {
        self.unlink(idx);
        self.link_head(idx);
    }

    fn link_head(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let slot = self.slot_mut(idx);
            slot.lru_prev = None;
            slot.lru_next = old_head;
        }
        if let Some(head) = old_head {
            self.slot_mut(head).lru_prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = self.slot_mut(idx);
            (slot.lru_prev.take(), slot.lru_next.take())
        };
        match prev {
            Some(prev) => self.slot_mut(prev).lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slot_mut(next).lru_prev = prev,
            None => self.tail = prev,
        }
    }

    /// Evicts the least recently used completed entry. In-flight loads are
    /// never evicted so their waiters always receive a result.
    fn evict_one(&mut self) {
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            cursor = self.slot(idx).lru_prev;
            if matches!(self.slot(idx).state, SlotState::Ready { .. }) {
                let key = self.slot(idx).key.clone();
                self.map.remove(&key);
                self.unlink(idx);
                self.slots[idx as usize] = None;
                self.free.push(idx);
                self.stats.evict += 1;
                return;
            }
        }
    }
}

pub type Sha1Digest = [u8; 20];

/// Cache key for content hashes. Any metadata change produces a different
/// key, so touch-only modifications invalidate naturally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHashKey {
    pub relative_path: String,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl ContentHashKey {
    pub fn new(relative_path: impl Into<String>, stat: &FileInformation) -> Self {
        let (mtime_secs, mtime_nanos) = systime_parts(stat.mtime);
        Self {
            relative_path: relative_path.into(),
            size: stat.size,
            mtime_secs,
            mtime_nanos,
        }
    }
}

/// SHA-1 digests of file contents, keyed by `{relative_path, size, mtime}`.
pub struct ContentHashCache {
    root_path: String,
    cache: LruCache<ContentHashKey, Sha1Digest>,
}

impl ContentHashCache {
    pub fn new(root_path: impl Into<String>, max_items: usize, error_ttl: Duration) -> Self {
        let root_path = root_path.into();
        let loader_root = root_path.clone();
        let cache = LruCache::new(max_items, error_ttl, move |key: &ContentHashKey| {
            compute_sha1(&path_cat(&loader_root, &key.relative_path))
        });
        Self { root_path, cache }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn get(&self, key: &ContentHashKey) -> CacheLookup<Sha1Digest> {
        self.cache.get(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn compute_sha1(path: &str) -> Result<Sha1Digest, CacheError> {
    debug!(path, "hashing file contents");
    let mut file = std::fs::File::open(path).map_err(CacheError::from)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(CacheError::from)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Cache key for symlink targets; otime keys it to the observed generation
/// of the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymlinkTargetKey {
    pub relative_path: String,
    pub otime_ticks: u32,
    pub otime_secs: i64,
    pub otime_nanos: u32,
}

impl SymlinkTargetKey {
    pub fn new(relative_path: impl Into<String>, otime: ClockStamp) -> Self {
        let (otime_secs, otime_nanos) = systime_parts(otime.timestamp);
        Self {
            relative_path: relative_path.into(),
            otime_ticks: otime.ticks,
            otime_secs,
            otime_nanos,
        }
    }
}

pub struct SymlinkTargetCache {
    cache: LruCache<SymlinkTargetKey, String>,
}

impl SymlinkTargetCache {
    pub fn new(root_path: impl Into<String>, max_items: usize, error_ttl: Duration) -> Self {
        let root_path = root_path.into();
        let cache = LruCache::new(max_items, error_ttl, move |key: &SymlinkTargetKey| {
            let path = path_cat(&root_path, &key.relative_path);
            let target = std::fs::read_link(&path).map_err(CacheError::from)?;
            target
                .into_os_string()
                .into_string()
                .map_err(|target| CacheError {
                    kind: std::io::ErrorKind::InvalidData,
                    message: format!("symlink target {target:?} is not unicode"),
                })
        });
        Self { cache }
    }

    pub fn get(&self, key: &SymlinkTargetKey) -> CacheLookup<String> {
        self.cache.get(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn hit_after_store() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads_in_loader = Arc::clone(&loads);
        let cache: LruCache<u32, u32> =
            LruCache::new(8, Duration::from_millis(50), move |key| {
                loads_in_loader.fetch_add(1, Ordering::SeqCst);
                Ok(key * 2)
            });

        assert_eq!(cache.get(&21).wait().unwrap(), 42);
        assert_eq!(cache.get(&21).wait().unwrap(), 42);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.miss, 1);
        assert_eq!(stats.hit, 1);
        assert_eq!(stats.store, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn concurrent_gets_single_flight() {
        let loads = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = bounded::<()>(0);
        let loads_in_loader = Arc::clone(&loads);
        let cache: Arc<LruCache<u32, u32>> = Arc::new(LruCache::new(
            8,
            Duration::from_millis(50),
            move |key| {
                loads_in_loader.fetch_add(1, Ordering::SeqCst);
                // Hold the load open until every getter has registered.
                release_rx.recv().unwrap();
                Ok(*key + 1)
            },
        ));

        let mut lookups = Vec::new();
        for _ in 0..4 {
            lookups.push(cache.get(&7));
        }
        release_tx.send(()).unwrap();

        for lookup in lookups {
            assert_eq!(lookup.wait().unwrap(), 8);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.miss, 1);
        assert_eq!(stats.share, 3);
    }

    #[test]
    fn negative_results_expire() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_loader = Arc::clone(&attempts);
        let cache: LruCache<u32, u32> =
            LruCache::new(8, Duration::from_millis(20), move |_key| {
                attempts_in_loader.fetch_add(1, Ordering::SeqCst);
                Err(CacheError {
                    kind: std::io::ErrorKind::NotFound,
                    message: "nope".into(),
                })
            });

        assert!(cache.get(&1).wait().is_err());
        // Within the TTL the error is served from cache.
        assert!(cache.get(&1).wait().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&1).wait().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn eviction_is_bounded_and_lru() {
        let cache: LruCache<u32, u32> =
            LruCache::new(2, Duration::from_millis(50), |key| Ok(*key));
        cache.get(&1).wait().unwrap();
        cache.get(&2).wait().unwrap();
        // Touch 1 so that 2 is the eviction candidate.
        cache.get(&1).wait().unwrap();
        cache.get(&3).wait().unwrap();

        let stats = cache.stats();
        assert_eq!(stats.evict, 1);
        assert_eq!(stats.size, 2);

        // 1 is still cached; 2 was evicted and must be re-loaded.
        let before = cache.stats().miss;
        cache.get(&1).wait().unwrap();
        assert_eq!(cache.stats().miss, before);
        cache.get(&2).wait().unwrap();
        assert_eq!(cache.stats().miss, before + 1);
    }

    #[test]
    fn content_hash_of_known_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_owned();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();

        let cache = ContentHashCache::new(root, 16, Duration::from_millis(50));
        let stat = FileInformation::from_path(dir.path().join("f")).unwrap();
        let digest = cache
            .get(&ContentHashKey::new("f", &stat))
            .wait()
            .unwrap();
        // sha1("hello")
        assert_eq!(
            hex(&digest),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    fn hex(digest: &Sha1Digest) -> String {
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}
