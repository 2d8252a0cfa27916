/// An implementation of an LRU (Least Recently Used) cache with single-flight loading and dirty
/// entry tracking.
///
use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;

use crate::errors::{Error, Result};

type LoadFuture<V> = BoxFuture<'static, Result<Arc<V>>>;

/// An LRU (least recently used) cache.
///
/// Values must implement ``Cacheable``, which self reports size, intended to be the number of
/// bytes (more or less) an object takes up in memory.
///
/// The ``limit`` is passed in when instantiating the Cache. When the total size of objects stored
/// in the cache exceeds the limit, clean objects are evicted in least recently used order until
/// the total size is back under the limit.
///
/// Objects may be inserted dirty, meaning they hold writes the backing store hasn't seen yet.
/// Dirty objects are never evicted. They may push the cache past ``limit``, up to
/// ``hard_limit``, until the owner writes them out and marks them clean. An insert that would
/// exceed ``hard_limit`` fails with ``Error::CacheFull``.
///
/// When interrogating the cache with ``get``, a ``load`` function is passed in that can be used to
/// load the object from an underlying object store in the event of a cache miss. If multiple
/// requests for the same object come in while it is loading, the object is only loaded once, and
/// every request receives the outcome of that single load, error included. A load keeps running
/// for as long as anyone is waiting on it, even if the request that started it goes away. When
/// every waiter has gone away the load is dropped.
///
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Cacheable + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V>>,
}

/// A trait for objects that can be cached
///
/// Cacheable objects must be able to self report their size via the ``size`` method.
///
pub trait Cacheable: Sized {
    /// Return the number of bytes this object occupies
    fn size(&self) -> u64;
}

/// Counters and sizes describing a cache's state at one moment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
    pub entries: usize,
    pub dirty: usize,
    pub resident: u64,
}

struct Inner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Cacheable + Send + Sync + 'static,
{
    /// The actual cache
    recent: Mutex<Entries<K, V>>,

    /// Loads currently in flight, by key. Lock ordering: ``loaders`` before ``recent``.
    loaders: Mutex<HashMap<K, Loader<V>>>,

    next_load: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Handle on an in-flight load. Only waiters hold the load alive.
struct Loader<V> {
    id: u64,
    load: WeakShared<LoadFuture<V>>,
}

/// A structure containing the entries stored in this cache.
///
/// Entries are directly accessible via ``map`` and also stored in a doubly
/// linked list where ``most_recent`` and ``least_recent`` are the two ends.
///
struct Entries<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    /// Nominal capacity. Clean entries are evicted to stay at or below it.
    limit: u64,

    /// Ceiling that dirty entries may not push the cache past.
    hard_limit: u64,

    /// Current sum of sizes of all entries.
    size: u64,

    /// Direct mapping from key to cache entry
    map: HashMap<K, CacheEntry<K, V>>,

    /// The most recently used key
    most_recent: Option<K>,

    /// The least recently used key
    least_recent: Option<K>,

    /// Source of versions stamped on each insert
    next_version: u64,

    evictions: u64,
}

/// An entry in the cache
struct CacheEntry<K, V> {
    /// The key for the object in this entry
    key: K,

    /// The object stored by this entry
    object: Arc<V>,

    /// The next more recent key
    more_recent: Option<K>,

    /// The next less recent key
    less_recent: Option<K>,

    /// The size of this entry, as reported by the object's ``Cacheable::size`` method
    size: u64,

    /// Whether this object holds writes not yet persisted
    dirty: bool,

    /// Bumped on every insert, so a write-out of an older object doesn't clean a newer one
    version: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Cacheable + Send + Sync + 'static,
{
    /// Instantiate an empty cache with given size limits.
    ///
    pub fn new(limit: u64, hard_limit: u64) -> Self {
        let recent = Mutex::new(Entries {
            limit,
            hard_limit: hard_limit.max(limit),
            size: 0,
            map: HashMap::new(),
            most_recent: None,
            least_recent: None,
            next_version: 0,
            evictions: 0,
        });
        let inner = Inner {
            recent,
            loaders: Mutex::new(HashMap::new()),
            next_load: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Get an object by key
    ///
    /// If object isn't in the cache, will call ``load`` to load the object and then store it in
    /// the cache. If the same object is already being loaded, this will wait for that load to
    /// finish and return its outcome.
    ///
    pub async fn get<L>(&self, key: &K, load: L) -> Result<Arc<V>>
    where
        L: FnOnce(K) -> BoxFuture<'static, Result<V>>,
    {
        let pending = {
            let mut loaders = self.inner.loaders.lock();
            if let Some(object) = self.inner.recent.lock().lookup(key) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(object);
            }

            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            match loaders.get(key).and_then(|loader| loader.load.upgrade()) {
                Some(pending) => pending,
                None => {
                    let id = self.inner.next_load.fetch_add(1, Ordering::Relaxed);
                    let pending = Inner::start(&self.inner, key.clone(), id, load);
                    if let Some(load) = pending.downgrade() {
                        loaders.insert(key.clone(), Loader { id, load });
                    }

                    pending
                }
            }
        };

        pending.await
    }

    /// Check whether an object is resident, without loading it or changing its recency.
    ///
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.inner.recent.lock();
        entries.map.get(key).map(|entry| Arc::clone(&entry.object))
    }

    /// Insert or overwrite an object.
    ///
    /// Clean objects that don't fit under the limit, even after evicting every other clean object,
    /// are not kept. Dirty objects are always kept, unless that would exceed the hard limit, in
    /// which case this fails with ``Error::CacheFull`` and the cache is left unchanged.
    ///
    /// Returns the version stamped on the new entry, if it was kept.
    ///
    pub fn insert(&self, key: K, object: Arc<V>, dirty: bool) -> Result<Option<u64>> {
        let _loaders = self.inner.loaders.lock();
        self.inner.recent.lock().insert(key, object, dirty)
    }

    /// Dirty entries that must be written out before the cache can shrink back under its limit,
    /// least recently used first.
    ///
    pub fn dirty_over_limit(&self) -> Vec<(K, Arc<V>, u64)> {
        self.inner.recent.lock().dirty_over_limit()
    }

    /// All dirty entries whose key satisfies ``select``, least recently used first.
    ///
    pub fn dirty_where<F>(&self, select: F) -> Vec<(K, Arc<V>, u64)>
    where
        F: Fn(&K) -> bool,
    {
        self.inner.recent.lock().dirty_where(select)
    }

    /// Mark an entry clean, if it is still at ``version``.
    ///
    pub fn mark_clean(&self, key: &K, version: u64) -> bool {
        self.inner.recent.lock().mark_clean(key, version)
    }

    /// Evict clean entries, least recently used first, until the cache is within its limit.
    ///
    /// Returns the number of entries evicted.
    ///
    pub fn evict(&self) -> usize {
        self.inner.recent.lock().evict_clean()
    }

    /// Remove every entry whose key satisfies ``select``. Dirty entries are only removed if
    /// ``discard_dirty`` is set, losing their writes.
    ///
    pub fn remove_where<F>(&self, select: F, discard_dirty: bool) -> usize
    where
        F: Fn(&K) -> bool,
    {
        self.inner.recent.lock().remove_where(select, discard_dirty)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.recent.lock();
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            loads: self.inner.next_load.load(Ordering::Relaxed),
            evictions: entries.evictions,
            entries: entries.map.len(),
            dirty: entries.map.values().filter(|entry| entry.dirty).count(),
            resident: entries.size,
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Cacheable + Send + Sync + 'static,
{
    /// Build the shared load future for ``key``. On completion it stores the object and retires
    /// its loader, so later requests hit the cache or start afresh.
    ///
    fn start<L>(inner: &Arc<Self>, key: K, id: u64, load: L) -> Shared<LoadFuture<V>>
    where
        L: FnOnce(K) -> BoxFuture<'static, Result<V>>,
    {
        let inner = Arc::clone(inner);
        let loading = load(key.clone());
        let future: LoadFuture<V> = async move {
            let result = loading.await.map(Arc::new);
            inner.finish(&key, id, result)
        }
        .boxed();

        future.shared()
    }

    fn finish(&self, key: &K, id: u64, result: Result<Arc<V>>) -> Result<Arc<V>> {
        let mut loaders = self.loaders.lock();
        if loaders.get(key).map_or(false, |loader| loader.id == id) {
            loaders.remove(key);
        }

        // A write that landed while we were loading wins over what we loaded
        let object = result?;
        let mut entries = self.recent.lock();
        match entries.lookup(key) {
            Some(newer) => Ok(newer),
            None => {
                entries.insert(key.clone(), Arc::clone(&object), false)?;
                Ok(object)
            }
        }
    }
}

impl<K, V> Entries<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    /// Return a new reference to a stored object, moving it to the most recently used spot.
    ///
    fn lookup(&mut self, key: &K) -> Option<Arc<V>> {
        if self.most_recent.as_ref() == Some(key) {
            return self.map.get(key).map(|entry| Arc::clone(&entry.object));
        }

        let entry = self.unlink(key)?;
        let object = Arc::clone(&entry.object);
        self.push_most_recent(entry);

        Some(object)
    }

    /// Put an unlinked entry in the most recently used spot in the linked list.
    ///
    fn push_most_recent(&mut self, mut entry: CacheEntry<K, V>) {
        entry.more_recent = None;
        entry.less_recent = self.most_recent.take();
        if let Some(old_head) = &entry.less_recent {
            if let Some(old_head) = self.map.get_mut(old_head) {
                old_head.more_recent = Some(entry.key.clone());
            }
        }

        self.most_recent = Some(entry.key.clone());
        if self.least_recent.is_none() {
            // This is only object in the list, so it is also the tail
            self.least_recent = Some(entry.key.clone());
        }
        self.map.insert(entry.key.clone(), entry);
    }

    /// Take an entry out of the map and the linked list, without touching ``size``.
    ///
    fn unlink(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        let entry = self.map.remove(key)?;
        match &entry.more_recent {
            Some(more_recent) => {
                if let Some(neighbor) = self.map.get_mut(more_recent) {
                    neighbor.less_recent = entry.less_recent.clone();
                }
            }
            None => self.most_recent = entry.less_recent.clone(),
        }
        match &entry.less_recent {
            Some(less_recent) => {
                if let Some(neighbor) = self.map.get_mut(less_recent) {
                    neighbor.more_recent = entry.more_recent.clone();
                }
            }
            None => self.least_recent = entry.more_recent.clone(),
        }

        Some(entry)
    }

    /// Remove an entry from the cache
    ///
    fn remove(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        let entry = self.unlink(key)?;
        self.size -= entry.size;

        Some(entry)
    }

    /// Keys from least to most recently used
    fn least_recent_first(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut current = self.least_recent.as_ref();
        while let Some(key) = current {
            keys.push(key.clone());
            current = self.map.get(key).and_then(|entry| entry.more_recent.as_ref());
        }

        keys
    }

    fn insert(&mut self, key: K, object: Arc<V>, dirty: bool) -> Result<Option<u64>> {
        let size = object.size();
        let replaced = self.map.get(&key).map_or(0, |entry| entry.size);
        let mut projected = self.size - replaced + size;

        // Pick clean victims, least recent first, until the new object fits
        let mut victims = vec![];
        if projected > self.limit {
            for victim in self.least_recent_first() {
                if projected <= self.limit {
                    break;
                }
                if victim == key {
                    continue;
                }
                if let Some(entry) = self.map.get(&victim) {
                    if !entry.dirty {
                        projected -= entry.size;
                        victims.push(victim);
                    }
                }
            }
        }

        if dirty && projected > self.hard_limit {
            return Err(Error::CacheFull {
                resident: self.size,
                limit: self.hard_limit,
            });
        }
        if !dirty && projected > self.limit {
            // Not worth keeping. Drop any stale copy so it isn't served later.
            if self.map.get(&key).map_or(false, |entry| !entry.dirty) {
                self.remove(&key);
            }
            return Ok(None);
        }

        for victim in victims {
            self.remove(&victim);
            self.evictions += 1;
        }
        self.remove(&key);

        let version = self.next_version;
        self.next_version += 1;
        self.size += size;
        self.push_most_recent(CacheEntry {
            key,
            object,
            more_recent: None,
            less_recent: None,
            size,
            dirty,
            version,
        });

        Ok(Some(version))
    }

    fn dirty_over_limit(&self) -> Vec<(K, Arc<V>, u64)> {
        let mut remaining = self.size;
        let mut dirty = vec![];
        for key in self.least_recent_first() {
            if remaining <= self.limit {
                break;
            }
            if let Some(entry) = self.map.get(&key) {
                remaining -= entry.size;
                if entry.dirty {
                    dirty.push((key, Arc::clone(&entry.object), entry.version));
                }
            }
        }

        dirty
    }

    fn dirty_where<F>(&self, select: F) -> Vec<(K, Arc<V>, u64)>
    where
        F: Fn(&K) -> bool,
    {
        self.least_recent_first()
            .into_iter()
            .filter(|key| select(key))
            .filter_map(|key| {
                let entry = self.map.get(&key)?;
                if entry.dirty {
                    Some((key, Arc::clone(&entry.object), entry.version))
                } else {
                    None
                }
            })
            .collect()
    }

    fn mark_clean(&mut self, key: &K, version: u64) -> bool {
        match self.map.get_mut(key) {
            Some(entry) if entry.version == version => {
                entry.dirty = false;
                true
            }
            _ => false,
        }
    }

    fn evict_clean(&mut self) -> usize {
        let mut evicted = 0;
        for key in self.least_recent_first() {
            if self.size <= self.limit {
                break;
            }
            if self.map.get(&key).map_or(false, |entry| !entry.dirty) {
                self.remove(&key);
                evicted += 1;
            }
        }
        self.evictions += evicted as u64;

        evicted
    }

    fn remove_where<F>(&mut self, select: F, discard_dirty: bool) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let doomed: Vec<K> = self
            .map
            .values()
            .filter(|entry| select(&entry.key) && (discard_dirty || !entry.dirty))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }

        doomed.len()
    }
}
