use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use bytes::Bytes;
use futures::{lock::Mutex as AsyncMutex, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    array::Array,
    cache::{Cache, CacheStats},
    chunk::SingleAttributeChunk,
    config::{CacheConfig, WritePolicy},
    errors::{Error, Result},
    store::ArrayStore,
    tile::ArrayTile,
};

/// Identifies one attribute of one tile of one array. Cheap to clone.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub array: Arc<str>,
    pub tile: ArrayTile,
    pub attribute: Arc<str>,
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}.{}", self.array, self.tile, self.attribute)
    }
}

type DirtyTile = (TileKey, Arc<SingleAttributeChunk>, u64);

/// Keys of tiles the store has no data for, oldest first, holding at most `limit` keys.
#[derive(Debug, Default)]
struct Absent {
    keys: HashSet<TileKey>,
    order: VecDeque<TileKey>,
    limit: usize,
}

impl Absent {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn contains(&self, key: &TileKey) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: TileKey) {
        if self.limit == 0 || !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    fn retain(&mut self, keep: impl Fn(&TileKey) -> bool) {
        self.keys.retain(&keep);
        self.order.retain(&keep);
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Tile level random access over arrays held by an `ArrayStore`.
///
/// Decoded tiles are kept in an LRU cache bounded by `CacheConfig::capacity` bytes. There is one
/// LRU order across all arrays, so a busy array can push out another's tiles; `close_array`,
/// `flush_array` and `discard_array` act on a single array. Concurrent requests for a tile that
/// isn't cached share a single fetch from the store.
///
/// Under write-back, written tiles are held dirty until `evict`, `flush` or `close_array` stores
/// them. A dirty tile is only ever dropped from the cache once the store has accepted it, so a
/// store that keeps failing lets the cache grow, up to `CacheConfig::hard_limit`. Past that,
/// `put` fails with `Error::CacheFull`.
///
pub struct TileCache {
    store: Arc<dyn ArrayStore>,
    tiles: Cache<TileKey, SingleAttributeChunk>,
    config: CacheConfig,

    /// Schemas of arrays with cached tiles, needed to write dirty tiles back
    arrays: Mutex<HashMap<Arc<str>, Arc<Array>>>,

    /// Tiles the store has no data for, when negative caching is on
    absent: Mutex<Absent>,

    /// Held while writing dirty tiles, so two flushes don't store the same tile twice
    flushing: AsyncMutex<()>,
}

impl TileCache {
    pub fn new(store: Arc<dyn ArrayStore>, config: CacheConfig) -> Self {
        Self {
            store,
            tiles: Cache::new(config.capacity, config.hard_limit),
            config,
            arrays: Mutex::new(HashMap::new()),
            absent: Mutex::new(Absent::new(config.max_not_found)),
            flushing: AsyncMutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get one attribute of one tile.
    ///
    /// Fetches from the store on a miss. Fails with `Error::NotFound` if the store has no data
    /// for the tile.
    ///
    pub async fn get(
        &self,
        array: &Arc<Array>,
        tile: &ArrayTile,
        attribute: &str,
    ) -> Result<Arc<SingleAttributeChunk>> {
        let attribute = array.attribute(attribute)?.clone();
        array.validate_tile(tile)?;
        let key = self.key(array, tile, &attribute.name);

        if self.config.cache_not_found
            && self.tiles.peek(&key).is_none()
            && self.absent.lock().contains(&key)
        {
            return Err(no_data(&key));
        }

        let store = Arc::clone(&self.store);
        let array = Arc::clone(array);
        let load = move |key: TileKey| {
            async move {
                let layout = store.wire_layout(&attribute);
                let data = store.fetch_tile(&array, &key.tile, &key.attribute).await?;
                debug!(%key, bytes = data.len(), "fetched tile");

                SingleAttributeChunk::decode(key.tile, attribute, layout, &data)
            }
            .boxed()
        };

        let result = self.tiles.get(&key, load).await;
        if let Err(err) = &result {
            if err.is_not_found() {
                debug!(%key, "no data");
                if self.config.cache_not_found {
                    self.absent.lock().insert(key);
                }
            }
        }

        result
    }

    /// Write one attribute of one tile.
    ///
    /// Under write-through the tile is stored first and only cached once the store accepts it.
    /// Under write-back it is cached dirty and stored later. In that case a store failure while
    /// making room is logged and retried on the next `evict` or `flush`, not returned here.
    ///
    pub async fn put(&self, array: &Arc<Array>, chunk: SingleAttributeChunk) -> Result<()> {
        let attribute = array.attribute(&chunk.attribute().name)?;
        if attribute != chunk.attribute() {
            return Err(Error::Schema(format!(
                "chunk attribute {} doesn't match array {}",
                chunk.attribute().format(),
                array.name()
            )));
        }
        array.validate_tile(chunk.tile())?;

        let key = self.key(array, chunk.tile(), &attribute.name);
        self.absent.lock().retain(|absent| absent != &key);
        let chunk = Arc::new(chunk);

        match self.config.policy {
            WritePolicy::WriteThrough => {
                self.write(&key, &chunk).await?;
                self.tiles.insert(key, chunk, false)?;
            }
            WritePolicy::WriteBack => {
                match self.tiles.insert(key.clone(), Arc::clone(&chunk), true) {
                    Ok(_) => {}
                    Err(Error::CacheFull { .. }) => {
                        // Make room by writing out what we can, then try once more
                        if let Err(err) = self.flush().await {
                            warn!(%key, %err, "cache is full and flushing failed");
                        }
                        self.tiles.insert(key, chunk, true)?;
                    }
                    Err(err) => return Err(err),
                }

                if let Err(err) = self.evict().await {
                    debug!(%err, "eviction left dirty tiles in place");
                }
            }
        }

        Ok(())
    }

    /// Bring the cache back within capacity.
    ///
    /// Dirty tiles in the way are stored first. Tiles that fail to store stay cached and dirty,
    /// and the first failure is returned.
    ///
    pub async fn evict(&self) -> Result<()> {
        let _flushing = self.flushing.lock().await;
        let result = self.write_out(self.tiles.dirty_over_limit()).await;
        let evicted = self.tiles.evict();
        if evicted > 0 {
            debug!(evicted, "evicted tiles");
        }

        result
    }

    /// Store every dirty tile.
    pub async fn flush(&self) -> Result<()> {
        let _flushing = self.flushing.lock().await;
        let result = self.write_out(self.tiles.dirty_where(|_| true)).await;
        self.tiles.evict();

        result
    }

    /// Store every dirty tile of one array.
    pub async fn flush_array(&self, name: &str) -> Result<()> {
        let _flushing = self.flushing.lock().await;
        self.write_out(self.tiles.dirty_where(|key| &*key.array == name))
            .await
    }

    /// Store every dirty tile of an array, then drop its tiles from the cache.
    ///
    /// Tiles that fail to store stay cached, and the failure is returned.
    ///
    pub async fn close_array(&self, name: &str) -> Result<()> {
        let result = self.flush_array(name).await;
        let removed = self.tiles.remove_where(|key| &*key.array == name, false);
        self.absent.lock().retain(|key| &*key.array != name);
        if self.tiles.dirty_where(|key| &*key.array == name).is_empty() {
            self.arrays.lock().remove(name);
        }
        debug!(array = name, removed, "closed array");

        result
    }

    /// Drop every tile of an array, unstored writes included.
    ///
    pub fn discard_array(&self, name: &str) {
        let removed = self.tiles.remove_where(|key| &*key.array == name, true);
        self.absent.lock().retain(|key| &*key.array != name);
        self.arrays.lock().remove(name);
        debug!(array = name, removed, "discarded array");
    }

    /// Forget one tile, so the next `get` fetches it again. Dirty tiles are kept.
    ///
    pub fn invalidate(&self, array: &str, tile: &ArrayTile, attribute: &str) -> bool {
        let key = TileKey {
            array: array.into(),
            tile: tile.clone(),
            attribute: attribute.into(),
        };
        let forgotten = {
            let mut absent = self.absent.lock();
            let before = absent.len();
            absent.retain(|absent| absent != &key);
            absent.len() < before
        };

        self.tiles.remove_where(|candidate| candidate == &key, false) > 0 || forgotten
    }

    /// Forget every clean tile.
    pub fn clear(&self) {
        self.tiles.remove_where(|_| true, false);
        self.absent.lock().retain(|_| false);
    }

    pub fn stats(&self) -> CacheStats {
        self.tiles.stats()
    }

    /// Number of tiles remembered as holding no data
    pub fn not_found_count(&self) -> usize {
        self.absent.lock().len()
    }

    /// Key for a tile, registering the array's schema for later write back.
    fn key(&self, array: &Arc<Array>, tile: &ArrayTile, attribute: &str) -> TileKey {
        let mut arrays = self.arrays.lock();
        let name = match arrays.get_key_value(array.name()) {
            Some((name, _)) => Arc::clone(name),
            None => Arc::from(array.name()),
        };
        arrays.insert(Arc::clone(&name), Arc::clone(array));

        TileKey {
            array: name,
            tile: tile.clone(),
            attribute: attribute.into(),
        }
    }

    async fn write(&self, key: &TileKey, chunk: &SingleAttributeChunk) -> Result<()> {
        let array = self
            .arrays
            .lock()
            .get(&key.array)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("array {} is not open", key.array)))?;
        let layout = self.store.wire_layout(chunk.attribute());
        let data = Bytes::from(chunk.encode(layout));

        self.store
            .store_tile(&array, &key.tile, &key.attribute, data)
            .await
    }

    async fn write_out(&self, dirty: Vec<DirtyTile>) -> Result<()> {
        let mut failure = None;
        for (key, chunk, version) in dirty {
            match self.write(&key, &chunk).await {
                Ok(()) => {
                    self.tiles.mark_clean(&key, version);
                    debug!(%key, "stored tile");
                }
                Err(err) => {
                    warn!(%key, %err, "failed to store tile, keeping it dirty");
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn no_data(key: &TileKey) -> Error {
    Error::NotFound(format!("no data for {key}"))
}
