use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use ndarray::{indices, Dimension as _, IxDyn};
use parking_lot::Mutex;

use crate::{
    array::{Array, ArrayKind, Attribute, AttributeStats, Dimension, ScalarType},
    chunk::SingleAttributeChunk,
    errors::{Error, Result},
    reference::{SpatialReference, TemporalReference},
    store::ArrayStore,
    tile::ArrayTile,
    time::TReference,
};

type TileAddress = (String, ArrayTile, String);

/// A test implementation of ArrayStore that keeps arrays and tiles in RAM
///
/// Counts calls, and can be told to stall or fail them.
///
#[derive(Default)]
pub(crate) struct MemoryStore {
    arrays: Mutex<HashMap<String, Array>>,
    tiles: Mutex<HashMap<TileAddress, Bytes>>,
    fetches: Mutex<HashMap<TileAddress, usize>>,
    stores: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
    fetch_failure: Mutex<Option<Error>>,
    store_failure: Mutex<Option<Error>>,
    cancelled: Arc<AtomicUsize>,
}

fn address(array: &str, tile: &ArrayTile, attribute: &str) -> TileAddress {
    (array.to_string(), tile.clone(), attribute.to_string())
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_array(self, array: Array) -> Self {
        self.arrays.lock().insert(array.name().to_string(), array);
        self
    }

    /// Put raw wire bytes straight into the store
    pub(crate) fn insert_tile(&self, array: &str, tile: &ArrayTile, attribute: &str, data: Bytes) {
        self.tiles.lock().insert(address(array, tile, attribute), data);
    }

    pub(crate) fn stored(&self, array: &str, tile: &ArrayTile, attribute: &str) -> Option<Bytes> {
        self.tiles.lock().get(&address(array, tile, attribute)).cloned()
    }

    pub(crate) fn fetch_count(&self, array: &str, tile: &ArrayTile, attribute: &str) -> usize {
        self.fetches
            .lock()
            .get(&address(array, tile, attribute))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }

    pub(crate) fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// Fetches dropped before they finished
    pub(crate) fn cancelled_fetches(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn delay_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    pub(crate) fn fail_fetches(&self, failure: Option<Error>) {
        *self.fetch_failure.lock() = failure;
    }

    pub(crate) fn fail_stores(&self, failure: Option<Error>) {
        *self.store_failure.lock() = failure;
    }

    fn array(&self, name: &str) -> Result<Array> {
        self.arrays
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("array {name} does not exist")))
    }
}

/// Counts a fetch as cancelled if it is dropped before finishing
struct FetchGuard {
    finished: bool,
    cancelled: Arc<AtomicUsize>,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ArrayStore for MemoryStore {
    async fn list_arrays(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.arrays.lock().keys().cloned().collect();
        names.sort();

        Ok(names)
    }

    async fn describe_array(&self, name: &str) -> Result<Array> {
        self.array(name)
    }

    async fn create_array(&self, array: &Array) -> Result<()> {
        let mut arrays = self.arrays.lock();
        if arrays.contains_key(array.name()) {
            return Err(Error::query(
                format!("array {} already exists", array.name()),
                format!("create array {}", array.name()),
            ));
        }
        arrays.insert(array.name().to_string(), array.clone());

        Ok(())
    }

    async fn drop_array(&self, name: &str) -> Result<()> {
        self.arrays
            .lock()
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("array {name} does not exist")))?;
        self.tiles.lock().retain(|(array, _, _), _| array != name);

        Ok(())
    }

    async fn fetch_tile(
        &self,
        array: &Array,
        tile: &ArrayTile,
        attribute: &str,
    ) -> Result<Bytes> {
        let key = address(array.name(), tile, attribute);
        *self.fetches.lock().entry(key.clone()).or_insert(0) += 1;

        let mut guard = FetchGuard {
            finished: false,
            cancelled: Arc::clone(&self.cancelled),
        };
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard.finished = true;

        let failure = self.fetch_failure.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        self.array(array.name())?;

        self.tiles
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no data in tile {tile}")))
    }

    async fn store_tile(
        &self,
        array: &Array,
        tile: &ArrayTile,
        attribute: &str,
        data: Bytes,
    ) -> Result<()> {
        let failure = self.store_failure.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        self.array(array.name())?;
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.insert_tile(array.name(), tile, attribute, data);

        Ok(())
    }

    async fn attribute_stats(&self, array: &Array, attribute: &str) -> Result<AttributeStats> {
        let attribute = array.attribute(attribute)?.clone();
        let layout = self.wire_layout(&attribute);
        let tiles: Vec<(ArrayTile, Bytes)> = self
            .tiles
            .lock()
            .iter()
            .filter(|((name, _, attr), _)| name == array.name() && *attr == attribute.name)
            .map(|((_, tile, _), data)| (tile.clone(), data.clone()))
            .collect();

        let mut values = vec![];
        for (tile, data) in tiles {
            let shape = tile.shape();
            let chunk = SingleAttributeChunk::decode(tile, attribute.clone(), layout, &data)?;
            for index in indices(IxDyn(&shape)) {
                if let Some(value) = chunk.get_f64(index.slice()) {
                    values.push(value);
                }
            }
        }
        if values.is_empty() {
            return Err(Error::NotFound(format!("no values for {}", attribute.name)));
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Ok(AttributeStats {
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean,
            stddev: variance.sqrt(),
        })
    }
}

/// The spatio-temporal array used throughout the tests: 1000 x 1000 cells chunked by 256, twelve
/// monthly time slices, one nullable float attribute.
pub(crate) fn ndvi() -> Array {
    let array = Array::new(
        "ndvi",
        vec![
            Dimension::new("x", 0, 999, 256).expect("bad dimension"),
            Dimension::new("y", 0, 999, 256).expect("bad dimension"),
            Dimension::new("t", 0, 11, 1).expect("bad dimension"),
        ],
        vec![Attribute::new("ndvi", ScalarType::Float, true)],
    )
    .expect("bad array");
    let trs = TReference::new(
        "2020-01-01".parse().expect("bad timestamp"),
        "P1M".parse().expect("bad duration"),
    )
    .expect("bad reference");

    let array = array
        .with_spatial(SpatialReference::new("x", "y", Default::default()))
        .and_then(|array| array.with_temporal(TemporalReference::new("t", trs)))
        .expect("bad references");
    assert_eq!(array.kind(), ArrayKind::SpatioTemporal);

    array
}

/// A small plain array: 8 x 8 cells in 4 x 4 tiles, a non-nullable int16 and a nullable double.
pub(crate) fn small() -> Array {
    Array::new(
        "small",
        vec![
            Dimension::new("row", 0, 7, 4).expect("bad dimension"),
            Dimension::new("col", 0, 7, 4).expect("bad dimension"),
        ],
        vec![
            Attribute::new("elevation", ScalarType::Int16, false),
            Attribute::new("quality", ScalarType::Double, true),
        ],
    )
    .expect("bad array")
}
