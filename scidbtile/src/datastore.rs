use std::{collections::HashMap, sync::Arc};

use futures::{stream, StreamExt, TryStreamExt};
use ndarray::{indices, ArrayD, Dimension as _, IxDyn};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    array::{Array, AttributeStats},
    cache::CacheStats,
    chunk::SingleAttributeChunk,
    config::{CacheConfig, CreationParameters, QueryParameters},
    errors::{Error, Result},
    store::ArrayStore,
    tile::{cell_count, ArrayTile, DimRange, TileGrid, TileSpan},
    tilecache::TileCache,
};

/// Tiles fetched at once by `read_window`
const READ_AHEAD: usize = 8;

/// Entry point for applications: opens, creates and drops remote arrays and reads and writes
/// their tiles through a shared tile cache.
///
pub struct Datastore {
    store: Arc<dyn ArrayStore>,
    tiles: TileCache,

    /// Attribute statistics by array and attribute name, dropped whenever the array is written
    stats: Mutex<HashMap<(String, String), AttributeStats>>,
}

impl Datastore {
    pub fn new(store: Arc<dyn ArrayStore>, config: CacheConfig) -> Self {
        Self {
            tiles: TileCache::new(Arc::clone(&store), config),
            store,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &TileCache {
        &self.tiles
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.tiles.stats()
    }

    pub async fn list_arrays(&self) -> Result<Vec<String>> {
        self.store.list_arrays().await
    }

    /// Load an existing array. Fails with `Error::NotFound` if there is no such array.
    pub async fn open_array(&self, name: &str) -> Result<Arc<Array>> {
        let array = self.store.describe_array(name).await?;
        debug!(array = name, kind = ?array.kind(), "opened array");

        Ok(Arc::new(array))
    }

    pub async fn create_array(&self, array: Array) -> Result<Arc<Array>> {
        self.store.create_array(&array).await?;
        info!(array = array.name(), schema = %array.schema_string(), "created array");

        Ok(Arc::new(array))
    }

    /// Create an array from a plain schema, georeferenced as `parameters` describe.
    pub async fn create_array_with(
        &self,
        schema: Array,
        parameters: &CreationParameters,
    ) -> Result<Arc<Array>> {
        self.create_array(parameters.apply(schema)?).await
    }

    /// Remove an array from the store. Its cached tiles go with it, unstored writes included.
    pub async fn drop_array(&self, name: &str) -> Result<()> {
        self.store.drop_array(name).await?;
        self.tiles.discard_array(name);
        self.forget_stats(name);
        info!(array = name, "dropped array");

        Ok(())
    }

    pub async fn read_tile(
        &self,
        array: &Arc<Array>,
        tile: &ArrayTile,
        attribute: &str,
    ) -> Result<Arc<SingleAttributeChunk>> {
        self.tiles.get(array, tile, attribute).await
    }

    /// Read an arbitrary index window of one attribute as `f64`.
    ///
    /// `request` holds one inclusive range per dimension. Null cells, and cells of tiles the
    /// store has no data for, read as NaN. Windows of more than `max_window_cells` cells are
    /// refused with `Error::Schema`.
    ///
    pub async fn read_window(
        &self,
        array: &Arc<Array>,
        request: &[DimRange],
        attribute: &str,
    ) -> Result<ArrayD<f64>> {
        array.attribute(attribute)?;
        let grid = TileGrid::new(array, request)?;
        let limit = self.tiles.config().max_window_cells;
        if !cell_count(request).map_or(false, |cells| cells <= limit) {
            let ranges: Vec<String> = request.iter().map(DimRange::to_string).collect();
            return Err(Error::Schema(format!(
                "window [{}] of array {} holds more than {limit} cells",
                ranges.join(","),
                array.name()
            )));
        }
        let shape: Vec<usize> = request.iter().map(DimRange::length).collect();
        let mut window = ArrayD::from_elem(IxDyn(&shape), f64::NAN);

        let mut tiles = stream::iter(grid.iter())
            .map(|span| async move {
                match self.tiles.get(array, &span.tile, attribute).await {
                    Ok(chunk) => Ok((span, Some(chunk))),
                    Err(err) if err.is_not_found() => Ok((span, None)),
                    Err(err) => Err(err),
                }
            })
            .buffered(READ_AHEAD);

        while let Some((span, chunk)) = tiles.try_next().await? {
            if let Some(chunk) = chunk {
                copy_span(&mut window, request, &span, &chunk);
            }
        }

        Ok(window)
    }

    /// Read the attributes selected by `query`, one window per attribute in selection order.
    pub async fn query(&self, query: &QueryParameters) -> Result<Vec<(String, ArrayD<f64>)>> {
        let array = self.open_array(&query.array).await?;
        let request = query.request(&array)?;

        let mut windows = vec![];
        for attribute in query.attributes(&array)? {
            let window = self.read_window(&array, &request, &attribute.name).await?;
            windows.push((attribute.name.clone(), window));
        }

        Ok(windows)
    }

    pub async fn write_tile(&self, array: &Arc<Array>, chunk: SingleAttributeChunk) -> Result<()> {
        self.forget_stats(array.name());
        self.tiles.put(array, chunk).await
    }

    /// Write out pending tiles of an array and release its cached tiles.
    pub async fn close_array(&self, array: &Array) -> Result<()> {
        self.forget_stats(array.name());
        self.tiles.close_array(array.name()).await
    }

    /// Min, max, mean and standard deviation of an attribute over the whole array.
    ///
    /// Pending writes to the array are stored first, so they are counted.
    ///
    pub async fn attribute_stats(&self, array: &Array, attribute: &str) -> Result<AttributeStats> {
        array.attribute(attribute)?;
        let key = (array.name().to_string(), attribute.to_string());
        if let Some(stats) = self.stats.lock().get(&key) {
            return Ok(*stats);
        }

        self.tiles.flush_array(array.name()).await?;
        let stats = self.store.attribute_stats(array, attribute).await?;
        self.stats.lock().insert(key, stats);

        Ok(stats)
    }

    /// Store every pending write.
    pub async fn flush(&self) -> Result<()> {
        self.tiles.flush().await
    }

    fn forget_stats(&self, name: &str) {
        self.stats.lock().retain(|(array, _), _| array != name);
    }
}

/// Copy the part of `chunk` that falls in `span.window` into `window`, which covers `request`.
fn copy_span(
    window: &mut ArrayD<f64>,
    request: &[DimRange],
    span: &TileSpan,
    chunk: &SingleAttributeChunk,
) {
    let ranges = span.tile.ranges();
    let shape: Vec<usize> = span.window.iter().map(DimRange::length).collect();
    let mut source = vec![0; shape.len()];
    let mut target = vec![0; shape.len()];
    for offset in indices(IxDyn(&shape)) {
        for (d, &i) in offset.slice().iter().enumerate() {
            let index = span.window[d].low + i as i64;
            source[d] = (index - ranges[d].low) as usize;
            target[d] = (index - request[d].low) as usize;
        }
        if let Some(value) = chunk.get_f64(&source) {
            window[IxDyn(&target)] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::{
        array::{Attribute, Dimension, ScalarType},
        chunk::{ChunkData, WireLayout},
        errors::Error,
        testing::{ndvi, small, MemoryStore},
    };

    fn datastore(store: &Arc<MemoryStore>) -> Datastore {
        Datastore::new(
            Arc::clone(store) as Arc<dyn ArrayStore>,
            CacheConfig::default(),
        )
    }

    fn quality(array: &Array, tile: &ArrayTile, value: f64) -> SingleAttributeChunk {
        let shape = tile.shape();
        let data = ArrayD::from_elem(IxDyn(&shape), value);
        let mut nulls = ArrayD::from_elem(IxDyn(&shape), false);
        nulls[IxDyn(&[0, 0])] = true;
        let attribute = array.attribute("quality").unwrap().clone();

        SingleAttributeChunk::new(tile.clone(), attribute, ChunkData::from(data), Some(nulls))
            .unwrap()
    }

    #[tokio::test]
    async fn test_array_lifecycle() -> Result<()> {
        let store = Arc::new(MemoryStore::new().with_array(ndvi()));
        let datastore = datastore(&store);

        assert!(matches!(
            datastore.open_array("small").await,
            Err(Error::NotFound(_))
        ));
        let created = datastore.create_array(small()).await?;
        assert!(datastore.create_array(small()).await.is_err());
        assert_eq!(datastore.list_arrays().await?, vec!["ndvi", "small"]);

        let opened = datastore.open_array("small").await?;
        assert_eq!(opened, created);
        assert!(opened.spatial_reference().is_err());
        assert!(datastore.open_array("ndvi").await?.is_temporal());

        let tile = ArrayTile::containing(&opened, &[0, 0])?;
        datastore.write_tile(&opened, quality(&opened, &tile, 2.5)).await?;
        datastore.drop_array("small").await?;
        assert_eq!(datastore.cache_stats().entries, 0);
        datastore.flush().await?;
        assert_eq!(store.store_count(), 0);
        assert_eq!(datastore.list_arrays().await?, vec!["ndvi"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_write_close_reopen() -> Result<()> {
        let store = Arc::new(MemoryStore::new().with_array(small()));
        let datastore = datastore(&store);
        let array = datastore.open_array("small").await?;
        let tile = ArrayTile::containing(&array, &[5, 2])?;

        datastore.write_tile(&array, quality(&array, &tile, 1.5)).await?;
        assert_eq!(store.store_count(), 0);
        datastore.close_array(&array).await?;
        assert_eq!(store.store_count(), 1);
        assert_eq!(datastore.cache_stats().entries, 0);

        let array = datastore.open_array("small").await?;
        let chunk = datastore.read_tile(&array, &tile, "quality").await?;
        assert_eq!(store.total_fetches(), 1);
        assert_eq!(chunk.get_f64(&[0, 0]), None);
        assert_eq!(chunk.get_f64(&[3, 3]), Some(1.5));

        Ok(())
    }

    #[tokio::test]
    async fn test_attribute_stats() -> Result<()> {
        let store = Arc::new(MemoryStore::new().with_array(small()));
        let datastore = datastore(&store);
        let array = datastore.open_array("small").await?;
        let tiles: Vec<ArrayTile> = TileGrid::full(&array)?.iter().map(|span| span.tile).collect();

        datastore.write_tile(&array, quality(&array, &tiles[0], 1.0)).await?;
        datastore.write_tile(&array, quality(&array, &tiles[1], 3.0)).await?;
        let stats = datastore.attribute_stats(&array, "quality").await?;
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.stddev, 1.0);
        assert_eq!(store.store_count(), 2);

        // Cached until the array is written again
        assert_eq!(datastore.attribute_stats(&array, "quality").await?, stats);
        datastore.write_tile(&array, quality(&array, &tiles[2], 8.0)).await?;
        let stats = datastore.attribute_stats(&array, "quality").await?;
        assert_eq!(stats.max, 8.0);
        assert_eq!(stats.mean, 4.0);

        assert!(matches!(
            datastore.attribute_stats(&array, "ndvi").await,
            Err(Error::UnknownAttribute { .. })
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_read_window() -> Result<()> {
        let store = Arc::new(MemoryStore::new().with_array(small()));
        let datastore = datastore(&store);
        let array = datastore.open_array("small").await?;

        // Only the upper left tile has data
        let tile = ArrayTile::containing(&array, &[0, 0])?;
        let data = ArrayD::from_shape_fn(IxDyn(&[4, 4]), |index| (index[0] * 10 + index[1]) as i16);
        let attribute = array.attribute("elevation")?.clone();
        let chunk = SingleAttributeChunk::new(tile.clone(), attribute, ChunkData::from(data), None)?;
        store.insert_tile("small", &tile, "elevation", Bytes::from(chunk.encode(WireLayout::Dense)));

        let request = vec![DimRange::new(2, 5), DimRange::new(1, 3)];
        let window = datastore.read_window(&array, &request, "elevation").await?;
        assert_eq!(window.shape(), &[4, 3]);
        assert_eq!(window[IxDyn(&[0, 0])], 21.0);
        assert_eq!(window[IxDyn(&[1, 2])], 33.0);
        assert!(window[IxDyn(&[2, 0])].is_nan());
        assert_eq!(store.total_fetches(), 2);

        let mut query = QueryParameters::new("small");
        query.bounds.push((String::from("row"), DimRange::at(3)));
        query.attributes.push(String::from("elevation"));
        let windows = datastore.query(&query).await?;
        assert_eq!(windows.len(), 1);
        let (name, row) = &windows[0];
        assert_eq!(name, "elevation");
        assert_eq!(row.shape(), &[1, 8]);
        assert_eq!(row[IxDyn(&[0, 2])], 32.0);
        assert!(row[IxDyn(&[0, 4])].is_nan());

        // No selection reads every attribute
        query.attributes.clear();
        let windows = datastore.query(&query).await?;
        let names: Vec<&str> = windows.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["elevation", "quality"]);
        assert!(windows[1].1.iter().all(|v| v.is_nan()));

        query.attributes = vec![String::from("nope")];
        assert!(matches!(
            datastore.query(&query).await,
            Err(Error::UnknownAttribute { .. })
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_window_is_refused() -> Result<()> {
        let array = Array::new(
            "wide",
            vec![Dimension::new("i", 0, 4611686018427387902, 1000)?],
            vec![Attribute::new("v", ScalarType::Float, true)],
        )?;
        let store = Arc::new(MemoryStore::new().with_array(array));
        let datastore = datastore(&store);

        assert!(matches!(
            datastore.query(&QueryParameters::new("wide")).await,
            Err(Error::Schema(_))
        ));

        // Within the configured limit, the same array reads fine
        let mut query = QueryParameters::new("wide");
        query.bounds.push((String::from("i"), DimRange::new(10, 1009)));
        let windows = datastore.query(&query).await?;
        assert_eq!(windows[0].1.shape(), &[1000]);
        assert_eq!(store.total_fetches(), 2);

        let small_limit = Datastore::new(
            Arc::clone(&store) as Arc<dyn ArrayStore>,
            CacheConfig {
                max_window_cells: 100,
                ..CacheConfig::default()
            },
        );
        assert!(matches!(
            small_limit.query(&query).await,
            Err(Error::Schema(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_create_array_with_parameters() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let datastore = datastore(&store);
        let schema = Array::new(
            "monthly",
            vec![
                Dimension::new("x", 0, 99, 50)?,
                Dimension::new("y", 0, 49, 50)?,
                Dimension::new("t", 0, 11, 1)?,
            ],
            vec![Attribute::new("ndvi", ScalarType::Float, true)],
        )?;
        let mut parameters = CreationParameters::default();
        parameters.assign("type".parse()?, "STS")?;
        parameters.assign("timestamp".parse()?, "2020-01-01")?;
        parameters.assign("dt".parse()?, "P1M")?;
        parameters.assign("srs".parse()?, "EPSG:4326")?;
        parameters.assign("bbox".parse()?, "0 0 10 5")?;

        let created = datastore.create_array_with(schema, &parameters).await?;
        assert!(created.is_spatial());
        assert!(created.is_temporal());
        let srs = created.spatial_reference()?;
        assert_eq!(srs.authority(), Some(String::from("EPSG:4326")));
        assert_eq!(srs.to_geo(10.0, 10.0), (1.0, 4.0));

        // The store holds the georeferenced array
        let opened = datastore.open_array("monthly").await?;
        assert_eq!(opened, created);
        assert_eq!(opened.temporal_reference()?.point_at(2)?, "2020-03-01".parse()?);

        Ok(())
    }

    #[tokio::test]
    async fn test_read_window_forwards_failures() -> Result<()> {
        let array = Array::new(
            "line",
            vec![Dimension::new("i", 0, 99, 10)?],
            vec![Attribute::new("v", ScalarType::UInt8, false)],
        )?;
        let store = Arc::new(MemoryStore::new().with_array(array));
        let datastore = datastore(&store);
        let array = datastore.open_array("line").await?;

        store.fail_fetches(Some(Error::Transport(String::from("broken pipe"))));
        let result = datastore
            .read_window(&array, &[DimRange::new(5, 25)], "v")
            .await;
        assert_eq!(result, Err(Error::Transport(String::from("broken pipe"))));

        Ok(())
    }
}
