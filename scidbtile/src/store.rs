use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    array::{Array, Attribute, AttributeStats},
    chunk::WireLayout,
    errors::Result,
    tile::ArrayTile,
};

/// A trait for reading and writing arrays held by a remote array database.
///
/// This is the seam the tile cache calls through on a miss or a flush. Implementations own their
/// sessions and are responsible for serializing calls on any one session.
///
#[async_trait]
pub trait ArrayStore: Send + Sync {
    /// Names of all arrays in the store
    async fn list_arrays(&self) -> Result<Vec<String>>;

    /// Load an array's schema and references.
    ///
    /// Should return `Error::NotFound` if no array has this name.
    ///
    async fn describe_array(&self, name: &str) -> Result<Array>;

    /// Create an array. On failure, no part of the array is left behind, as far as the store
    /// allows.
    async fn create_array(&self, array: &Array) -> Result<()>;

    async fn drop_array(&self, name: &str) -> Result<()>;

    /// Fetch the raw bytes of one attribute over one tile, encoded per `wire_layout`.
    ///
    /// Should return `Error::NotFound`, or an empty payload, if the tile holds no data.
    ///
    async fn fetch_tile(&self, array: &Array, tile: &ArrayTile, attribute: &str)
        -> Result<Bytes>;

    /// Write the raw bytes of one attribute over one tile, encoded per `wire_layout`.
    async fn store_tile(
        &self,
        array: &Array,
        tile: &ArrayTile,
        attribute: &str,
        data: Bytes,
    ) -> Result<()>;

    async fn attribute_stats(&self, array: &Array, attribute: &str) -> Result<AttributeStats>;

    /// Binary layout this store speaks for `attribute`
    fn wire_layout(&self, attribute: &Attribute) -> WireLayout {
        WireLayout::for_attribute(attribute)
    }
}
