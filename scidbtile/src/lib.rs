mod array;
mod cache;
mod chunk;
mod config;
mod datastore;
mod errors;
mod geom;
mod reference;
mod store;
mod tile;
mod tilecache;
mod time;

#[cfg(test)]
mod testing;

pub use array::Array;
pub use array::ArrayKind;
pub use array::Attribute;
pub use array::AttributeStats;
pub use array::Dimension;
pub use array::ScalarType;

pub use cache::Cache;
pub use cache::CacheStats;
pub use cache::Cacheable;

pub use chunk::encode_cells;
pub use chunk::ChunkData;
pub use chunk::SingleAttributeChunk;
pub use chunk::WireLayout;

pub use config::CacheConfig;
pub use config::ConnectionKey;
pub use config::ConnectionParameters;
pub use config::CreationParameters;
pub use config::CreationType;
pub use config::PropertyKey;
pub use config::QueryParameters;
pub use config::WritePolicy;

pub use datastore::Datastore;

pub use errors::Error;
pub use errors::Result;

pub use geom::AffineTransform;

pub use reference::parse_authority;
pub use reference::SpatialReference;
pub use reference::TemporalReference;
pub use reference::{DEFAULT_T_DIMENSION, DEFAULT_X_DIMENSION, DEFAULT_Y_DIMENSION};

pub use store::ArrayStore;

pub use tile::ArrayTile;
pub use tile::DimRange;
pub use tile::TileGrid;
pub use tile::TileIter;
pub use tile::TileSpan;

pub use tilecache::TileCache;
pub use tilecache::TileKey;

pub use time::TDuration;
pub use time::TInterval;
pub use time::TPoint;
pub use time::TReference;
pub use time::TResolution;
