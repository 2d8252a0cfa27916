use ndarray::{ArrayD, IxDyn};
use num_traits::ToPrimitive;
use paste::paste;

use crate::array::{Attribute, ScalarType};
use crate::cache::Cacheable;
use crate::errors::{Error, Result};
use crate::tile::ArrayTile;

/// Missing-reason byte marking a present (non-null) value in the binary wire format.
const PRESENT: u8 = 0xFF;

/// Layout of one attribute's cells in a binary tile payload.
///
/// Values are little-endian and row-major in dimension order. When the attribute is requested
/// as nullable, every cell is prefixed by one missing-reason byte: `0xFF` for a present value,
/// anything else for null. Null cells still carry value bytes.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireLayout {
    Dense,
    NullPrefixed,
}

impl WireLayout {
    pub fn for_attribute(attribute: &Attribute) -> Self {
        if attribute.nullable {
            Self::NullPrefixed
        } else {
            Self::Dense
        }
    }

    fn prefix(&self) -> usize {
        match self {
            Self::Dense => 0,
            Self::NullPrefixed => 1,
        }
    }

    /// Bytes per cell for values of `scalar_type`
    pub fn stride(&self, scalar_type: ScalarType) -> usize {
        self.prefix() + scalar_type.width()
    }
}

/// A scalar that can be read from and written to the binary wire format.
trait WireValue: Copy + Default {
    fn read(bytes: &[u8]) -> Self;
    fn write(&self, out: &mut Vec<u8>);
    fn as_f64(&self) -> f64;
}

macro_rules! wire_value {
    ($($t:ty),*) => {
        $(
            impl WireValue for $t {
                fn read(bytes: &[u8]) -> Self {
                    let mut buffer = [0; std::mem::size_of::<$t>()];
                    buffer.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                    <$t>::from_le_bytes(buffer)
                }

                fn write(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn as_f64(&self) -> f64 {
                    self.to_f64().unwrap_or(f64::NAN)
                }
            }
        )*
    };
}

wire_value!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl WireValue for bool {
    fn read(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn as_f64(&self) -> f64 {
        if *self {
            1.0
        } else {
            0.0
        }
    }
}

macro_rules! chunk_data {
    ($($variant:ident($t:ty)),*) => {
        /// Dense typed values of one attribute over one tile.
        #[derive(Clone, Debug, PartialEq)]
        pub enum ChunkData {
            $($variant(ArrayD<$t>)),*
        }

        impl ChunkData {
            pub fn scalar_type(&self) -> ScalarType {
                match self {
                    $(Self::$variant(_) => ScalarType::$variant),*
                }
            }

            pub fn shape(&self) -> &[usize] {
                match self {
                    $(Self::$variant(values) => values.shape()),*
                }
            }

            /// Zero-filled values of `scalar_type`
            pub fn zeros(scalar_type: ScalarType, shape: &[usize]) -> Self {
                match scalar_type {
                    $(ScalarType::$variant => Self::$variant(ArrayD::default(IxDyn(shape)))),*
                }
            }

            /// Value at `index` widened to `f64`
            pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
                match self {
                    $(Self::$variant(values) => values.get(IxDyn(index)).map(WireValue::as_f64)),*
                }
            }

            paste! {
                $(
                    pub fn [<as_ $variant:lower>](&self) -> Option<&ArrayD<$t>> {
                        match self {
                            Self::$variant(values) => Some(values),
                            #[allow(unreachable_patterns)]
                            _ => None,
                        }
                    }
                )*
            }

            fn decode(
                scalar_type: ScalarType,
                shape: &[usize],
                cells: std::slice::ChunksExact<'_, u8>,
                offset: usize,
            ) -> Result<Self> {
                match scalar_type {
                    $(
                        ScalarType::$variant => {
                            let values: Vec<$t> =
                                cells.map(|cell| <$t>::read(&cell[offset..])).collect();
                            let values = ArrayD::from_shape_vec(IxDyn(shape), values)
                                .map_err(|err| Error::Decode(err.to_string()))?;

                            Ok(Self::$variant(values))
                        }
                    )*
                }
            }

            fn encode(&self, nulls: Option<&ArrayD<bool>>, layout: WireLayout, out: &mut Vec<u8>) {
                match self {
                    $(
                        Self::$variant(values) => {
                            let mut nulls = nulls.map(|nulls| nulls.iter());
                            for value in values.iter() {
                                if layout == WireLayout::NullPrefixed {
                                    let null = nulls
                                        .as_mut()
                                        .and_then(|nulls| nulls.next())
                                        .copied()
                                        .unwrap_or(false);
                                    out.push(if null { 0 } else { PRESENT });
                                }
                                value.write(out);
                            }
                        }
                    )*
                }
            }
        }

        $(
            impl From<ArrayD<$t>> for ChunkData {
                fn from(values: ArrayD<$t>) -> Self {
                    Self::$variant(values)
                }
            }
        )*
    };
}

chunk_data!(
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Bool(bool)
);

/// The decoded contents of one tile for one attribute: a dense, row-major buffer of typed values
/// and, for nullable attributes, a mask that is `true` where a cell is null.
///
#[derive(Clone, Debug, PartialEq)]
pub struct SingleAttributeChunk {
    tile: ArrayTile,
    attribute: Attribute,
    data: ChunkData,
    nulls: Option<ArrayD<bool>>,
}

impl SingleAttributeChunk {
    pub fn new(
        tile: ArrayTile,
        attribute: Attribute,
        data: ChunkData,
        nulls: Option<ArrayD<bool>>,
    ) -> Result<Self> {
        let shape = tile.shape();
        if data.scalar_type() != attribute.scalar_type {
            return Err(Error::Schema(format!(
                "attribute {} holds {} values, chunk holds {}",
                attribute.name,
                attribute.scalar_type,
                data.scalar_type()
            )));
        }
        if data.shape() != &shape[..] {
            return Err(Error::Schema(format!(
                "chunk of shape {:?} does not fit tile {tile}",
                data.shape()
            )));
        }
        if let Some(nulls) = &nulls {
            if !attribute.nullable || nulls.shape() != &shape[..] {
                return Err(Error::Schema(format!(
                    "null mask does not fit attribute {} over tile {tile}",
                    attribute.name
                )));
            }
        }

        Ok(Self {
            tile,
            attribute,
            data,
            nulls,
        })
    }

    /// A chunk of zeros, with every cell null if the attribute is nullable.
    pub fn empty(tile: ArrayTile, attribute: Attribute) -> Self {
        let shape = tile.shape();
        let data = ChunkData::zeros(attribute.scalar_type, &shape);
        let nulls = if attribute.nullable {
            Some(ArrayD::from_elem(IxDyn(&shape), true))
        } else {
            None
        };

        Self {
            tile,
            attribute,
            data,
            nulls,
        }
    }

    /// Decode a binary payload returned by the remote store.
    ///
    /// An empty payload means the tile holds no data and yields `Error::NotFound`. A payload that
    /// doesn't hold exactly one cell per tile position is an `Error::Decode`.
    ///
    pub fn decode(
        tile: ArrayTile,
        attribute: Attribute,
        layout: WireLayout,
        bytes: &[u8],
    ) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::NotFound(format!(
                "no data for attribute {} in tile {tile}",
                attribute.name
            )));
        }

        let shape = tile.shape();
        let cells = tile.cell_count();
        let stride = layout.stride(attribute.scalar_type);
        if bytes.len() != cells * stride {
            return Err(Error::Decode(format!(
                "expected {cells} cells of {stride} bytes for tile {tile}, got {} bytes",
                bytes.len()
            )));
        }

        let nulls = match layout {
            WireLayout::Dense => None,
            WireLayout::NullPrefixed => {
                let mask = bytes.chunks_exact(stride).map(|cell| cell[0] != PRESENT).collect();
                Some(
                    ArrayD::from_shape_vec(IxDyn(&shape), mask)
                        .map_err(|err| Error::Decode(err.to_string()))?,
                )
            }
        };
        let data = ChunkData::decode(
            attribute.scalar_type,
            &shape,
            bytes.chunks_exact(stride),
            layout.prefix(),
        )?;

        Ok(Self {
            tile,
            attribute,
            data,
            nulls,
        })
    }

    /// Encode into the binary wire format, the inverse of `decode`.
    pub fn encode(&self, layout: WireLayout) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tile.cell_count() * layout.stride(self.attribute.scalar_type));
        self.data.encode(self.nulls.as_ref(), layout, &mut out);

        out
    }

    pub fn tile(&self) -> &ArrayTile {
        &self.tile
    }

    pub fn attribute(&self) -> &Attribute {
        &self.attribute
    }

    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    pub fn nulls(&self) -> Option<&ArrayD<bool>> {
        self.nulls.as_ref()
    }

    pub fn is_null(&self, index: &[usize]) -> bool {
        match &self.nulls {
            None => false,
            Some(nulls) => nulls.get(IxDyn(index)).copied().unwrap_or(false),
        }
    }

    /// Value at `index` widened to `f64`, or `None` for null or out-of-range cells.
    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        if self.is_null(index) {
            None
        } else {
            self.data.get_f64(index)
        }
    }
}

/// Encode several attributes over one tile cell by cell: each cell holds one value per chunk, in
/// the order given. This is the layout of a multi-attribute binary load.
///
pub fn encode_cells(chunks: &[(&SingleAttributeChunk, WireLayout)]) -> Result<Vec<u8>> {
    let tile = match chunks.first() {
        Some((chunk, _)) => chunk.tile(),
        None => return Ok(vec![]),
    };

    let mut columns = Vec::with_capacity(chunks.len());
    for (chunk, layout) in chunks {
        if chunk.tile() != tile {
            return Err(Error::Schema(format!(
                "attribute {} covers tile {}, not {tile}",
                chunk.attribute.name, chunk.tile
            )));
        }
        columns.push((chunk.encode(*layout), layout.stride(chunk.attribute.scalar_type)));
    }

    let width: usize = columns.iter().map(|(_, stride)| stride).sum();
    let mut out = Vec::with_capacity(tile.cell_count() * width);
    for cell in 0..tile.cell_count() {
        for (bytes, stride) in &columns {
            out.extend_from_slice(&bytes[cell * stride..(cell + 1) * stride]);
        }
    }

    Ok(out)
}

impl Cacheable for SingleAttributeChunk {
    fn size(&self) -> u64 {
        let cells = self.tile.cell_count() as u64;
        let nulls = if self.nulls.is_some() { cells } else { 0 };

        cells * self.attribute.scalar_type.width() as u64 + nulls
    }
}
