use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::reference::{SpatialReference, TemporalReference};
use crate::tile::{ArrayTile, DimRange};

/// Value type of an array attribute, named as the remote store names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Bool,
}

impl ScalarType {
    /// Width in bytes of one value in the binary wire format
    pub fn width(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double => 8,
        }
    }

    pub fn type_id(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float => "float",
            Self::Double => "double",
            Self::Bool => "bool",
        }
    }
}

impl FromStr for ScalarType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "int8" => Ok(Self::Int8),
            "int16" => Ok(Self::Int16),
            "int32" => Ok(Self::Int32),
            "int64" => Ok(Self::Int64),
            "uint8" => Ok(Self::UInt8),
            "uint16" => Ok(Self::UInt16),
            "uint32" => Ok(Self::UInt32),
            "uint64" => Ok(Self::UInt64),
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            "bool" => Ok(Self::Bool),
            other => Err(Error::UnsupportedType(other.to_string())),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Attribute {
    pub name: String,
    pub scalar_type: ScalarType,
    pub nullable: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, scalar_type: ScalarType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            scalar_type,
            nullable,
        }
    }

    /// Binary save format for this attribute alone, e.g. `(float null)`
    pub fn format(&self) -> String {
        format!("({})", self.type_spec())
    }

    /// Type in schema notation, e.g. `float null`
    pub fn type_spec(&self) -> String {
        if self.nullable {
            format!("{} null", self.scalar_type)
        } else {
            self.scalar_type.to_string()
        }
    }
}

/// An integer dimension `[low, high]` tiled in chunks of `chunk_interval` cells, the first chunk
/// starting at `low`.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dimension {
    pub name: String,
    pub low: i64,
    pub high: i64,
    pub chunk_interval: i64,
    _private: (),
}

impl Dimension {
    pub fn new(name: impl Into<String>, low: i64, high: i64, chunk_interval: i64) -> Result<Self> {
        let name = name.into();
        if high < low {
            return Err(Error::Schema(format!(
                "dimension {name} has empty range {low}:{high}"
            )));
        }
        if chunk_interval <= 0 {
            return Err(Error::Schema(format!(
                "dimension {name} has chunk interval {chunk_interval}"
            )));
        }

        Ok(Self {
            name,
            low,
            high,
            chunk_interval,
            _private: (),
        })
    }

    /// Number of cells along this dimension
    pub fn length(&self) -> u64 {
        self.high.abs_diff(self.low).saturating_add(1)
    }

    pub fn contains(&self, index: i64) -> bool {
        self.low <= index && index <= self.high
    }

    pub fn range(&self) -> DimRange {
        DimRange::new(self.low, self.high)
    }

    /// Index of the chunk containing `index`, counted from `low`.
    pub fn chunk_of(&self, index: i64) -> i64 {
        (index - self.low).div_euclid(self.chunk_interval)
    }

    /// The range covered by chunk number `chunk`, clipped to the dimension's bounds.
    pub fn chunk_range(&self, chunk: i64) -> DimRange {
        let low = self.low + chunk * self.chunk_interval;
        let high = (low + self.chunk_interval - 1).min(self.high);
        DimRange::new(low, high)
    }
}

/// Summary statistics of one attribute over a whole array.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttributeStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// Which reference capabilities an array carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayKind {
    Plain,
    Spatial,
    Temporal,
    SpatioTemporal,
}

/// Schema of a remote array: ordered dimensions and attributes, plus optional spatial and
/// temporal references.
///
/// An `Array` is built once, when the remote array is opened or created, and is immutable
/// afterward. Names are looked up through hash indexes.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    name: String,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
    dimension_index: HashMap<String, usize>,
    attribute_index: HashMap<String, usize>,
    spatial: Option<SpatialReference>,
    temporal: Option<TemporalReference>,
}

impl Array {
    pub fn new(
        name: impl Into<String>,
        dimensions: Vec<Dimension>,
        attributes: Vec<Attribute>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Schema(format!("invalid array name {name:?}")));
        }
        if dimensions.is_empty() || attributes.is_empty() {
            return Err(Error::Schema(format!(
                "array {name} needs at least one dimension and one attribute"
            )));
        }

        let mut dimension_index = HashMap::new();
        for (i, dimension) in dimensions.iter().enumerate() {
            if dimension_index.insert(dimension.name.clone(), i).is_some() {
                return Err(Error::Schema(format!(
                    "array {name} declares dimension {} twice",
                    dimension.name
                )));
            }
        }

        let mut attribute_index = HashMap::new();
        for (i, attribute) in attributes.iter().enumerate() {
            if dimension_index.contains_key(&attribute.name)
                || attribute_index.insert(attribute.name.clone(), i).is_some()
            {
                return Err(Error::Schema(format!(
                    "array {name} declares name {} twice",
                    attribute.name
                )));
            }
        }

        Ok(Self {
            name,
            dimensions,
            attributes,
            dimension_index,
            attribute_index,
            spatial: None,
            temporal: None,
        })
    }

    /// Attach a spatial reference. Its x and y dimensions must be two distinct dimensions of this
    /// array.
    ///
    pub fn with_spatial(mut self, srs: SpatialReference) -> Result<Self> {
        self.spatial = Some(srs);
        self.check_references()?;
        Ok(self)
    }

    /// Attach a temporal reference bound to one of this array's dimensions.
    pub fn with_temporal(mut self, trs: TemporalReference) -> Result<Self> {
        self.temporal = Some(trs);
        self.check_references()?;
        Ok(self)
    }

    fn check_references(&self) -> Result<()> {
        let mut referenced = vec![];
        if let Some(srs) = &self.spatial {
            if srs.x_dim == srs.y_dim {
                return Err(Error::Schema(format!(
                    "array {}: x and y are both dimension {}",
                    self.name, srs.x_dim
                )));
            }
            referenced.push(self.dimension_index(&srs.x_dim)?);
            referenced.push(self.dimension_index(&srs.y_dim)?);
        }
        if let Some(trs) = &self.temporal {
            let t = self.dimension_index(&trs.t_dim)?;
            if referenced.contains(&t) {
                return Err(Error::Schema(format!(
                    "array {}: dimension {} is both spatial and temporal",
                    self.name, trs.t_dim
                )));
            }
            referenced.push(t);
        }
        if self.spatial.is_some() && self.temporal.is_some() && referenced.len() != self.dimensions.len()
        {
            return Err(Error::Schema(format!(
                "spatio-temporal array {} has dimensions that are neither spatial nor temporal",
                self.name
            )));
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn kind(&self) -> ArrayKind {
        match (&self.spatial, &self.temporal) {
            (None, None) => ArrayKind::Plain,
            (Some(_), None) => ArrayKind::Spatial,
            (None, Some(_)) => ArrayKind::Temporal,
            (Some(_), Some(_)) => ArrayKind::SpatioTemporal,
        }
    }

    pub fn is_spatial(&self) -> bool {
        self.spatial.is_some()
    }

    pub fn is_temporal(&self) -> bool {
        self.temporal.is_some()
    }

    pub fn dimension_index(&self, name: &str) -> Result<usize> {
        self.dimension_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownDimension {
                array: self.name.clone(),
                name: name.to_string(),
            })
    }

    pub fn dimension(&self, name: &str) -> Result<&Dimension> {
        Ok(&self.dimensions[self.dimension_index(name)?])
    }

    pub fn attribute_index(&self, name: &str) -> Result<usize> {
        self.attribute_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownAttribute {
                array: self.name.clone(),
                name: name.to_string(),
            })
    }

    pub fn attribute(&self, name: &str) -> Result<&Attribute> {
        Ok(&self.attributes[self.attribute_index(name)?])
    }

    pub fn spatial_reference(&self) -> Result<&SpatialReference> {
        self.spatial.as_ref().ok_or_else(|| Error::CapabilityAbsent {
            array: self.name.clone(),
            capability: "spatial",
        })
    }

    pub fn temporal_reference(&self) -> Result<&TemporalReference> {
        self.temporal.as_ref().ok_or_else(|| Error::CapabilityAbsent {
            array: self.name.clone(),
            capability: "temporal",
        })
    }

    pub fn x_dimension(&self) -> Result<&Dimension> {
        self.dimension(&self.spatial_reference()?.x_dim)
    }

    pub fn y_dimension(&self) -> Result<&Dimension> {
        self.dimension(&self.spatial_reference()?.y_dim)
    }

    pub fn t_dimension(&self) -> Result<&Dimension> {
        self.dimension(&self.temporal_reference()?.t_dim)
    }

    /// The full declared extent, one range per dimension.
    pub fn extent(&self) -> Vec<DimRange> {
        self.dimensions.iter().map(Dimension::range).collect()
    }

    /// Check that `tile` is one chunk of this array: one range per dimension, each starting on a
    /// chunk boundary and spanning that chunk.
    ///
    pub fn validate_tile(&self, tile: &ArrayTile) -> Result<()> {
        if tile.ranges().len() != self.dimensions.len() {
            return Err(Error::Schema(format!(
                "tile {tile} has {} dimensions, array {} has {}",
                tile.ranges().len(),
                self.name,
                self.dimensions.len()
            )));
        }
        for (range, dimension) in tile.ranges().iter().zip(&self.dimensions) {
            if !dimension.contains(range.low)
                || dimension.chunk_range(dimension.chunk_of(range.low)) != *range
            {
                return Err(Error::Schema(format!(
                    "tile {tile} is not a chunk of array {} along {}",
                    self.name, dimension.name
                )));
            }
        }

        Ok(())
    }

    /// Schema in the remote's notation: `<a:float null,...>[x=0:999,256,0,...]`
    pub fn schema_string(&self) -> String {
        let attributes: Vec<String> = self
            .attributes
            .iter()
            .map(|a| format!("{}:{}", a.name, a.type_spec()))
            .collect();
        let dimensions: Vec<String> = self
            .dimensions
            .iter()
            .map(|d| format!("{}={}:{},{},0", d.name, d.low, d.high, d.chunk_interval))
            .collect();

        format!("<{}>[{}]", attributes.join(","), dimensions.join(","))
    }

    /// Binary save format covering all attributes: `(float null,int16)`
    pub fn format_string(&self) -> String {
        let types: Vec<String> = self.attributes.iter().map(Attribute::type_spec).collect();
        format!("({})", types.join(","))
    }
}
