use std::fmt;
use std::sync::Arc;

use crate::array::{Array, Dimension};
use crate::errors::{Error, Result};

/// An inclusive range of indexes along one dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DimRange {
    pub low: i64,
    pub high: i64,
    _private: (),
}

impl DimRange {
    pub fn new(low: i64, high: i64) -> Self {
        let (low, high) = if low > high { (high, low) } else { (low, high) };
        Self {
            low,
            high,
            _private: (),
        }
    }

    /// A range covering the single index `index`
    pub fn at(index: i64) -> Self {
        Self::new(index, index)
    }

    /// Number of indexes in the range, saturating at `usize::MAX`
    pub fn length(&self) -> usize {
        usize::try_from(self.high.abs_diff(self.low))
            .unwrap_or(usize::MAX)
            .saturating_add(1)
    }

    pub fn contains(&self, index: i64) -> bool {
        self.low <= index && index <= self.high
    }

    pub fn intersect(&self, other: &DimRange) -> Option<DimRange> {
        let low = self.low.max(other.low);
        let high = self.high.min(other.high);
        if low <= high {
            Some(DimRange::new(low, high))
        } else {
            None
        }
    }
}

impl fmt::Display for DimRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// Number of cells in the window `ranges`, or `None` if it overflows `usize`.
pub fn cell_count(ranges: &[DimRange]) -> Option<usize> {
    ranges
        .iter()
        .try_fold(1usize, |cells, range| cells.checked_mul(range.length()))
}

/// An axis-aligned hyper-rectangle of index ranges, one per array dimension.
///
/// Tiles are the cache's unit of storage. They are plain coordinates: two tiles with the same
/// ranges are equal and hash alike, and cloning one is cheap.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArrayTile {
    ranges: Arc<[DimRange]>,
}

impl ArrayTile {
    pub fn new(ranges: Vec<DimRange>) -> Self {
        Self {
            ranges: ranges.into(),
        }
    }

    pub fn ranges(&self) -> &[DimRange] {
        &self.ranges
    }

    pub fn shape(&self) -> Vec<usize> {
        self.ranges.iter().map(DimRange::length).collect()
    }

    pub fn cell_count(&self) -> usize {
        cell_count(&self.ranges).unwrap_or(usize::MAX)
    }

    /// The chunk-aligned tile of `array` containing the cell at `coords`.
    pub fn containing(array: &Array, coords: &[i64]) -> Result<Self> {
        if coords.len() != array.dimensions().len() {
            return Err(Error::Schema(format!(
                "{} coordinates given for array {} with {} dimensions",
                coords.len(),
                array.name(),
                array.dimensions().len()
            )));
        }

        let ranges = array
            .dimensions()
            .iter()
            .zip(coords)
            .map(|(dimension, &index)| {
                if dimension.contains(index) {
                    Ok(dimension.chunk_range(dimension.chunk_of(index)))
                } else {
                    Err(out_of_bounds(array, dimension, DimRange::at(index)))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(ranges))
    }
}

impl fmt::Display for ArrayTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        write!(f, "[{}]", ranges.join(","))
    }
}

fn out_of_bounds(array: &Array, dimension: &Dimension, range: DimRange) -> Error {
    Error::Schema(format!(
        "range {range} is outside dimension {} ({}) of array {}",
        dimension.name,
        dimension.range(),
        array.name()
    ))
}

/// One step of a tile enumeration: the chunk-aligned `tile` to fetch, and the `window` of the
/// request that falls inside it.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileSpan {
    pub tile: ArrayTile,
    pub window: Vec<DimRange>,
}

/// The tiles of an array covering a requested sub-range.
///
/// Enumeration is lazy, finite and restartable: every call to `iter` walks the same tiles in the
/// same order, outer dimension varying slowest. The windows of the yielded spans partition the
/// request exactly.
///
#[derive(Clone, Debug)]
pub struct TileGrid {
    axes: Vec<Axis>,
}

#[derive(Clone, Debug)]
struct Axis {
    dimension: Dimension,
    request: DimRange,
    first: i64,
    last: i64,
}

impl TileGrid {
    /// Tiles of `array` covering `request`, which holds one range per dimension.
    pub fn new(array: &Array, request: &[DimRange]) -> Result<Self> {
        if request.len() != array.dimensions().len() {
            return Err(Error::Schema(format!(
                "request has {} ranges, array {} has {} dimensions",
                request.len(),
                array.name(),
                array.dimensions().len()
            )));
        }

        let axes = array
            .dimensions()
            .iter()
            .zip(request)
            .map(|(dimension, &request)| {
                if !dimension.contains(request.low) || !dimension.contains(request.high) {
                    return Err(out_of_bounds(array, dimension, request));
                }

                Ok(Axis {
                    dimension: dimension.clone(),
                    request,
                    first: dimension.chunk_of(request.low),
                    last: dimension.chunk_of(request.high),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { axes })
    }

    /// All tiles of `array`.
    pub fn full(array: &Array) -> Result<Self> {
        Self::new(array, &array.extent())
    }

    /// Number of tiles in the grid
    pub fn len(&self) -> usize {
        self.axes
            .iter()
            .map(|axis| DimRange::new(axis.first, axis.last).length())
            .fold(1usize, usize::saturating_mul)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> TileIter {
        TileIter {
            grid: self.clone(),
            next: Some(self.axes.iter().map(|axis| axis.first).collect()),
        }
    }
}

impl IntoIterator for &TileGrid {
    type Item = TileSpan;
    type IntoIter = TileIter;

    fn into_iter(self) -> TileIter {
        self.iter()
    }
}

#[derive(Clone, Debug)]
pub struct TileIter {
    grid: TileGrid,
    next: Option<Vec<i64>>,
}

impl Iterator for TileIter {
    type Item = TileSpan;

    fn next(&mut self) -> Option<Self::Item> {
        let chunks = self.next.take()?;
        let mut ranges = Vec::with_capacity(chunks.len());
        let mut window = Vec::with_capacity(chunks.len());
        for (axis, &chunk) in self.grid.axes.iter().zip(&chunks) {
            let range = axis.dimension.chunk_range(chunk);
            // Chunks between first and last always meet the request
            window.push(range.intersect(&axis.request)?);
            ranges.push(range);
        }

        // Advance the innermost dimension first, carrying outward
        let mut following = chunks;
        for (i, axis) in self.grid.axes.iter().enumerate().rev() {
            if following[i] < axis.last {
                following[i] += 1;
                self.next = Some(following);
                break;
            }
            following[i] = axis.first;
        }

        Some(TileSpan {
            tile: ArrayTile::new(ranges),
            window,
        })
    }
}
