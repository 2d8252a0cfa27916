use std::ops::Range;

use crate::errors::{Error, Result};
use crate::geom::AffineTransform;
use crate::time::{TInterval, TPoint, TReference};

pub const DEFAULT_X_DIMENSION: &str = "x";
pub const DEFAULT_Y_DIMENSION: &str = "y";
pub const DEFAULT_T_DIMENSION: &str = "t";

/// Coordinate reference system of a spatial array: the two dimensions that carry x and y, the
/// CRS itself, and the affine transform from grid to CRS coordinates.
///
#[derive(Clone, Debug, PartialEq)]
pub struct SpatialReference {
    pub x_dim: String,
    pub y_dim: String,
    pub auth_name: String,
    pub auth_srid: i32,
    pub srtext: String,
    pub proj4text: String,
    pub affine: AffineTransform,
}

impl SpatialReference {
    pub fn new(x_dim: impl Into<String>, y_dim: impl Into<String>, affine: AffineTransform) -> Self {
        Self {
            x_dim: x_dim.into(),
            y_dim: y_dim.into(),
            auth_name: String::new(),
            auth_srid: 0,
            srtext: String::new(),
            proj4text: String::new(),
            affine,
        }
    }

    pub fn with_authority(mut self, auth_name: impl Into<String>, auth_srid: i32) -> Self {
        self.auth_name = auth_name.into();
        self.auth_srid = auth_srid;
        self
    }

    pub fn with_definitions(mut self, srtext: impl Into<String>, proj4text: impl Into<String>) -> Self {
        self.srtext = srtext.into();
        self.proj4text = proj4text.into();
        self
    }

    /// `AUTH:SRID`, e.g. `EPSG:4326`, if an authority is known.
    pub fn authority(&self) -> Option<String> {
        if self.auth_name.is_empty() {
            None
        } else {
            Some(format!("{}:{}", self.auth_name, self.auth_srid))
        }
    }

    pub fn to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        self.affine.to_geo(col, row)
    }

    pub fn to_grid(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        self.affine.to_grid(x, y)
    }
}

/// Parse an `AUTH:SRID` pair such as `EPSG:32632`.
pub fn parse_authority(s: &str) -> Result<(String, i32)> {
    let (name, srid) = s
        .split_once(':')
        .ok_or_else(|| Error::parse("spatial reference authority", s))?;
    let srid = srid
        .trim()
        .parse()
        .map_err(|_| Error::parse("spatial reference authority", s))?;

    Ok((name.trim().to_uppercase(), srid))
}

/// Temporal reference of a temporal array: a `TReference` bound to one of the array's
/// dimensions.
///
#[derive(Clone, Debug, PartialEq)]
pub struct TemporalReference {
    pub t_dim: String,
    reference: TReference,
}

impl TemporalReference {
    pub fn new(t_dim: impl Into<String>, reference: TReference) -> Self {
        Self {
            t_dim: t_dim.into(),
            reference,
        }
    }

    pub fn reference(&self) -> &TReference {
        &self.reference
    }

    pub fn point_at(&self, index: i64) -> Result<TPoint> {
        self.reference.point_at(index)
    }

    pub fn interval_at(&self, index: i64) -> Result<TInterval> {
        self.reference.interval_at(index)
    }

    pub fn index_of(&self, point: &TPoint) -> Result<i64> {
        self.reference.index_of(point)
    }

    pub fn index_range(&self, interval: &TInterval) -> Result<Range<i64>> {
        self.reference.index_range(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority() -> Result<()> {
        let srs = SpatialReference::new("x", "y", AffineTransform::default());
        assert_eq!(srs.authority(), None);

        let srs = srs.with_authority("EPSG", 4326);
        assert_eq!(srs.authority(), Some(String::from("EPSG:4326")));

        assert_eq!(parse_authority("epsg:32632")?, (String::from("EPSG"), 32632));
        assert!(parse_authority("EPSG").is_err());
        assert!(parse_authority("EPSG:abc").is_err());

        Ok(())
    }

    #[test]
    fn test_temporal_reference_delegates() -> Result<()> {
        let reference = TReference::new("2000-01-01".parse()?, "P1D".parse()?)?;
        let trs = TemporalReference::new("t", reference);
        let point: TPoint = "2000-01-03T06:00:00".parse()?;
        assert_eq!(trs.index_of(&point)?, 2);
        assert_eq!(trs.point_at(2)?, "2000-01-03".parse()?);

        Ok(())
    }
}
