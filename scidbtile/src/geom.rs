use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::errors::{Error, Result};

/// Affine map between integer grid coordinates (column, row) and continuous geographic
/// coordinates (x, y).
///
/// ```text
/// x = x0 + a11 * col + a12 * row
/// y = y0 + a21 * col + a22 * row
/// ```
///
/// The text form used by the remote store is `x0=.. y0=.. a11=.. a22=.. a12=.. a21=..`.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransform {
    pub x0: f64,
    pub y0: f64,
    pub a11: f64,
    pub a22: f64,
    pub a12: f64,
    pub a21: f64,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0, 0.0, 0.0)
    }
}

impl AffineTransform {
    pub fn new(x0: f64, y0: f64, a11: f64, a22: f64, a12: f64, a21: f64) -> Self {
        Self {
            x0,
            y0,
            a11,
            a22,
            a12,
            a21,
        }
    }

    /// Build from a GDAL-ordered geotransform `[x0, a11, a12, y0, a21, a22]`.
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self::new(gt[0], gt[3], gt[1], gt[5], gt[2], gt[4])
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [self.x0, self.a11, self.a12, self.y0, self.a21, self.a22]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Determinant of the linear part
    pub fn det(&self) -> f64 {
        self.a11 * self.a22 - self.a12 * self.a21
    }

    /// Map a grid coordinate to geographic space.
    pub fn to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.x0 + self.a11 * col + self.a12 * row,
            self.y0 + self.a21 * col + self.a22 * row,
        )
    }

    /// The transform mapping geographic coordinates back onto the grid.
    ///
    /// Fails with `Error::SingularTransform` if the linear part has no inverse.
    ///
    pub fn inverse(&self) -> Result<Self> {
        let det = self.det();
        if det == 0.0 || !det.is_finite() {
            return Err(Error::SingularTransform(det));
        }

        let a11 = self.a22 / det;
        let a12 = -self.a12 / det;
        let a21 = -self.a21 / det;
        let a22 = self.a11 / det;

        Ok(Self {
            x0: -(a11 * self.x0 + a12 * self.y0),
            y0: -(a21 * self.x0 + a22 * self.y0),
            a11,
            a22,
            a12,
            a21,
        })
    }

    /// Map a geographic coordinate to (fractional) grid space.
    pub fn to_grid(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        Ok(self.inverse()?.to_geo(x, y))
    }
}

impl FromStr for AffineTransform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut transform = Self::default();
        for token in s.split(&[' ', ',', ';'][..]).filter(|t| !t.is_empty()) {
            let (key, value) = token
                .split_once(&['=', ':'][..])
                .ok_or_else(|| Error::parse("affine transform", s))?;
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|_| Error::parse("affine transform", s))?;
            match key.trim() {
                "x0" => transform.x0 = value,
                "y0" => transform.y0 = value,
                "a11" => transform.a11 = value,
                "a22" => transform.a22 = value,
                "a12" => transform.a12 = value,
                "a21" => transform.a21 = value,
                other => warn!(key = other, "ignoring unknown affine transform coefficient"),
            }
        }

        Ok(transform)
    }
}

impl fmt::Display for AffineTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x0={} y0={} a11={} a22={} a12={} a21={}",
            self.x0, self.y0, self.a11, self.a22, self.a12, self.a21
        )
    }
}
