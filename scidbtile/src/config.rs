use std::{env, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    array::{Array, Attribute},
    errors::{Error, Result},
    geom::AffineTransform,
    reference::{
        parse_authority, SpatialReference, TemporalReference, DEFAULT_T_DIMENSION,
        DEFAULT_X_DIMENSION, DEFAULT_Y_DIMENSION,
    },
    tile::DimRange,
    time::{TDuration, TPoint, TReference},
};

const MIB: u64 = 1024 * 1024;

/// Where and how to reach the remote array database.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub ssl: bool,

    /// Check the server's TLS certificate. Turn off for shims serving a self-signed one.
    pub verify_certs: bool,

    /// Array to open, when the connection names one
    pub array: Option<String>,

    /// Pin the remote version, e.g. "19.11". Any supported version is accepted when unset.
    pub protocol_version: Option<String>,

    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,

    /// Upper bound on sessions held open at once
    pub max_sessions: usize,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 8083,
            user: String::from("scidb"),
            password: String::from("scidb"),
            ssl: true,
            verify_certs: true,
            array: None,
            protocol_version: None,
            timeout_secs: 300,
            connect_timeout_secs: 10,
            max_sessions: 4,
        }
    }
}

impl ConnectionParameters {
    /// Defaults, overridden by any of `SCIDB_HOST`, `SCIDB_PORT`, `SCIDB_USER`, `SCIDB_PASSWORD`
    /// and `SCIDB_SSL` found in the environment.
    pub fn from_env() -> Result<Self> {
        let mut parameters = Self::default();
        for (var, key) in [
            ("SCIDB_HOST", ConnectionKey::Host),
            ("SCIDB_PORT", ConnectionKey::Port),
            ("SCIDB_USER", ConnectionKey::User),
            ("SCIDB_PASSWORD", ConnectionKey::Password),
            ("SCIDB_SSL", ConnectionKey::Ssl),
        ] {
            if let Ok(value) = env::var(var) {
                parameters.assign(key, &value)?;
            }
        }

        Ok(parameters)
    }

    /// Set one parameter from its text value.
    ///
    /// A host given with an `https` scheme turns ssl on.
    ///
    pub fn assign(&mut self, key: ConnectionKey, value: &str) -> Result<()> {
        match key {
            ConnectionKey::Host => {
                self.host = value.to_string();
                if value.starts_with("https") {
                    self.ssl = true;
                } else if value.starts_with("http:") {
                    self.ssl = false;
                }
            }
            ConnectionKey::Port => {
                self.port = value
                    .parse()
                    .map_err(|_| Error::parse("port", value))?;
            }
            ConnectionKey::User => self.user = value.to_string(),
            ConnectionKey::Password => self.password = value.to_string(),
            ConnectionKey::Ssl => self.ssl = parse_bool(value)?,
            ConnectionKey::Array => self.array = Some(value.to_string()),
        }

        Ok(())
    }

    /// Root URL of the shim, e.g. `https://localhost:8083`
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}:{}", self.port)
        } else {
            let scheme = if self.ssl { "https" } else { "http" };
            format!("{scheme}://{host}:{}", self.port)
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::parse("boolean", value)),
    }
}

/// Keys accepted in a connection string
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKey {
    Host,
    Port,
    User,
    Password,
    Ssl,
    Array,
}

impl FromStr for ConnectionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "port" => Ok(Self::Port),
            "user" => Ok(Self::User),
            "password" => Ok(Self::Password),
            "ssl" => Ok(Self::Ssl),
            "array" => Ok(Self::Array),
            _ => Err(Error::parse("connection key", s)),
        }
    }
}

/// Which references a newly created array carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationType {
    /// Spatial only
    #[default]
    #[serde(rename = "S")]
    Spatial,

    /// Spatial with a single time slice
    #[serde(rename = "ST")]
    SpatioTemporal,

    /// Spatial time series
    #[serde(rename = "STS")]
    Series,
}

impl CreationType {
    pub fn is_temporal(&self) -> bool {
        !matches!(self, Self::Spatial)
    }
}

impl FromStr for CreationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "S" => Ok(Self::Spatial),
            "ST" => Ok(Self::SpatioTemporal),
            "STS" => Ok(Self::Series),
            _ => Err(Error::parse("creation type (S, ST or STS)", s)),
        }
    }
}

/// Keys accepted as creation or opening properties
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKey {
    Dt,
    Timestamp,
    Type,
    TemporalIndex,
    BBox,
    Srs,
}

impl FromStr for PropertyKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dt" => Ok(Self::Dt),
            "timestamp" | "t" => Ok(Self::Timestamp),
            "type" => Ok(Self::Type),
            "i" => Ok(Self::TemporalIndex),
            "bbox" => Ok(Self::BBox),
            "srs" => Ok(Self::Srs),
            _ => Err(Error::parse("property key", s)),
        }
    }
}

/// Georeferencing to attach to a new array.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreationParameters {
    pub kind: CreationType,

    /// Instant of temporal index 0
    pub timestamp: Option<TPoint>,

    /// Step between temporal indexes
    pub dt: Option<TDuration>,

    /// Authority and code, e.g. ("EPSG", 4326)
    pub srs: Option<(String, i32)>,

    /// xmin, ymin, xmax, ymax
    pub bbox: Option<[f64; 4]>,
}

impl CreationParameters {
    /// Set one property from its text value.
    pub fn assign(&mut self, key: PropertyKey, value: &str) -> Result<()> {
        match key {
            PropertyKey::Dt => self.dt = Some(value.parse()?),
            PropertyKey::Timestamp => self.timestamp = Some(value.parse()?),
            PropertyKey::Type => self.kind = value.parse()?,
            PropertyKey::Srs => self.srs = Some(parse_authority(value)?),
            PropertyKey::BBox => {
                let coords = value
                    .split(' ')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<f64>().map_err(|_| Error::parse("bbox", value)))
                    .collect::<Result<Vec<_>>>()?;
                let bbox: [f64; 4] = coords
                    .try_into()
                    .map_err(|_| Error::parse("bbox", value))?;
                self.bbox = Some(bbox);
            }
            PropertyKey::TemporalIndex => {
                return Err(Error::parse("creation property", "i"));
            }
        }

        Ok(())
    }

    /// Attach the references described by these parameters to a plain array schema.
    ///
    /// The spatial dimensions are `x` and `y`, the temporal one `t`. With a bounding box, the
    /// affine transform maps the grid onto it north-up. Without one, the transform is the
    /// identity.
    ///
    pub fn apply(&self, array: Array) -> Result<Array> {
        let x = array.dimension(DEFAULT_X_DIMENSION)?;
        let y = array.dimension(DEFAULT_Y_DIMENSION)?;
        let affine = match self.bbox {
            None => AffineTransform::default(),
            Some([xmin, ymin, xmax, ymax]) => AffineTransform::new(
                xmin,
                ymax,
                (xmax - xmin) / x.length() as f64,
                -(ymax - ymin) / y.length() as f64,
                0.0,
                0.0,
            ),
        };
        let mut srs = SpatialReference::new(DEFAULT_X_DIMENSION, DEFAULT_Y_DIMENSION, affine);
        if let Some((auth_name, auth_srid)) = &self.srs {
            srs = srs.with_authority(auth_name.clone(), *auth_srid);
        }
        let array = array.with_spatial(srs)?;

        if !self.kind.is_temporal() {
            return Ok(array);
        }

        let t0 = self.timestamp.ok_or_else(|| {
            Error::Schema(format!("array {} needs a timestamp", array.name()))
        })?;
        let dt = match (&self.dt, self.kind) {
            (Some(dt), _) => *dt,
            // A single slice still needs a step; a day is as good as any
            (None, CreationType::SpatioTemporal) => TDuration::new(0, 1, 0),
            (None, _) => {
                return Err(Error::Schema(format!(
                    "time series {} needs a temporal resolution",
                    array.name()
                )))
            }
        };
        let trs = TemporalReference::new(DEFAULT_T_DIMENSION, TReference::new(t0, dt)?);

        array.with_temporal(trs)
    }
}

/// A read request expressed in array terms.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryParameters {
    pub array: String,

    /// Attributes to read. Empty means all of them.
    pub attributes: Vec<String>,

    /// Index ranges for named dimensions. Unnamed dimensions are read in full.
    pub bounds: Vec<(String, DimRange)>,

    /// Select the time slice containing this instant
    pub timestamp: Option<TPoint>,

    /// Select this temporal index. Takes precedence over `timestamp`.
    pub temporal_index: Option<i64>,
}

impl QueryParameters {
    pub fn new(array: impl Into<String>) -> Self {
        Self {
            array: array.into(),
            ..Self::default()
        }
    }

    /// The requested index range for every dimension of `array`, in dimension order.
    pub fn request(&self, array: &Array) -> Result<Vec<DimRange>> {
        let mut request = array.extent();
        for (name, range) in &self.bounds {
            request[array.dimension_index(name)?] = *range;
        }

        let slice = match (self.temporal_index, &self.timestamp) {
            (Some(index), _) => Some(index),
            (None, Some(point)) => Some(array.temporal_reference()?.index_of(point)?),
            (None, None) => None,
        };
        if let Some(index) = slice {
            let trs = array.temporal_reference()?;
            request[array.dimension_index(&trs.t_dim)?] = DimRange::at(index);
        }

        Ok(request)
    }

    /// The requested attributes of `array`
    pub fn attributes<'a>(&self, array: &'a Array) -> Result<Vec<&'a Attribute>> {
        if self.attributes.is_empty() {
            Ok(array.attributes().iter().collect())
        } else {
            self.attributes
                .iter()
                .map(|name| array.attribute(name))
                .collect()
        }
    }
}

/// When writes reach the remote store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Writes are cached dirty and stored on flush or eviction
    #[default]
    WriteBack,

    /// Writes are stored before they are cached
    WriteThrough,
}

/// Tile cache sizing and behavior.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes of tiles to keep before evicting
    pub capacity: u64,

    /// Bytes of tiles, dirty ones included, never to exceed
    pub hard_limit: u64,

    pub policy: WritePolicy,

    /// Remember tiles the store has no data for, until they are written
    pub cache_not_found: bool,

    /// Tiles remembered as holding no data, oldest forgotten first
    pub max_not_found: usize,

    /// Cells a single window read may hold
    pub max_window_cells: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256 * MIB,
            hard_limit: 1024 * MIB,
            policy: WritePolicy::default(),
            cache_not_found: false,
            max_not_found: 4096,
            max_window_cells: 1 << 28,
        }
    }
}
