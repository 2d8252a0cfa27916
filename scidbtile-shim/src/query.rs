//! AFL query text for the operations the shim store performs, and parsers for their CSV results.
//!
use scidbtile::{
    AffineTransform, Array, ArrayTile, Attribute, AttributeStats, Dimension, Error, Result,
    ScalarType, SpatialReference, TDuration, TPoint, TReference, TemporalReference,
};

/// Save format for textual results: CSV with a header line.
pub(crate) const CSV: &str = "csv:l";

/// Name of the cell counter dimension of an uploaded tile
const CELL: &str = "tile_cell_";

/// Quote a string literal for AFL.
fn literal(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub(crate) fn list_arrays() -> String {
    String::from("project(list('arrays'),name)")
}

pub(crate) fn dimensions(array: &str) -> String {
    format!("project(dimensions({array}),name,start,length,chunk_interval,type)")
}

pub(crate) fn attributes(array: &str) -> String {
    format!("project(attributes({array}),name,type_id,nullable)")
}

pub(crate) fn get_srs(array: &str) -> String {
    format!("project(eo_getsrs({array}),xdim,ydim,auth_name,auth_srid,srtext,proj4text,A)")
}

pub(crate) fn get_trs(array: &str) -> String {
    format!("project(eo_gettrs({array}),tdim,t0,dt)")
}

pub(crate) fn create(array: &Array) -> String {
    format!("create array {} {}", array.name(), array.schema_string())
}

pub(crate) fn set_srs(array: &str, srs: &SpatialReference) -> String {
    format!(
        "eo_setsrs({array},{},{},{},{},{})",
        literal(&srs.x_dim),
        literal(&srs.y_dim),
        literal(&srs.auth_name),
        srs.auth_srid,
        literal(&srs.affine.to_string()),
    )
}

pub(crate) fn set_trs(array: &str, trs: &TemporalReference) -> String {
    let reference = trs.reference();
    format!(
        "eo_settrs({array},{},{},{})",
        literal(&trs.t_dim),
        literal(&reference.t0().to_string()),
        literal(&reference.dt().to_string()),
    )
}

pub(crate) fn remove(array: &str) -> String {
    format!("remove({array})")
}

/// Select one attribute over one tile.
pub(crate) fn between(array: &str, tile: &ArrayTile, attribute: &str) -> String {
    let lows = tile.ranges().iter().map(|r| r.low.to_string());
    let highs = tile.ranges().iter().map(|r| r.high.to_string());
    let bounds: Vec<String> = lows.chain(highs).collect();

    format!("project(between({array},{}),{attribute})", bounds.join(","))
}

/// Insert an uploaded tile into `array`.
///
/// The upload holds every attribute of the array, cell by cell, as a flat list of cells. They are
/// placed back onto the tile's coordinates in row-major order.
///
pub(crate) fn insert_tile(array: &Array, tile: &ArrayTile, path: &str) -> String {
    let cells = tile.cell_count();
    let schema: Vec<String> = array
        .attributes()
        .iter()
        .map(|a| format!("{}:{}", a.name, a.type_spec()))
        .collect();
    let input = format!(
        "input(<{}>[{CELL}=0:{}], {}, -2, {})",
        schema.join(","),
        cells.saturating_sub(1),
        literal(path),
        literal(&array.format_string()),
    );

    let shape = tile.shape();
    let mut placements = vec![];
    let mut stride = 1;
    for ((dimension, range), length) in array
        .dimensions()
        .iter()
        .zip(tile.ranges())
        .zip(&shape)
        .rev()
    {
        placements.push(format!(
            "{},{} + {CELL} / {stride} % {length}",
            dimension.name, range.low
        ));
        stride *= length;
    }
    placements.reverse();

    format!(
        "insert(redimension(apply({input},{}),{name}),{name})",
        placements.join(","),
        name = array.name(),
    )
}

pub(crate) fn aggregate(array: &str, attribute: &str) -> String {
    format!(
        "aggregate({array},min({attribute}),max({attribute}),avg({attribute}),stdev({attribute}))"
    )
}

/// Split CSV text into rows of fields, dropping the header line.
///
/// Fields may be quoted with `'` or `"`. Inside quotes, separators are literal and a backslash
/// escapes the next character.
///
pub(crate) fn parse_csv(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(split_line)
        .collect()
}

fn split_line(line: &str) -> Vec<String> {
    let mut fields = vec![];
    let mut field = String::new();
    let mut quote = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(_), '\\') => {
                if let Some(escaped) = chars.next() {
                    field.push(escaped);
                }
            }
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => field.push(c),
            (None, '\'' | '"') => quote = Some(c),
            (None, ',') => fields.push(std::mem::take(&mut field)),
            (None, c) => field.push(c),
        }
    }
    fields.push(field);

    fields
}

fn bad(what: &'static str, row: &[String]) -> Error {
    Error::Parse {
        what,
        input: row.join(","),
    }
}

fn field<'a>(what: &'static str, row: &'a [String], index: usize) -> Result<&'a str> {
    row.get(index)
        .map(|s| s.trim())
        .ok_or_else(|| bad(what, row))
}

fn number<T: std::str::FromStr>(what: &'static str, row: &[String], index: usize) -> Result<T> {
    field(what, row, index)?.parse().map_err(|_| bad(what, row))
}

pub(crate) fn parse_names(text: &str) -> Vec<String> {
    parse_csv(text)
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .collect()
}

/// Dimensions from `name,start,length,chunk_interval,type` rows
pub(crate) fn parse_dimensions(text: &str) -> Result<Vec<Dimension>> {
    parse_csv(text)
        .iter()
        .map(|row| {
            let what = "dimension";
            let kind = field(what, row, 4)?;
            if kind != "int64" {
                return Err(Error::UnsupportedType(format!("dimension type {kind}")));
            }
            let start: i64 = number(what, row, 1)?;
            let length: i64 = number(what, row, 2)?;
            let chunk_interval = number(what, row, 3)?;

            Dimension::new(field(what, row, 0)?, start, start + length - 1, chunk_interval)
        })
        .collect()
}

/// Attributes from `name,type_id,nullable` rows
pub(crate) fn parse_attributes(text: &str) -> Result<Vec<Attribute>> {
    parse_csv(text)
        .iter()
        .map(|row| {
            let what = "attribute";
            let scalar_type: ScalarType = field(what, row, 1)?.parse()?;
            let nullable = match field(what, row, 2)? {
                "true" => true,
                "false" => false,
                _ => return Err(bad(what, row)),
            };

            Ok(Attribute::new(field(what, row, 0)?, scalar_type, nullable))
        })
        .collect()
}

/// Spatial reference from an `xdim,ydim,auth_name,auth_srid,srtext,proj4text,A` row, if any
pub(crate) fn parse_srs(text: &str) -> Result<Option<SpatialReference>> {
    let rows = parse_csv(text);
    let row = match rows.first() {
        Some(row) => row,
        None => return Ok(None),
    };

    let what = "spatial reference";
    let affine: AffineTransform = field(what, row, 6)?.parse()?;
    let srs = SpatialReference::new(field(what, row, 0)?, field(what, row, 1)?, affine)
        .with_authority(field(what, row, 2)?, number(what, row, 3)?)
        .with_definitions(field(what, row, 4)?, field(what, row, 5)?);

    Ok(Some(srs))
}

/// Temporal reference from a `tdim,t0,dt` row, if any
pub(crate) fn parse_trs(text: &str) -> Result<Option<TemporalReference>> {
    let rows = parse_csv(text);
    let row = match rows.first() {
        Some(row) => row,
        None => return Ok(None),
    };

    let what = "temporal reference";
    let t0: TPoint = field(what, row, 1)?.parse()?;
    let dt: TDuration = field(what, row, 2)?.parse()?;
    let trs = TemporalReference::new(field(what, row, 0)?, TReference::new(t0, dt)?);

    Ok(Some(trs))
}

/// Statistics from a `min,max,avg,stdev` row. All nulls means the attribute holds no data.
pub(crate) fn parse_stats(text: &str, array: &str, attribute: &str) -> Result<AttributeStats> {
    let rows = parse_csv(text);
    let row = rows.first().ok_or_else(|| Error::Parse {
        what: "attribute statistics",
        input: text.to_string(),
    })?;
    if row.iter().all(|value| value.trim() == "null") {
        return Err(Error::NotFound(format!(
            "attribute {attribute} of array {array} holds no data"
        )));
    }

    let what = "attribute statistics";
    let stddev = match field(what, row, 3)? {
        // A single value has no sample deviation
        "null" => 0.0,
        _ => number(what, row, 3)?,
    };

    Ok(AttributeStats {
        min: number(what, row, 0)?,
        max: number(what, row, 1)?,
        mean: number(what, row, 2)?,
        stddev,
    })
}
