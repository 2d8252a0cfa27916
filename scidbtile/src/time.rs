use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::str::FromStr;

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use ndarray::Array1;

use crate::errors::{Error, Result};

/// Average length of a Gregorian month in seconds, used only to estimate indexes for steps that
/// mix calendar months with fixed-length units.
const AVERAGE_MONTH_SECONDS: i64 = 2_629_746;

/// Granularity of a point in time or of a step along a temporal axis.
///
/// Ordered from coarsest to finest.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TResolution {
    None,
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

/// A single instant on a temporal axis, with the resolution at which it was specified.
///
/// Points compare by instant only; `2001` and `2001-01-01` are the same point.
///
#[derive(Clone, Copy, Debug)]
pub struct TPoint {
    instant: NaiveDateTime,
    resolution: TResolution,
}

impl TPoint {
    pub fn new(instant: NaiveDateTime, resolution: TResolution) -> Self {
        Self {
            instant,
            resolution,
        }
    }

    pub fn instant(&self) -> NaiveDateTime {
        self.instant
    }

    pub fn resolution(&self) -> TResolution {
        self.resolution
    }

    pub fn with_resolution(self, resolution: TResolution) -> Self {
        Self {
            instant: self.instant,
            resolution,
        }
    }

    /// Shift this point by `times` steps of `step`.
    pub fn advance(&self, step: &TDuration, times: i64) -> Result<Self> {
        let instant = step
            .apply(self.instant, times)
            .ok_or_else(|| Error::Schema(format!("{self} + {times} * {step} is out of range")))?;

        Ok(Self::new(instant, self.resolution))
    }
}

impl PartialEq for TPoint {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant
    }
}

impl Eq for TPoint {}

impl PartialOrd for TPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant.cmp(&other.instant)
    }
}

impl Hash for TPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instant.hash(state);
    }
}

impl FromStr for TPoint {
    type Err = Error;

    /// Parse an ISO 8601 date or date-time.
    ///
    /// Accepted dates are `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, `YYYY-DDD` (ordinal) and
    /// `YYYY-Www[-D]` (ISO week). A time `Thh[:mm[:ss[.fff]]]` may follow, optionally with a `Z`
    /// or `±hh[:mm]` offset, which is normalized away to UTC.
    ///
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::parse("timestamp", s);
        let s = s.trim();
        let (date, time) = match s.split_once(&['T', ' '][..]) {
            Some((date, time)) => (date, Some(time)),
            None => (s, None),
        };

        let (date, mut resolution) = parse_date(date).ok_or_else(bad)?;
        let mut instant = date.and_time(NaiveTime::MIN);
        if let Some(time) = time {
            let (time, offset) = split_offset(time).ok_or_else(bad)?;
            let (time, time_resolution) = parse_time(time).ok_or_else(bad)?;
            instant = date.and_time(time) - offset;
            resolution = time_resolution;
        }

        Ok(Self::new(instant, resolution))
    }
}

impl fmt::Display for TPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = match self.resolution {
            TResolution::Year => "%Y",
            TResolution::Month => "%Y-%m",
            TResolution::Week => "%G-W%V",
            TResolution::Day => "%Y-%m-%d",
            TResolution::Hour => "%Y-%m-%dT%H",
            TResolution::Minute => "%Y-%m-%dT%H:%M",
            TResolution::Second | TResolution::None => "%Y-%m-%dT%H:%M:%S",
        };

        write!(f, "{}", self.instant.format(format))
    }
}

fn number<T: FromStr>(s: &str, digits: usize) -> Option<T> {
    if s.len() == digits && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

fn parse_date(s: &str) -> Option<(NaiveDate, TResolution)> {
    let mut parts = s.split('-');
    let year: i32 = number(parts.next()?, 4)?;
    let second = parts.next();
    let third = parts.next();
    if parts.next().is_some() {
        return None;
    }

    match (second, third) {
        (None, _) => Some((NaiveDate::from_ymd_opt(year, 1, 1)?, TResolution::Year)),
        (Some(week), day) if week.starts_with('W') => {
            let week: u32 = number(&week[1..], 2)?;
            match day {
                None => Some((
                    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?,
                    TResolution::Week,
                )),
                Some(day) => {
                    let day: u8 = number(day, 1)?;
                    let weekday = Weekday::try_from(day.checked_sub(1)?).ok()?;
                    Some((
                        NaiveDate::from_isoywd_opt(year, week, weekday)?,
                        TResolution::Day,
                    ))
                }
            }
        }
        (Some(ordinal), None) if ordinal.len() == 3 => Some((
            NaiveDate::from_yo_opt(year, number(ordinal, 3)?)?,
            TResolution::Day,
        )),
        (Some(month), None) => Some((
            NaiveDate::from_ymd_opt(year, number(month, 2)?, 1)?,
            TResolution::Month,
        )),
        (Some(month), Some(day)) => Some((
            NaiveDate::from_ymd_opt(year, number(month, 2)?, number(day, 2)?)?,
            TResolution::Day,
        )),
    }
}

/// Split a trailing UTC offset from a time of day.
fn split_offset(s: &str) -> Option<(&str, Duration)> {
    if let Some(time) = s.strip_suffix('Z') {
        return Some((time, Duration::zero()));
    }

    let at = match s.rfind(&['+', '-'][..]) {
        None => return Some((s, Duration::zero())),
        Some(at) => at,
    };
    let (time, offset) = s.split_at(at);
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let offset = offset[1..].replace(':', "");
    let (hours, minutes) = match offset.len() {
        2 => (number::<i64>(&offset, 2)?, 0),
        4 => (number::<i64>(&offset[..2], 2)?, number::<i64>(&offset[2..], 2)?),
        _ => return None,
    };

    Some((time, Duration::minutes(sign * (hours * 60 + minutes))))
}

fn parse_time(s: &str) -> Option<(NaiveTime, TResolution)> {
    let (s, fraction) = match s.split_once(&['.', ','][..]) {
        Some((s, fraction)) => (s, Some(fraction)),
        None => (s, None),
    };
    let parts: Vec<&str> = s.split(':').collect();
    let hour: u32 = number(parts.first()?, 2)?;
    let minute: u32 = parts.get(1).map_or(Some(0), |m| number(m, 2))?;
    let second: u32 = parts.get(2).map_or(Some(0), |s| number(s, 2))?;
    if parts.len() > 3 || (fraction.is_some() && parts.len() != 3) {
        return None;
    }

    let nanos = match fraction {
        None => 0,
        Some(fraction) if !fraction.is_empty() && fraction.len() <= 9 => {
            let digits: u32 = number(fraction, fraction.len())?;
            digits * 10u32.pow(9 - fraction.len() as u32)
        }
        Some(_) => return None,
    };
    let resolution = match parts.len() {
        1 => TResolution::Hour,
        2 => TResolution::Minute,
        _ => TResolution::Second,
    };

    Some((
        NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)?,
        resolution,
    ))
}

/// A step along a temporal axis, expressed as an ISO 8601 period such as `P1M`, `P16D` or
/// `PT30M`.
///
/// Calendar months (years are folded in) are kept apart from days and seconds, since their
/// length in seconds depends on where they are applied.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TDuration {
    months: i64,
    days: i64,
    seconds: i64,
}

impl TDuration {
    pub fn new(months: i64, days: i64, seconds: i64) -> Self {
        Self {
            months,
            days,
            seconds,
        }
    }

    pub fn months(&self) -> i64 {
        self.months
    }

    pub fn days(&self) -> i64 {
        self.days
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.days == 0 && self.seconds == 0
    }

    /// The finest non-zero unit of this step.
    pub fn resolution(&self) -> TResolution {
        if self.seconds != 0 {
            if self.seconds % 60 != 0 {
                TResolution::Second
            } else if self.seconds % 3600 != 0 {
                TResolution::Minute
            } else {
                TResolution::Hour
            }
        } else if self.days != 0 {
            if self.days % 7 == 0 {
                TResolution::Week
            } else {
                TResolution::Day
            }
        } else if self.months != 0 {
            if self.months % 12 == 0 {
                TResolution::Year
            } else {
                TResolution::Month
            }
        } else {
            TResolution::None
        }
    }

    /// Length in seconds, if this step doesn't involve calendar months.
    fn fixed_seconds(&self) -> Option<i64> {
        if self.months == 0 {
            Some(self.days * 86_400 + self.seconds)
        } else {
            None
        }
    }

    /// `instant + times * self`, applying the calendar part first.
    fn apply(&self, instant: NaiveDateTime, times: i64) -> Option<NaiveDateTime> {
        let months = self.months.checked_mul(times)?;
        let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
        let instant = if months >= 0 {
            instant.checked_add_months(magnitude)?
        } else {
            instant.checked_sub_months(magnitude)?
        };
        let days = Duration::try_days(self.days.checked_mul(times)?)?;
        let seconds = Duration::try_seconds(self.seconds.checked_mul(times)?)?;

        instant.checked_add_signed(days)?.checked_add_signed(seconds)
    }
}

impl FromStr for TDuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::parse("duration", s);
        let body = s.trim().strip_prefix('P').ok_or_else(bad)?;
        let mut duration = Self::default();
        let mut in_time = false;
        let mut digits = String::new();
        let mut components = 0;

        for c in body.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            if c == 'T' && digits.is_empty() && !in_time {
                in_time = true;
                continue;
            }

            let n: i64 = digits.parse().map_err(|_| bad())?;
            digits.clear();
            components += 1;
            match (in_time, c) {
                (false, 'Y') => duration.months += n * 12,
                (false, 'M') => duration.months += n,
                (false, 'W') => duration.days += n * 7,
                (false, 'D') => duration.days += n,
                (true, 'H') => duration.seconds += n * 3600,
                (true, 'M') => duration.seconds += n * 60,
                (true, 'S') => duration.seconds += n,
                _ => return Err(bad()),
            }
        }

        if !digits.is_empty() || components == 0 {
            return Err(bad());
        }

        Ok(duration)
    }
}

impl fmt::Display for TDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "PT0S");
        }

        write!(f, "P")?;
        let (years, months) = (self.months / 12, self.months % 12);
        if years != 0 {
            write!(f, "{years}Y")?;
        }
        if months != 0 {
            write!(f, "{months}M")?;
        }
        if self.days != 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.seconds != 0 {
            let (hours, rest) = (self.seconds / 3600, self.seconds % 3600);
            let (minutes, seconds) = (rest / 60, rest % 60);
            write!(f, "T")?;
            if hours != 0 {
                write!(f, "{hours}H")?;
            }
            if minutes != 0 {
                write!(f, "{minutes}M")?;
            }
            if seconds != 0 {
                write!(f, "{seconds}S")?;
            }
        }

        Ok(())
    }
}

/// A half-open range `[start, end)` of points in time.
///
/// An interval with `start == end` is empty and stands for an unresolved temporal extent.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TInterval {
    start: TPoint,
    end: TPoint,
}

impl TInterval {
    pub fn new(start: TPoint, end: TPoint) -> Result<Self> {
        if end < start {
            return Err(Error::Schema(format!(
                "interval ends ({end}) before it starts ({start})"
            )));
        }

        Ok(Self { start, end })
    }

    pub fn start(&self) -> TPoint {
        self.start
    }

    pub fn end(&self) -> TPoint {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, point: &TPoint) -> bool {
        self.start <= *point && *point < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end.instant - self.start.instant
    }
}

impl fmt::Display for TInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start, self.end)
    }
}

impl FromStr for TInterval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('/')
            .ok_or_else(|| Error::parse("interval", s))?;

        Self::new(start.parse()?, end.parse()?)
    }
}

/// Binds a temporal axis to a starting point `t0` and a step `dt`, the length of one index
/// unit along the axis.
///
/// Index `i` stands for the cell `[t0 + i * dt, t0 + (i + 1) * dt)`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TReference {
    t0: TPoint,
    dt: TDuration,
}

impl TReference {
    pub fn new(t0: TPoint, dt: TDuration) -> Result<Self> {
        if dt.is_zero() || dt.months < 0 || dt.days < 0 || dt.seconds < 0 {
            return Err(Error::Schema(format!(
                "temporal step must be positive, got {dt}"
            )));
        }

        Ok(Self { t0, dt })
    }

    pub fn t0(&self) -> TPoint {
        self.t0
    }

    pub fn dt(&self) -> TDuration {
        self.dt
    }

    /// The start of the cell at `index`.
    pub fn point_at(&self, index: i64) -> Result<TPoint> {
        Ok(self
            .t0
            .advance(&self.dt, index)?
            .with_resolution(self.dt.resolution()))
    }

    /// The cell at `index`.
    pub fn interval_at(&self, index: i64) -> Result<TInterval> {
        TInterval::new(self.point_at(index)?, self.point_at(index + 1)?)
    }

    /// The index of the cell containing `point`.
    ///
    /// Points before `t0` get negative indexes.
    ///
    pub fn index_of(&self, point: &TPoint) -> Result<i64> {
        let mut index = self.estimate(point);
        while self.point_at(index)? > *point {
            index -= 1;
        }
        while self.point_at(index + 1)? <= *point {
            index += 1;
        }

        Ok(index)
    }

    /// The range of indexes whose cells intersect `interval`.
    pub fn index_range(&self, interval: &TInterval) -> Result<Range<i64>> {
        let start = self.index_of(&interval.start())?;
        if interval.is_empty() {
            return Ok(start..start);
        }

        let last = self.index_of(&interval.end())?;
        let end = if self.point_at(last)? == interval.end() {
            last
        } else {
            last + 1
        };

        Ok(start..end)
    }

    /// Start points of the cells `start..stop`.
    pub fn slice(&self, start: i64, stop: i64) -> Result<Array1<TPoint>> {
        let points = (start..stop)
            .map(|i| self.point_at(i))
            .collect::<Result<Vec<_>>>()?;

        Ok(Array1::from_vec(points))
    }

    /// First guess at the index of `point`, exact for pure calendar or pure fixed-length steps.
    fn estimate(&self, point: &TPoint) -> i64 {
        let t0 = self.t0.instant;
        let t = point.instant;
        match self.dt.fixed_seconds() {
            Some(step) => (t - t0).num_seconds().div_euclid(step),
            None if self.dt.days == 0 && self.dt.seconds == 0 => {
                let months = (t.year() as i64 - t0.year() as i64) * 12 + t.month() as i64
                    - t0.month() as i64;
                months.div_euclid(self.dt.months)
            }
            None => {
                let step =
                    self.dt.months * AVERAGE_MONTH_SECONDS + self.dt.days * 86_400 + self.dt.seconds;
                (t - t0).num_seconds().div_euclid(step)
            }
        }
    }
}
