/// NDBC standard meteorological text parser.
///
/// The feed is a whitespace-separated table. The first line names the
/// columns; when it begins with `#` a second line of units follows and is
/// skipped. Column positions are resolved from the header, so files with
/// extra, missing or reordered columns parse the same way.
///
/// Every value is parsed permissively: a token that is missing, not a
/// number, or outside the column's valid range (NDBC writes `99.00`, `999`
/// and `MM` for missing data) becomes `None` for that field only. A bad
/// token never aborts the rest of the row or the feed.

use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::model::Observation;

// ---------------------------------------------------------------------------
// Column names and valid ranges
// ---------------------------------------------------------------------------

pub const COL_YEAR_SHORT: &str = "YY";
pub const COL_YEAR_LONG: &str = "YYYY";
pub const COL_YEAR_LONG_COMMENTED: &str = "#YY";
pub const COL_MONTH: &str = "MM";
pub const COL_DAY: &str = "DD";
pub const COL_HOUR: &str = "hh";
pub const COL_MINUTE: &str = "mm";
pub const COL_WAVE_HEIGHT: &str = "WVHT";
pub const COL_WAVE_DIRECTION: &str = "MWD";
pub const COL_DOMINANT_PERIOD: &str = "DPD";
pub const COL_AVERAGE_PERIOD: &str = "APD";

const RANGE_YEAR_SHORT: RangeInclusive<i32> = 70..=98;
const RANGE_YEAR_LONG: RangeInclusive<i32> = 1970..=2070;
const RANGE_MONTH: RangeInclusive<u32> = 1..=12;
const RANGE_DAY: RangeInclusive<u32> = 1..=31;
const RANGE_HOUR: RangeInclusive<u32> = 0..=23;
const RANGE_MINUTE: RangeInclusive<u32> = 0..=59;
const RANGE_WAVE_HEIGHT: RangeInclusive<f64> = 0.0..=98.0;
const RANGE_DIRECTION: RangeInclusive<f64> = 0.0..=360.0;
const RANGE_PERIOD: RangeInclusive<f64> = 0.0..=98.0;

/// Positional index of each recognized column, `None` if the header lacks it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnLayout {
    pub year_short: Option<usize>,
    pub year_long: Option<usize>,
    pub year_long_commented: Option<usize>,
    pub month: Option<usize>,
    pub day: Option<usize>,
    pub hour: Option<usize>,
    pub minute: Option<usize>,
    pub wave_height: Option<usize>,
    pub wave_direction: Option<usize>,
    pub dominant_period: Option<usize>,
    pub average_period: Option<usize>,
}

impl ColumnLayout {
    /// Resolves column positions from a header line. Matching is
    /// case-sensitive: `MM` is the month, `mm` the minute.
    pub fn from_header(header: &str) -> Self {
        let headers: Vec<&str> = header.split_whitespace().collect();
        let index_of = |name: &str| headers.iter().position(|h| *h == name);
        ColumnLayout {
            year_short: index_of(COL_YEAR_SHORT),
            year_long: index_of(COL_YEAR_LONG),
            year_long_commented: index_of(COL_YEAR_LONG_COMMENTED),
            month: index_of(COL_MONTH),
            day: index_of(COL_DAY),
            hour: index_of(COL_HOUR),
            minute: index_of(COL_MINUTE),
            wave_height: index_of(COL_WAVE_HEIGHT),
            wave_direction: index_of(COL_WAVE_DIRECTION),
            dominant_period: index_of(COL_DOMINANT_PERIOD),
            average_period: index_of(COL_AVERAGE_PERIOD),
        }
    }

    /// Parses one data row against this layout.
    pub fn parse_row(&self, line: &str) -> Observation {
        let words: Vec<&str> = line.split_whitespace().collect();

        let year_short = parse_in_range(&words, self.year_short, &RANGE_YEAR_SHORT);
        let year_long = parse_in_range(&words, self.year_long, &RANGE_YEAR_LONG);
        let year_long_commented =
            parse_in_range(&words, self.year_long_commented, &RANGE_YEAR_LONG);
        let year = year_short
            .map(|y| y + 1900)
            .or(year_long)
            .or(year_long_commented);

        Observation {
            year,
            month: parse_in_range(&words, self.month, &RANGE_MONTH),
            day: parse_in_range(&words, self.day, &RANGE_DAY),
            hour: parse_in_range(&words, self.hour, &RANGE_HOUR),
            // Older files have no minute column; those readings are on the hour.
            minute: Some(parse_in_range(&words, self.minute, &RANGE_MINUTE).unwrap_or(0)),
            wave_height: parse_in_range(&words, self.wave_height, &RANGE_WAVE_HEIGHT),
            wave_direction: parse_in_range(&words, self.wave_direction, &RANGE_DIRECTION),
            dominant_period: parse_in_range(&words, self.dominant_period, &RANGE_PERIOD),
            average_period: parse_in_range(&words, self.average_period, &RANGE_PERIOD),
            keys: None,
            rejection: None,
        }
    }
}

/// Parses the token at `index`, keeping it only if it lies within `range`.
fn parse_in_range<T>(words: &[&str], index: Option<usize>, range: &RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    let token = words.get(index?)?;
    let value = token.parse::<T>().ok()?;
    range.contains(&value).then_some(value)
}

// ---------------------------------------------------------------------------
// Feed parsing
// ---------------------------------------------------------------------------

/// Parses a complete feed into candidate observations, one per data row,
/// in input order. Text with no header line yields no candidates.
pub fn parse_feed(data: &str) -> Vec<Observation> {
    let mut lines = data.lines();

    let Some(header) = lines.next() else {
        return Vec::new();
    };
    if header.starts_with('#') {
        lines.next(); // units line
    }

    let layout = ColumnLayout::from_header(header);
    lines.map(|line| layout.parse_row(line)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
