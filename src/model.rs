/// Core data types for the buoy observation service.
///
/// This module defines the shared domain model imported by all other modules:
/// the `Observation` record that flows from the feed parser through the
/// normalizer into the store, the rejection reasons attached along the way,
/// and the error types raised by the feed and store layers.

use chrono::NaiveDate;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Unit conversion
// ---------------------------------------------------------------------------

pub const FEET_PER_METER: f64 = 3.28084;

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Why a candidate observation was excluded from persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// One of the calendar fields is missing or does not form a real date.
    BadDate,
    /// The row carried no usable wave height.
    NoWaveHeight,
    /// Another observation for the same hour carried more information.
    DuplicateTime,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::BadDate => "bad_date",
            RejectionReason::NoWaveHeight => "no_wave_height",
            RejectionReason::DuplicateTime => "duplicate_time",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys derived from a complete UTC date, used to address stored items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationKeys {
    /// `YYYYMMDDHH`, the sort key of a stored item.
    pub time_key: String,
    /// `YYYYMM`, the sort key of a period index item.
    pub period_key: String,
    /// `MMDD`, used by the month-day statistics index.
    pub day_key: String,
}

impl ObservationKeys {
    /// Derives the keys for a date, or `None` when the fields do not form
    /// a valid calendar date and time.
    pub fn derive(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<Self> {
        let timestamp = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
        Some(ObservationKeys {
            time_key: timestamp.format("%Y%m%d%H").to_string(),
            period_key: timestamp.format("%Y%m").to_string(),
            day_key: timestamp.format("%m%d").to_string(),
        })
    }
}

/// One timestamped buoy measurement.
///
/// Candidates come straight out of `ingest::parse` with every field
/// independently optional. `ingest::normalize` fills in `keys` and tags
/// `rejection`; only observations without a rejection reach the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub wave_height: Option<f64>,    // meters
    pub wave_direction: Option<f64>, // degrees true
    pub dominant_period: Option<f64>, // seconds
    pub average_period: Option<f64>,  // seconds
    pub keys: Option<ObservationKeys>,
    pub rejection: Option<RejectionReason>,
}

impl Observation {
    /// True when this observation has any of the optional measurements
    /// that `other` lacks.
    pub fn has_more_info_than(&self, other: &Observation) -> bool {
        (self.dominant_period.is_some() && other.dominant_period.is_none())
            || (self.average_period.is_some() && other.average_period.is_none())
            || (self.wave_direction.is_some() && other.wave_direction.is_none())
    }

    pub fn is_retained(&self) -> bool {
        self.rejection.is_none()
    }

    pub fn time_key(&self) -> Option<&str> {
        self.keys.as_ref().map(|k| k.time_key.as_str())
    }

    pub fn period_key(&self) -> Option<&str> {
        self.keys.as_ref().map(|k| k.period_key.as_str())
    }

    pub fn day_key(&self) -> Option<&str> {
        self.keys.as_ref().map(|k| k.day_key.as_str())
    }
}

/// An observation that passed normalization: every calendar field, the
/// wave height and the derived keys are present.
///
/// Conversion from `Observation` is the single place where the
/// "retained implies complete" invariant is checked.
#[derive(Debug, Clone, PartialEq)]
pub struct RetainedObservation {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub wave_height: f64,
    pub wave_direction: Option<f64>,
    pub dominant_period: Option<f64>,
    pub average_period: Option<f64>,
    pub keys: ObservationKeys,
}

impl TryFrom<Observation> for RetainedObservation {
    type Error = RejectionReason;

    fn try_from(obs: Observation) -> Result<Self, Self::Error> {
        if let Some(reason) = obs.rejection {
            return Err(reason);
        }
        let (Some(year), Some(month), Some(day), Some(hour), Some(minute), Some(keys)) =
            (obs.year, obs.month, obs.day, obs.hour, obs.minute, obs.keys)
        else {
            return Err(RejectionReason::BadDate);
        };
        let wave_height = obs.wave_height.ok_or(RejectionReason::NoWaveHeight)?;
        Ok(RetainedObservation {
            year,
            month,
            day,
            hour,
            minute,
            wave_height,
            wave_direction: obs.wave_direction,
            dominant_period: obs.dominant_period,
            average_period: obs.average_period,
            keys,
        })
    }
}

impl RetainedObservation {
    pub fn time_key(&self) -> &str {
        &self.keys.time_key
    }

    pub fn period_key(&self) -> &str {
        &self.keys.period_key
    }

    pub fn day_key(&self) -> &str {
        &self.keys.day_key
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// NDBC station identifiers are five alphanumeric characters, e.g. "46013".
pub fn is_valid_buoy_id(id: &str) -> bool {
    id.len() == 5 && id.chars().all(|c| c.is_ascii_alphanumeric())
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while fetching the NDBC text feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Non-2xx HTTP response from NDBC.
    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },
    /// The request could not be sent or the body could not be read.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors raised by a `store::Store` implementation or the layers over it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional put found an item that does not satisfy the condition.
    #[error("conditional check failed for {partition_key}/{sort_key}")]
    ConditionFailed {
        partition_key: String,
        sort_key: String,
    },
    #[error("postgres error: {0}")]
    Backend(#[from] postgres::Error),
    #[error("item serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored item lacks an attribute the caller needs, or holds a
    /// value of the wrong shape.
    #[error("malformed item: {0}")]
    MalformedItem(String),
    /// The backend cannot express the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// The batch writer hit its configured retry ceiling.
    #[error("gave up after {attempts} attempts with {unprocessed} unprocessed items")]
    GaveUp { attempts: u32, unprocessed: usize },
}

/// Errors raised by percentile computations.
#[derive(Debug, Error)]
pub enum StatsError {
    /// No values matched the query, so the percentile is undefined.
    #[error("percentile is undefined for an empty population")]
    EmptyPopulation,
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_zero_padded() {
        let keys = ObservationKeys::derive(1981, 3, 7, 5, 50).unwrap();
        assert_eq!(keys.time_key, "1981030705");
        assert_eq!(keys.period_key, "198103");
        assert_eq!(keys.day_key, "0307");
    }

    #[test]
    fn test_keys_reject_impossible_dates() {
        assert!(ObservationKeys::derive(2021, 2, 30, 0, 0).is_none());
        assert!(ObservationKeys::derive(2021, 4, 31, 0, 0).is_none());
        assert!(ObservationKeys::derive(2020, 2, 29, 0, 0).is_some());
    }

    #[test]
    fn test_more_info_is_any_field_the_other_lacks() {
        let sparse = Observation {
            wave_direction: Some(270.0),
            ..Default::default()
        };
        let other = Observation {
            dominant_period: Some(12.0),
            ..Default::default()
        };
        // Each has something the other lacks.
        assert!(sparse.has_more_info_than(&other));
        assert!(other.has_more_info_than(&sparse));
        assert!(!sparse.has_more_info_than(&sparse));
    }

    #[test]
    fn test_retained_conversion_requires_complete_record() {
        let mut obs = Observation {
            year: Some(2020),
            month: Some(1),
            day: Some(2),
            hour: Some(3),
            minute: Some(0),
            wave_height: Some(1.5),
            keys: ObservationKeys::derive(2020, 1, 2, 3, 0),
            ..Default::default()
        };
        let retained = RetainedObservation::try_from(obs.clone()).unwrap();
        assert_eq!(retained.time_key(), "2020010203");

        obs.rejection = Some(RejectionReason::DuplicateTime);
        assert_eq!(
            RetainedObservation::try_from(obs).unwrap_err(),
            RejectionReason::DuplicateTime
        );
    }

    #[test]
    fn test_buoy_id_format() {
        assert!(is_valid_buoy_id("46013"));
        assert!(is_valid_buoy_id("41a01"));
        assert!(!is_valid_buoy_id("4601"));
        assert!(!is_valid_buoy_id("46013/period-index"));
    }
}
