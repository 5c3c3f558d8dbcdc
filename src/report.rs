/// Latest-observation reporting.
///
/// Compares a freshly fetched feed against the newest stored observation,
/// describes the newest fetched observation in a short paragraph (height
/// in feet, dominant period, how it ranks against history for the month
/// and the calendar day, and when that height was last seen), then writes
/// only the observations the table does not have yet.
///
/// The paragraph is computed before the write, so its statistics reflect
/// history up to the previous run. Statistics are keyed by the stored UTC
/// month and day; times and labels in the paragraph are shown in the
/// configured local zone.

use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::model::{FEET_PER_METER, RetainedObservation, StatsError, StoreError};
use crate::store::Store;
use crate::store::batch::Sleeper;
use crate::store::paginate::PercentileRank;
use crate::table::{BuoyTable, StoredObservation, WriteSummary};

/// Everything the summary paragraph says about one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub observation: RetainedObservation,
    pub month_rank: Option<PercentileRank>,
    pub month_day_rank: Option<PercentileRank>,
    pub last_occurrence: Option<StoredObservation>,
    /// Zone the paragraph is rendered in.
    pub zone: Tz,
}

fn feet(meters: f64) -> f64 {
    meters * FEET_PER_METER
}

/// UTC calendar fields shown in `zone`. `None` for impossible dates.
fn local_time(zone: Tz, year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    let utc = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&utc).with_timezone(&zone))
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let obs = &self.observation;
        let Some(at) = local_time(self.zone, obs.year, obs.month, obs.day, obs.hour, obs.minute) else {
            return write!(f, "Observation {} has an invalid date.", obs.time_key());
        };

        write!(
            f,
            "At {}, wave height was reported at {:.1} ft",
            at.format("%-I:%M %p"),
            feet(obs.wave_height)
        )?;
        match obs.dominant_period {
            Some(period) => write!(f, " with a period of {} seconds. ", period as i64)?,
            None => write!(f, " with no reported period. ")?,
        }

        if let (Some(month), Some(month_day)) = (&self.month_rank, &self.month_day_rank) {
            write!(
                f,
                "The wave height exceeds {} percent of historical records for {} and {} percent for {}. ",
                month.percentile,
                at.format("%B"),
                month_day.percentile,
                at.format("%B %-d")
            )?;
        }

        match &self.last_occurrence {
            Some(last) => match local_time(self.zone, last.year, last.month, last.day, last.hour, last.minute) {
                Some(then) => write!(
                    f,
                    "The last observation at that height was {:.1} ft at {} on {}.",
                    feet(last.wave_height),
                    then.format("%-I:%M %p"),
                    then.format("%B %-d, %Y")
                ),
                None => write!(
                    f,
                    "The last observation at that height was {:.1} ft.",
                    feet(last.wave_height)
                ),
            },
            None => write!(f, "No earlier observation at that height is on record."),
        }
    }
}

/// Percentile ranks are `None` when the table has no history for the
/// month or day yet; store failures propagate.
fn rank_or_none(result: Result<PercentileRank, StatsError>, what: &str) -> Result<Option<PercentileRank>, StoreError> {
    match result {
        Ok(rank) => Ok(Some(rank)),
        Err(StatsError::EmptyPopulation) => {
            warn!("no history for {}, skipping percentile", what);
            Ok(None)
        }
        Err(StatsError::Store(e)) => Err(e),
    }
}

/// Gathers the statistics for `observation` from the table.
pub fn summarize<S: Store, Z: Sleeper>(
    table: &mut BuoyTable<S, Z>,
    observation: &RetainedObservation,
    zone: Tz,
) -> Result<Summary, StoreError> {
    let month_rank = rank_or_none(
        table.query_month_percentile(observation.month, observation.wave_height),
        &format!("month {}", observation.month),
    )?;
    let month_day_rank = rank_or_none(
        table.query_month_day_percentile(observation.day_key(), observation.wave_height),
        &format!("month-day {}", observation.day_key()),
    )?;
    let last_occurrence = table.find_last_occurrence_of(observation.wave_height)?;
    Ok(Summary {
        observation: observation.clone(),
        month_rank,
        month_day_rank,
        last_occurrence,
        zone,
    })
}

/// Observations strictly newer than `latest`, in feed order. Everything is
/// new when the table is empty.
pub fn new_since(
    records: &[RetainedObservation],
    latest: Option<&StoredObservation>,
) -> Vec<RetainedObservation> {
    match latest {
        None => records.to_vec(),
        Some(latest) => records
            .iter()
            .filter(|r| r.time_key() > latest.sort_key.as_str())
            .cloned()
            .collect(),
    }
}

/// Newest observation by time key; ties go to the first.
pub fn newest(records: &[RetainedObservation]) -> Option<&RetainedObservation> {
    records
        .iter()
        .reduce(|best, r| if r.time_key() > best.time_key() { r } else { best })
}

/// Outcome of one `run_latest` pass.
#[derive(Debug, Clone, PartialEq)]
pub enum LatestOutcome {
    /// The feed had nothing newer than the table.
    UpToDate,
    Written {
        summary: Summary,
        new_records: usize,
        written: WriteSummary,
    },
}

/// Summarizes the newest fetched observation and writes everything newer
/// than the table's latest item.
pub fn run_latest<S: Store, Z: Sleeper>(
    table: &mut BuoyTable<S, Z>,
    records: &[RetainedObservation],
    zone: Tz,
) -> Result<LatestOutcome, StoreError> {
    let latest = table.find_latest()?;
    match &latest {
        Some(l) => info!("queried latest from store, time is {}", l.sort_key),
        None => info!("no stored observations for buoy {}", table.buoy()),
    }

    let Some(fetched_latest) = newest(records) else {
        info!("feed returned no usable observations, exiting");
        return Ok(LatestOutcome::UpToDate);
    };
    info!(
        "fetched {} buoy observations, latest record time is {}",
        records.len(),
        fetched_latest.time_key()
    );

    let difference = new_since(records, latest.as_ref());
    if difference.is_empty() {
        info!("no new buoy observations, exiting");
        return Ok(LatestOutcome::UpToDate);
    }

    let summary = summarize(table, fetched_latest, zone)?;
    info!("{}", summary);

    let written = table.write_conditional(&difference)?;
    Ok(LatestOutcome::Written {
        summary,
        new_records: difference.len(),
        written,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;
    use chrono_tz::UTC;

    use crate::model::ObservationKeys;
    use crate::store::memory::MemoryStore;

    fn record(year: i32, month: u32, day: u32, hour: u32, wave_height: f64) -> RetainedObservation {
        RetainedObservation {
            year,
            month,
            day,
            hour,
            minute: 50,
            wave_height,
            wave_direction: Some(280.0),
            dominant_period: Some(12.5),
            average_period: Some(7.1),
            keys: ObservationKeys::derive(year, month, day, hour, 50).unwrap(),
        }
    }

    fn stored(year: i32, month: u32, day: u32, hour: u32, minute: u32, wave_height: f64) -> StoredObservation {
        StoredObservation {
            partition_key: "46013".to_string(),
            sort_key: format!("{:04}{:02}{:02}{:02}", year, month, day, hour),
            year,
            month,
            day,
            hour,
            minute,
            period_key: format!("{:04}{:02}", year, month),
            day_key: format!("{:02}{:02}", month, day),
            wave_height,
            wave_direction: None,
            dominant_period: None,
            average_period: None,
        }
    }

    #[test]
    fn test_paragraph_wording() {
        let summary = Summary {
            observation: record(2024, 1, 5, 15, 2.1),
            month_rank: Some(PercentileRank { percentile: 81, count: 81, total: 100 }),
            month_day_rank: Some(PercentileRank { percentile: 90, count: 9, total: 10 }),
            last_occurrence: Some(stored(2023, 12, 4, 3, 20, 2.3)),
            zone: UTC,
        };
        assert_eq!(
            summary.to_string(),
            "At 3:50 PM, wave height was reported at 6.9 ft with a period of 12 seconds. \
             The wave height exceeds 81 percent of historical records for January and 90 percent for January 5. \
             The last observation at that height was 7.5 ft at 3:20 AM on December 4, 2023."
        );
    }

    #[test]
    fn test_paragraph_uses_local_time_and_labels() {
        // 02:50 UTC on Feb 1 is still January 31 in Pacific time.
        let summary = Summary {
            observation: record(2024, 2, 1, 2, 2.1),
            month_rank: Some(PercentileRank { percentile: 40, count: 4, total: 10 }),
            month_day_rank: Some(PercentileRank { percentile: 50, count: 1, total: 2 }),
            last_occurrence: Some(stored(2023, 7, 4, 6, 20, 2.3)),
            zone: Los_Angeles,
        };
        assert_eq!(
            summary.to_string(),
            "At 6:50 PM, wave height was reported at 6.9 ft with a period of 12 seconds. \
             The wave height exceeds 40 percent of historical records for January and 50 percent for January 31. \
             The last observation at that height was 7.5 ft at 11:20 PM on July 3, 2023."
        );
    }

    #[test]
    fn test_paragraph_without_history() {
        let mut obs = record(2024, 1, 5, 15, 2.1);
        obs.dominant_period = None;
        let summary = Summary {
            observation: obs,
            month_rank: None,
            month_day_rank: None,
            last_occurrence: None,
            zone: UTC,
        };
        assert_eq!(
            summary.to_string(),
            "At 3:50 PM, wave height was reported at 6.9 ft with no reported period. \
             No earlier observation at that height is on record."
        );
    }

    #[test]
    fn test_new_since_is_strictly_newer() {
        let records = vec![record(2024, 1, 5, 14, 1.0), record(2024, 1, 5, 15, 1.0), record(2024, 1, 5, 16, 1.0)];
        let mut table = BuoyTable::new(MemoryStore::new(), "46013");
        table.write(&records[..2]).unwrap();
        let latest = table.find_latest().unwrap();

        let new = new_since(&records, latest.as_ref());
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].time_key(), "2024010516");

        assert_eq!(new_since(&records, None).len(), 3);
    }

    #[test]
    fn test_newest_prefers_first_on_tie() {
        let mut a = record(2024, 1, 5, 16, 1.0);
        a.minute = 0;
        let b = record(2024, 1, 5, 16, 2.0);
        let records = vec![record(2024, 1, 5, 14, 1.0), a, b];
        assert_eq!(newest(&records).unwrap().wave_height, 1.0);
        assert!(newest(&[]).is_none());
    }

    #[test]
    fn test_run_latest_on_empty_table_writes_everything() {
        let mut table = BuoyTable::new(MemoryStore::new(), "46013");
        let records = vec![record(2024, 1, 5, 14, 1.0), record(2024, 1, 5, 15, 2.0)];

        let outcome = run_latest(&mut table, &records, UTC).unwrap();
        let LatestOutcome::Written { summary, new_records, written } = outcome else {
            panic!("expected a write");
        };
        assert_eq!(new_records, 2);
        assert_eq!(written.items_written, 2);
        assert_eq!(written.index_written, 1);
        assert!(summary.month_rank.is_none());
        assert!(summary.last_occurrence.is_none());
        assert_eq!(summary.observation.time_key(), "2024010515");
    }

    #[test]
    fn test_run_latest_is_up_to_date_on_repeat() {
        let mut table = BuoyTable::new(MemoryStore::new(), "46013");
        let records = vec![record(2024, 1, 5, 14, 1.0), record(2024, 1, 5, 15, 2.0)];
        run_latest(&mut table, &records, UTC).unwrap();
        assert_eq!(run_latest(&mut table, &records, UTC).unwrap(), LatestOutcome::UpToDate);
        assert_eq!(run_latest(&mut table, &[], UTC).unwrap(), LatestOutcome::UpToDate);
    }

    #[test]
    fn test_run_latest_ranks_against_prior_history() {
        let mut table = BuoyTable::new(MemoryStore::new(), "46013");
        table
            .write(&[record(2023, 1, 5, 0, 1.0), record(2023, 1, 6, 0, 3.0), record(2023, 2, 5, 0, 2.5)])
            .unwrap();

        let outcome = run_latest(&mut table, &[record(2024, 1, 5, 15, 2.0)], UTC).unwrap();
        let LatestOutcome::Written { summary, .. } = outcome else {
            panic!("expected a write");
        };
        let month = summary.month_rank.unwrap();
        assert_eq!((month.percentile, month.count, month.total), (50, 1, 2));
        assert_eq!(summary.month_day_rank.unwrap().percentile, 100);
        assert_eq!(summary.last_occurrence.unwrap().sort_key, "2023020500");
    }
}
