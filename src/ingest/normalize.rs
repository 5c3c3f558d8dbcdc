/// Normalization and de-duplication of parsed observations.
///
/// NDBC files often report several readings inside the same hour, and the
/// store keys observations by hour. `normalize` keeps one observation per
/// hour, preferring the one that carries period and direction data, and
/// tags every other candidate with the reason it was dropped.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::model::{Observation, ObservationKeys, RejectionReason, RetainedObservation};

/// Tags each candidate in place with derived keys or a rejection reason.
///
/// Rules, applied in input order:
/// - any missing calendar field, or fields that do not form a real date,
///   is `BadDate` and gets no keys;
/// - a missing wave height is `NoWaveHeight`;
/// - among candidates sharing a `time_key`, a later candidate replaces the
///   current best only if it has some optional field the best lacks. The
///   loser of each comparison is tagged `DuplicateTime`.
pub fn normalize(records: &mut [Observation]) {
    // time_key -> position of the best candidate seen so far
    let mut best: HashMap<String, usize> = HashMap::new();

    for n in 0..records.len() {
        let record = &mut records[n];
        let keys = match (record.year, record.month, record.day, record.hour, record.minute) {
            (Some(y), Some(mo), Some(d), Some(h), Some(mi)) => ObservationKeys::derive(y, mo, d, h, mi),
            _ => None,
        };
        let Some(keys) = keys else {
            record.rejection = Some(RejectionReason::BadDate);
            continue;
        };
        let time_key = keys.time_key.clone();
        record.keys = Some(keys);

        if record.wave_height.is_none() {
            record.rejection = Some(RejectionReason::NoWaveHeight);
            continue;
        }

        match best.get(&time_key).copied() {
            None => {
                best.insert(time_key, n);
            }
            Some(prior) => {
                if records[n].has_more_info_than(&records[prior]) {
                    records[prior].rejection = Some(RejectionReason::DuplicateTime);
                    best.insert(time_key, n);
                } else {
                    records[n].rejection = Some(RejectionReason::DuplicateTime);
                }
            }
        }
    }
}

/// Drops rejected candidates, preserving input order, and logs the
/// retention count.
pub fn filter_retained(records: Vec<Observation>) -> Vec<RetainedObservation> {
    let total = records.len();
    let retained: Vec<RetainedObservation> = records
        .into_iter()
        .enumerate()
        .filter_map(|(n, record)| {
            debug!("record {}: {:?}", n + 1, record);
            RetainedObservation::try_from(record).ok()
        })
        .collect();
    info!("{} of {} records retained", retained.len(), total);
    retained
}

/// Parses, normalizes and filters a raw feed in one step.
pub fn parse_normalize_filter(data: &str) -> Vec<RetainedObservation> {
    let mut records = super::parse::parse_feed(data);
    normalize(&mut records);
    filter_retained(records)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
