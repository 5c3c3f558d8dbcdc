/// The buoy observation table.
///
/// `BuoyTable` maps retained observations onto store items and back, and
/// implements the reads the reporting side needs. One physical table holds
/// two kinds of items:
///
/// - observation items, partition = buoy id, sort = `YYYYMMDDHH`;
/// - period index items, partition = buoy id + index suffix, sort = `YYYYMM`,
///   each a copy of the observation with the highest wave height seen in
///   that month.
///
/// The index lets "when was it last this big" be answered by scanning one
/// item per month instead of every observation.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::model::{RetainedObservation, StatsError, StoreError};
use crate::store::batch::{BatchWriter, Sleeper, ThreadSleeper};
use crate::store::paginate::{self, PercentileRank};
use crate::store::{
    AttributeValue, Condition, Cursor, Item, Query, Store, ATTR_ID, ATTR_MONTH, ATTR_MONTH_DAY,
    ATTR_TIME, ATTR_WAVE_HEIGHT,
};

pub const DEFAULT_INDEX_SUFFIX: &str = "/period-index";

pub const ATTR_YEAR: &str = "year";
pub const ATTR_DAY: &str = "day";
pub const ATTR_HOUR: &str = "hour";
pub const ATTR_MINUTE: &str = "minute";
pub const ATTR_YEAR_MONTH: &str = "yearmonth";
pub const ATTR_WAVE_DIRECTION: &str = "wavedir";
pub const ATTR_DOMINANT_PERIOD: &str = "domperiod";
pub const ATTR_AVERAGE_PERIOD: &str = "avgperiod";

// ---------------------------------------------------------------------------
// Stored observations
// ---------------------------------------------------------------------------

/// An observation read back from the table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObservation {
    /// Partition key the item was read from.
    pub partition_key: String,
    /// `YYYYMMDDHH` for observation items, `YYYYMM` for index items.
    pub sort_key: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub period_key: String,
    pub day_key: String,
    pub wave_height: f64,
    pub wave_direction: Option<f64>,
    pub dominant_period: Option<f64>,
    pub average_period: Option<f64>,
}

impl StoredObservation {
    pub fn from_item(item: &Item) -> Result<Self, StoreError> {
        Ok(StoredObservation {
            partition_key: item.partition_key()?.to_string(),
            sort_key: item.sort_key()?.to_string(),
            year: item.require_f64(ATTR_YEAR)? as i32,
            month: item.require_f64(ATTR_MONTH)? as u32,
            day: item.require_f64(ATTR_DAY)? as u32,
            hour: item.require_f64(ATTR_HOUR)? as u32,
            minute: item.require_f64(ATTR_MINUTE)? as u32,
            period_key: item.require_str(ATTR_YEAR_MONTH)?.to_string(),
            day_key: item.require_str(ATTR_MONTH_DAY)?.to_string(),
            wave_height: item.require_f64(ATTR_WAVE_HEIGHT)?,
            wave_direction: item.optional_f64(ATTR_WAVE_DIRECTION),
            dominant_period: item.optional_f64(ATTR_DOMINANT_PERIOD),
            average_period: item.optional_f64(ATTR_AVERAGE_PERIOD),
        })
    }

    /// `YYYYMMDDHH` of the observation, also for index items.
    pub fn time_key(&self) -> String {
        format!(
            "{:04}{:02}{:02}{:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}

/// Counts reported by the write operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub items_written: usize,
    pub index_written: usize,
    /// Index candidates that lost to an equal or higher stored value.
    pub index_skipped: usize,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

pub struct BuoyTable<S: Store, Z: Sleeper = ThreadSleeper> {
    store: S,
    buoy: String,
    index_partition: String,
    writer: BatchWriter<Z>,
}

impl<S: Store> BuoyTable<S, ThreadSleeper> {
    pub fn new(store: S, buoy: &str) -> Self {
        BuoyTable::with_writer(store, buoy, DEFAULT_INDEX_SUFFIX, BatchWriter::default())
    }
}

impl<S: Store, Z: Sleeper> BuoyTable<S, Z> {
    pub fn with_writer(store: S, buoy: &str, index_suffix: &str, writer: BatchWriter<Z>) -> Self {
        BuoyTable {
            store,
            buoy: buoy.to_string(),
            index_partition: format!("{}{}", buoy, index_suffix),
            writer,
        }
    }

    pub fn buoy(&self) -> &str {
        &self.buoy
    }

    pub fn index_partition(&self) -> &str {
        &self.index_partition
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    // -----------------------------------------------------------------------
    // Conversion
    // -----------------------------------------------------------------------

    /// Observation item; optional measurements are omitted when absent.
    pub fn to_item(&self, record: &RetainedObservation) -> Item {
        let mut item = Item::new(&self.buoy, record.time_key());
        item.set(ATTR_YEAR, AttributeValue::number(record.year));
        item.set(ATTR_MONTH, AttributeValue::number(record.month));
        item.set(ATTR_DAY, AttributeValue::number(record.day));
        item.set(ATTR_HOUR, AttributeValue::number(record.hour));
        item.set(ATTR_MINUTE, AttributeValue::number(record.minute));
        item.set(ATTR_MONTH_DAY, AttributeValue::string(record.day_key()));
        item.set(ATTR_YEAR_MONTH, AttributeValue::string(record.period_key()));
        item.set(ATTR_WAVE_HEIGHT, AttributeValue::number(record.wave_height));
        if let Some(dir) = record.wave_direction {
            item.set(ATTR_WAVE_DIRECTION, AttributeValue::number(dir));
        }
        if let Some(period) = record.dominant_period {
            item.set(ATTR_DOMINANT_PERIOD, AttributeValue::number(period));
        }
        if let Some(period) = record.average_period {
            item.set(ATTR_AVERAGE_PERIOD, AttributeValue::number(period));
        }
        item
    }

    /// Period index item: the observation item re-keyed under the index
    /// partition and its `YYYYMM`.
    pub fn to_index_item(&self, record: &RetainedObservation) -> Item {
        let mut item = self.to_item(record);
        item.set(ATTR_ID, AttributeValue::string(self.index_partition.as_str()));
        item.set(ATTR_TIME, AttributeValue::string(record.period_key()));
        item
    }

    fn to_items(&self, records: &[RetainedObservation]) -> Vec<Item> {
        records
            .iter()
            .enumerate()
            .map(|(n, record)| {
                let item = self.to_item(record);
                debug!("converted record {} to item: {:?}", n + 1, item);
                item
            })
            .collect()
    }

    /// Index items for the highest observation of each period in `records`.
    pub fn to_index_items(&self, records: &[RetainedObservation]) -> Vec<Item> {
        period_maxima(records)
            .into_iter()
            .map(|record| self.to_index_item(record))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Writes observation items, then index items unconditionally.
    ///
    /// Only safe when nothing else writes the same periods, e.g. a
    /// historical backfill run in month order.
    pub fn write(&mut self, records: &[RetainedObservation]) -> Result<WriteSummary, StoreError> {
        let items_written = self.write_items(records)?;

        let index = self.to_index_items(records);
        info!("writing index of size {}", index.len());
        let index_written = self.writer.put_items(&mut self.store, index)?;

        Ok(WriteSummary {
            items_written,
            index_written,
            index_skipped: 0,
        })
    }

    /// Writes observation items, then raises index items only where the
    /// new value beats the stored one.
    pub fn write_conditional(
        &mut self,
        records: &[RetainedObservation],
    ) -> Result<WriteSummary, StoreError> {
        let items_written = self.write_items(records)?;
        let (index_written, index_skipped) = self.write_index_conditional(records)?;
        Ok(WriteSummary {
            items_written,
            index_written,
            index_skipped,
        })
    }

    fn write_items(&mut self, records: &[RetainedObservation]) -> Result<usize, StoreError> {
        let items = self.to_items(records);
        info!("converted {} items, batch-writing to store", items.len());
        self.writer.put_items(&mut self.store, items)
    }

    /// Conditional index maintenance. Returns `(written, skipped)`.
    ///
    /// Each candidate is put with "absent, or stored wave height below
    /// mine", so concurrent writers can only ever raise an index entry.
    pub fn write_index_conditional(
        &mut self,
        records: &[RetainedObservation],
    ) -> Result<(usize, usize), StoreError> {
        let items = self.to_index_items(records);
        info!("conditionally writing index of size {}", items.len());

        let mut written = 0;
        let mut skipped = 0;
        for item in items {
            let condition = Condition::AbsentOrLessThan {
                attribute: ATTR_WAVE_HEIGHT.to_string(),
                value: item.require_f64(ATTR_WAVE_HEIGHT)?,
            };
            let period = item.sort_key()?.to_string();
            match self.store.conditional_put(item, &condition) {
                Ok(()) => {
                    debug!("wrote index item for {}", period);
                    written += 1;
                }
                Err(StoreError::ConditionFailed { .. }) => {
                    debug!(
                        "did not write index item for {} due to condition check failure",
                        period
                    );
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((written, skipped))
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Most recent observation item, `None` for an empty buoy.
    pub fn find_latest(&mut self) -> Result<Option<StoredObservation>, StoreError> {
        let query = Query::partition(&self.buoy).descending().limit(1);
        let page = self.store.query(&query, None)?;
        page.items
            .first()
            .map(StoredObservation::from_item)
            .transpose()
    }

    /// Most recent observation with a wave height of at least `wave_height`.
    ///
    /// The period index locates the latest month holding such a value; only
    /// that month's observations are then searched.
    pub fn find_last_occurrence_of(
        &mut self,
        wave_height: f64,
    ) -> Result<Option<StoredObservation>, StoreError> {
        let index_query = Query::partition(&self.index_partition)
            .at_least(ATTR_WAVE_HEIGHT, wave_height)
            .descending();
        let store = &mut self.store;
        let Some(index_item) =
            paginate::first_item(|cursor: Option<&Cursor>| store.query(&index_query, cursor))?
        else {
            return Ok(None);
        };

        let period = index_item.sort_key()?.to_string();
        let item_query = Query::partition(&self.buoy)
            .sort_key_prefix(&period)
            .at_least(ATTR_WAVE_HEIGHT, wave_height)
            .descending();
        let found = paginate::first_item(|cursor: Option<&Cursor>| store.query(&item_query, cursor))?;

        match found {
            Some(item) => StoredObservation::from_item(&item).map(Some),
            None => {
                warn!(
                    "located index item but failed to locate individual record for period {}",
                    period
                );
                Ok(None)
            }
        }
    }

    /// Highest wave height ever recorded, found by scanning the index.
    pub fn find_max_wave_height(&mut self) -> Result<Option<StoredObservation>, StoreError> {
        let query = Query::partition(&self.index_partition);
        let mut max: Option<StoredObservation> = None;
        for item in paginate::query_items(&mut self.store, &query) {
            let candidate = StoredObservation::from_item(&item?)?;
            if max
                .as_ref()
                .is_none_or(|m| candidate.wave_height > m.wave_height)
            {
                max = Some(candidate);
            }
        }
        Ok(max)
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    /// All wave heights recorded in calendar month `month` (1-12), ascending.
    pub fn query_month(&mut self, month: u32) -> Result<Vec<f64>, StoreError> {
        let query = Query::by_month(&self.buoy, month);
        let store = &mut self.store;
        paginate::collect_and_sort(
            |cursor: Option<&Cursor>| store.query(&query, cursor),
            ATTR_WAVE_HEIGHT,
        )
    }

    /// All wave heights recorded on month-day `MMDD` in any year, ascending.
    pub fn query_month_day(&mut self, month_day: &str) -> Result<Vec<f64>, StoreError> {
        let query = Query::by_month_day(&self.buoy, month_day);
        let store = &mut self.store;
        paginate::collect_and_sort(
            |cursor: Option<&Cursor>| store.query(&query, cursor),
            ATTR_WAVE_HEIGHT,
        )
    }

    pub fn query_month_percentile(
        &mut self,
        month: u32,
        wave_height: f64,
    ) -> Result<PercentileRank, StatsError> {
        let query = Query::by_month(&self.buoy, month);
        let store = &mut self.store;
        paginate::percentile(
            |cursor: Option<&Cursor>| store.query(&query, cursor),
            ATTR_WAVE_HEIGHT,
            wave_height,
        )
    }

    pub fn query_month_day_percentile(
        &mut self,
        month_day: &str,
        wave_height: f64,
    ) -> Result<PercentileRank, StatsError> {
        let query = Query::by_month_day(&self.buoy, month_day);
        let store = &mut self.store;
        paginate::percentile(
            |cursor: Option<&Cursor>| store.query(&query, cursor),
            ATTR_WAVE_HEIGHT,
            wave_height,
        )
    }
}

/// The highest-wave observation of each period, ties going to the first
/// seen. Ordered by period.
pub fn period_maxima(records: &[RetainedObservation]) -> Vec<&RetainedObservation> {
    let mut maxima: BTreeMap<&str, &RetainedObservation> = BTreeMap::new();
    for record in records {
        maxima
            .entry(record.period_key())
            .and_modify(|best| {
                if record.wave_height > best.wave_height {
                    *best = record;
                }
            })
            .or_insert(record);
    }
    maxima.into_values().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
