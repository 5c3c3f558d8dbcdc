/// Key-value table access.
///
/// The table holds items addressed by `(partition key, sort key)`, stored
/// as the `id` and `time` attributes. Everything above this module talks
/// to the table through the three primitives of the `Store` trait:
///
/// - `batch_put`: unconditional writes of up to `MAX_BATCH_SIZE` items,
///   returning whatever the backend did not get to;
/// - `conditional_put`: a single atomic write guarded by a predicate on
///   the item currently stored at the same key;
/// - `query`: one page of a range query within a partition, optionally
///   through a month or month-day secondary index.
///
/// Submodules:
/// - `batch`: chunking and retry of partial batch writes.
/// - `paginate`: cursor-following iteration and percentile helpers.
/// - `memory`: in-process backend.
/// - `pg`: PostgreSQL backend.

pub mod batch;
pub mod memory;
pub mod paginate;
pub mod pg;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::StoreError;

/// Largest number of items accepted by one `batch_put` call.
pub const MAX_BATCH_SIZE: usize = 25;

pub const ATTR_ID: &str = "id";
pub const ATTR_TIME: &str = "time";
/// Attributes the backends index or compare natively.
pub const ATTR_WAVE_HEIGHT: &str = "waveheight";
pub const ATTR_MONTH: &str = "month";
pub const ATTR_MONTH_DAY: &str = "monthday";

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// A typed attribute value. Numbers travel as their decimal string so
/// backends never round them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
}

impl AttributeValue {
    pub fn string(s: impl Into<String>) -> Self {
        AttributeValue::S(s.into())
    }

    pub fn number(n: impl std::fmt::Display) -> Self {
        AttributeValue::N(n.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            AttributeValue::N(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::N(n) => n.parse().ok(),
            AttributeValue::S(_) => None,
        }
    }
}

/// One table item: a sparse map of named attributes including the
/// `id`/`time` key pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Item {
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Item {
    pub fn new(partition_key: &str, sort_key: &str) -> Self {
        let mut item = Item::default();
        item.set(ATTR_ID, AttributeValue::string(partition_key));
        item.set(ATTR_TIME, AttributeValue::string(sort_key));
        item
    }

    pub fn set(&mut self, name: &str, value: AttributeValue) {
        self.attributes.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn partition_key(&self) -> Result<&str, StoreError> {
        self.require_str(ATTR_ID)
    }

    pub fn sort_key(&self) -> Result<&str, StoreError> {
        self.require_str(ATTR_TIME)
    }

    pub fn require_str(&self, name: &str) -> Result<&str, StoreError> {
        self.get(name)
            .and_then(AttributeValue::as_str)
            .ok_or_else(|| StoreError::MalformedItem(format!("missing string attribute '{}'", name)))
    }

    pub fn require_f64(&self, name: &str) -> Result<f64, StoreError> {
        self.get(name)
            .and_then(AttributeValue::as_f64)
            .ok_or_else(|| StoreError::MalformedItem(format!("missing numeric attribute '{}'", name)))
    }

    pub fn optional_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(AttributeValue::as_f64)
    }
}

// ---------------------------------------------------------------------------
// Conditions, filters and queries
// ---------------------------------------------------------------------------

/// Predicate evaluated atomically against the currently stored item.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// No item exists at the key, or its numeric `attribute` is strictly
    /// less than `value`.
    AbsentOrLessThan { attribute: String, value: f64 },
}

impl Condition {
    pub fn holds(&self, existing: Option<&Item>) -> bool {
        match self {
            Condition::AbsentOrLessThan { attribute, value } => match existing {
                None => true,
                Some(item) => item.optional_f64(attribute).is_some_and(|v| v < *value),
            },
        }
    }
}

/// Post-key filter; items failing it are skipped but still consume
/// the page.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    AtLeast { attribute: String, value: f64 },
}

impl Filter {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Filter::AtLeast { attribute, value } => {
                item.optional_f64(attribute).is_some_and(|v| v >= *value)
            }
        }
    }
}

/// How items within the partition are selected.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyCondition {
    /// Primary key range, optionally restricted to sort keys with a prefix.
    SortKeyPrefix(Option<String>),
    /// Secondary index on the numeric `month` attribute.
    Month(u32),
    /// Secondary index on the `monthday` attribute (`MMDD`).
    MonthDay(String),
}

/// A range query within one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub partition_key: String,
    pub key_condition: KeyCondition,
    pub filter: Option<Filter>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn partition(partition_key: &str) -> Self {
        Query {
            partition_key: partition_key.to_string(),
            key_condition: KeyCondition::SortKeyPrefix(None),
            filter: None,
            descending: false,
            limit: None,
        }
    }

    pub fn by_month(partition_key: &str, month: u32) -> Self {
        Query {
            key_condition: KeyCondition::Month(month),
            ..Query::partition(partition_key)
        }
    }

    pub fn by_month_day(partition_key: &str, month_day: &str) -> Self {
        Query {
            key_condition: KeyCondition::MonthDay(month_day.to_string()),
            ..Query::partition(partition_key)
        }
    }

    pub fn sort_key_prefix(mut self, prefix: &str) -> Self {
        self.key_condition = KeyCondition::SortKeyPrefix(Some(prefix.to_string()));
        self
    }

    pub fn at_least(mut self, attribute: &str, value: f64) -> Self {
        self.filter = Some(Filter::AtLeast {
            attribute: attribute.to_string(),
            value,
        });
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when the item belongs to this query's key range, before filtering.
    pub fn selects(&self, item: &Item) -> bool {
        if item.get(ATTR_ID).and_then(AttributeValue::as_str) != Some(self.partition_key.as_str()) {
            return false;
        }
        match &self.key_condition {
            KeyCondition::SortKeyPrefix(None) => true,
            KeyCondition::SortKeyPrefix(Some(prefix)) => item
                .get(ATTR_TIME)
                .and_then(AttributeValue::as_str)
                .is_some_and(|t| t.starts_with(prefix.as_str())),
            KeyCondition::Month(month) => item
                .optional_f64(ATTR_MONTH)
                .is_some_and(|m| m == f64::from(*month)),
            KeyCondition::MonthDay(month_day) => {
                item.get(ATTR_MONTH_DAY).and_then(AttributeValue::as_str) == Some(month_day.as_str())
            }
        }
    }
}

/// Opaque position marker returned when a query has more results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(pub String);

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub cursor: Option<Cursor>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

pub trait Store {
    /// Writes up to `MAX_BATCH_SIZE` items, replacing any item at the same
    /// key. Returns the items that were not processed; an empty vector
    /// means every item was written.
    fn batch_put(&mut self, items: Vec<Item>) -> Result<Vec<Item>, StoreError>;

    /// Writes one item if `condition` holds for the item currently stored
    /// at its key. Fails with `StoreError::ConditionFailed` otherwise.
    fn conditional_put(&mut self, item: Item, condition: &Condition) -> Result<(), StoreError>;

    /// Returns the page of results following `cursor`, or the first page.
    fn query(&mut self, query: &Query, cursor: Option<&Cursor>) -> Result<Page, StoreError>;
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn batch_put(&mut self, items: Vec<Item>) -> Result<Vec<Item>, StoreError> {
        (**self).batch_put(items)
    }

    fn conditional_put(&mut self, item: Item, condition: &Condition) -> Result<(), StoreError> {
        (**self).conditional_put(item, condition)
    }

    fn query(&mut self, query: &Query, cursor: Option<&Cursor>) -> Result<Page, StoreError> {
        (**self).query(query, cursor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
