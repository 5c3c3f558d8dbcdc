/// In-process `Store` backend.
///
/// Holds items in a `BTreeMap` ordered by `(partition key, sort key)` and
/// follows the same contract as a remote table: queries return pages of
/// at most `page_size` evaluated items with a cursor when more remain,
/// filters are applied after a page is cut, conditional puts fail with
/// `StoreError::ConditionFailed`, and batch writes can be told to leave
/// items unprocessed. Used for dry runs and tests.

use std::collections::{BTreeMap, VecDeque};

use super::{Condition, Cursor, Item, Page, Query, Store, MAX_BATCH_SIZE};
use crate::model::StoreError;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug)]
pub struct MemoryStore {
    items: BTreeMap<(String, String), Item>,
    page_size: usize,
    /// Items to leave unprocessed on each upcoming `batch_put` call.
    throttle: VecDeque<usize>,
    pub batch_calls: usize,
    pub query_calls: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        MemoryStore {
            items: BTreeMap::new(),
            page_size: page_size.max(1),
            throttle: VecDeque::new(),
            batch_calls: 0,
            query_calls: 0,
        }
    }

    /// Makes the next batch calls report the last `counts[i]` items of
    /// call `i` as unprocessed.
    pub fn throttle_batches(&mut self, counts: &[usize]) {
        self.throttle.extend(counts.iter().copied());
    }

    pub fn get(&self, partition_key: &str, sort_key: &str) -> Option<&Item> {
        self.items
            .get(&(partition_key.to_string(), sort_key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn key_of(item: &Item) -> Result<(String, String), StoreError> {
        Ok((
            item.partition_key()?.to_string(),
            item.sort_key()?.to_string(),
        ))
    }
}

impl Store for MemoryStore {
    fn batch_put(&mut self, items: Vec<Item>) -> Result<Vec<Item>, StoreError> {
        if items.len() > MAX_BATCH_SIZE {
            return Err(StoreError::Unsupported(format!(
                "batch of {} items exceeds limit of {}",
                items.len(),
                MAX_BATCH_SIZE
            )));
        }
        self.batch_calls += 1;

        let mut items = items;
        let held_back = self.throttle.pop_front().unwrap_or(0).min(items.len());
        let unprocessed = items.split_off(items.len() - held_back);

        for item in items {
            let key = Self::key_of(&item)?;
            self.items.insert(key, item);
        }
        Ok(unprocessed)
    }

    fn conditional_put(&mut self, item: Item, condition: &Condition) -> Result<(), StoreError> {
        let key = Self::key_of(&item)?;
        if !condition.holds(self.items.get(&key)) {
            return Err(StoreError::ConditionFailed {
                partition_key: key.0,
                sort_key: key.1,
            });
        }
        self.items.insert(key, item);
        Ok(())
    }

    fn query(&mut self, query: &Query, cursor: Option<&Cursor>) -> Result<Page, StoreError> {
        self.query_calls += 1;

        let after_cursor = |sort_key: &str| match cursor {
            None => true,
            Some(Cursor(c)) if query.descending => sort_key < c.as_str(),
            Some(Cursor(c)) => sort_key > c.as_str(),
        };

        let start = (query.partition_key.clone(), String::new());
        let mut candidates: Vec<(&(String, String), &Item)> = self
            .items
            .range(start..)
            .take_while(|(key, _)| key.0 == query.partition_key)
            .filter(|(key, item)| query.selects(item) && after_cursor(key.1.as_str()))
            .collect();
        if query.descending {
            candidates.reverse();
        }

        let budget = query
            .limit
            .map_or(self.page_size, |limit| limit.min(self.page_size));
        let more = candidates.len() > budget;
        candidates.truncate(budget);

        let cursor = if more {
            candidates.last().map(|(key, _)| Cursor(key.1.clone()))
        } else {
            None
        };
        let items = candidates
            .into_iter()
            .map(|(_, item)| item)
            .filter(|item| query.filter.as_ref().is_none_or(|f| f.matches(item)))
            .cloned()
            .collect();

        Ok(Page { items, cursor })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::paginate::query_items;
    use crate::store::AttributeValue;

    fn item(pk: &str, sk: &str, height: f64) -> Item {
        let mut item = Item::new(pk, sk);
        item.set("waveheight", AttributeValue::number(height));
        item
    }

    fn seeded(page_size: usize) -> MemoryStore {
        let mut store = MemoryStore::with_page_size(page_size);
        let items = vec![
            item("46013", "2024010100", 1.0),
            item("46013", "2024010101", 3.0),
            item("46013", "2024020100", 2.0),
            item("46013", "2024020101", 0.5),
            item("46014", "2024010100", 9.0),
        ];
        assert!(store.batch_put(items).unwrap().is_empty());
        store
    }

    fn sort_keys(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.sort_key().unwrap()).collect()
    }

    #[test]
    fn test_query_pages_through_partition_only() {
        let mut store = seeded(2);
        let query = Query::partition("46013");
        let all: Vec<Item> = query_items(&mut store, &query).map(Result::unwrap).collect();
        assert_eq!(
            sort_keys(&all),
            vec!["2024010100", "2024010101", "2024020100", "2024020101"]
        );
        assert_eq!(store.query_calls, 2);
    }

    #[test]
    fn test_descending_prefix_query_with_filter() {
        let mut store = seeded(100);
        let query = Query::partition("46013")
            .sort_key_prefix("202401")
            .at_least("waveheight", 2.0)
            .descending();
        let page = store.query(&query, None).unwrap();
        assert_eq!(sort_keys(&page.items), vec!["2024010101"]);
        assert!(page.cursor.is_none());
    }

    #[test]
    fn test_filtered_page_can_be_empty_with_cursor() {
        let mut store = seeded(1);
        let query = Query::partition("46013").at_least("waveheight", 2.5);
        let first = store.query(&query, None).unwrap();
        assert!(first.items.is_empty());
        assert_eq!(first.cursor, Some(Cursor("2024010100".to_string())));

        let all: Vec<Item> = query_items(&mut store, &query).map(Result::unwrap).collect();
        assert_eq!(sort_keys(&all), vec!["2024010101"]);
    }

    #[test]
    fn test_limit_caps_page() {
        let mut store = seeded(100);
        let query = Query::partition("46013").descending().limit(1);
        let page = store.query(&query, None).unwrap();
        assert_eq!(sort_keys(&page.items), vec!["2024020101"]);
        assert!(page.cursor.is_some());
    }

    #[test]
    fn test_throttled_batch_returns_tail_unprocessed() {
        let mut store = MemoryStore::new();
        store.throttle_batches(&[2]);
        let unprocessed = store
            .batch_put(vec![
                item("46013", "1", 1.0),
                item("46013", "2", 1.0),
                item("46013", "3", 1.0),
            ])
            .unwrap();
        assert_eq!(sort_keys(&unprocessed), vec!["2", "3"]);
        assert_eq!(store.len(), 1);
        assert!(store.batch_put(unprocessed).unwrap().is_empty());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_oversized_batch_is_rejected() {
        let mut store = MemoryStore::new();
        let items = (0..26).map(|i| item("46013", &i.to_string(), 1.0)).collect();
        assert!(matches!(store.batch_put(items), Err(StoreError::Unsupported(_))));
    }

    #[test]
    fn test_conditional_put_replaces_only_when_greater() {
        let mut store = MemoryStore::new();
        let condition = |v: f64| Condition::AbsentOrLessThan {
            attribute: "waveheight".to_string(),
            value: v,
        };
        store
            .conditional_put(item("46013/period-index", "202401", 3.0), &condition(3.0))
            .unwrap();

        let err = store
            .conditional_put(item("46013/period-index", "202401", 2.0), &condition(2.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
        let stored = store.get("46013/period-index", "202401").unwrap();
        assert_eq!(stored.require_f64("waveheight").unwrap(), 3.0);

        store
            .conditional_put(item("46013/period-index", "202401", 4.0), &condition(4.0))
            .unwrap();
        let stored = store.get("46013/period-index", "202401").unwrap();
        assert_eq!(stored.require_f64("waveheight").unwrap(), 4.0);
    }
}
