/// Cursor-following query iteration and the statistics built on it.
///
/// A query function takes the continuation cursor of the previous page
/// (`None` for the first page) and returns one `Page`. `PagedItems` turns
/// such a function into a lazy iterator that issues the next request only
/// once the current page is used up, and stops when a page comes back
/// without a cursor. An iterator traverses once; build a new one from a
/// fresh query function for each traversal.

use super::{Cursor, Item, Page, Query, Store};
use crate::model::{StatsError, StoreError};

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

pub struct PagedItems<F> {
    fetch: F,
    buffer: std::vec::IntoIter<Item>,
    cursor: Option<Cursor>,
    exhausted: bool,
}

pub fn paged_items<F>(fetch: F) -> PagedItems<F>
where
    F: FnMut(Option<&Cursor>) -> Result<Page, StoreError>,
{
    PagedItems {
        fetch,
        buffer: Vec::new().into_iter(),
        cursor: None,
        exhausted: false,
    }
}

/// Iterates every item matching `query`, one round trip per page.
pub fn query_items<'a, S>(
    store: &'a mut S,
    query: &'a Query,
) -> PagedItems<impl FnMut(Option<&Cursor>) -> Result<Page, StoreError> + 'a>
where
    S: Store + ?Sized,
{
    paged_items(move |cursor: Option<&Cursor>| store.query(query, cursor))
}

impl<F> Iterator for PagedItems<F>
where
    F: FnMut(Option<&Cursor>) -> Result<Page, StoreError>,
{
    type Item = Result<Item, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(Ok(item));
            }
            if self.exhausted {
                return None;
            }
            // A page may be empty and still carry a cursor when a filter
            // discarded everything on it; keep going.
            match (self.fetch)(self.cursor.as_ref()) {
                Ok(page) => {
                    self.exhausted = page.cursor.is_none();
                    self.cursor = page.cursor;
                    self.buffer = page.items.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Follows pages until the first item appears.
pub fn first_item<F>(fetch: F) -> Result<Option<Item>, StoreError>
where
    F: FnMut(Option<&Cursor>) -> Result<Page, StoreError>,
{
    paged_items(fetch).next().transpose()
}

/// Collects a numeric attribute from every queried item.
pub fn collect_values<F>(fetch: F, attribute: &str) -> Result<Vec<f64>, StoreError>
where
    F: FnMut(Option<&Cursor>) -> Result<Page, StoreError>,
{
    paged_items(fetch)
        .map(|item| item?.require_f64(attribute))
        .collect()
}

/// Collects a numeric attribute and sorts it ascending.
pub fn collect_and_sort<F>(fetch: F, attribute: &str) -> Result<Vec<f64>, StoreError>
where
    F: FnMut(Option<&Cursor>) -> Result<Page, StoreError>,
{
    let mut values = collect_values(fetch, attribute)?;
    values.sort_by(f64::total_cmp);
    Ok(values)
}

// ---------------------------------------------------------------------------
// Percentile rank
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PercentileRank {
    /// `floor(count / total * 100)`
    pub percentile: u32,
    /// Values less than or equal to the threshold.
    pub count: usize,
    pub total: usize,
}

/// Rank of `value` within an ascending slice.
pub fn percentile_of(sorted: &[f64], value: f64) -> Result<PercentileRank, StatsError> {
    if sorted.is_empty() {
        return Err(StatsError::EmptyPopulation);
    }
    let count = sorted.partition_point(|v| *v <= value);
    let total = sorted.len();
    Ok(PercentileRank {
        percentile: (count * 100 / total) as u32,
        count,
        total,
    })
}

/// Pages through every item, then ranks `value` against the collected
/// attribute values.
pub fn percentile<F>(fetch: F, attribute: &str, value: f64) -> Result<PercentileRank, StatsError>
where
    F: FnMut(Option<&Cursor>) -> Result<Page, StoreError>,
{
    let values = collect_and_sort(fetch, attribute)?;
    percentile_of(&values, value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AttributeValue;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn item(height: f64) -> Item {
        let mut item = Item::new("46013", "2024010100");
        item.set("waveheight", AttributeValue::number(height));
        item
    }

    /// Serves fixed pages in order, recording the cursor of each request.
    fn pages(
        heights: Vec<Vec<f64>>,
    ) -> (
        impl FnMut(Option<&Cursor>) -> Result<Page, StoreError>,
        Rc<RefCell<Vec<Option<Cursor>>>>,
    ) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let count = heights.len();
        let fetch = move |cursor: Option<&Cursor>| -> Result<Page, StoreError> {
            let n = log.borrow().len();
            log.borrow_mut().push(cursor.cloned());
            let items = heights[n].iter().map(|h| item(*h)).collect();
            let cursor = (n + 1 < count).then(|| Cursor(format!("page-{}", n + 1)));
            Ok(Page { items, cursor })
        };
        (fetch, seen)
    }

    #[test]
    fn test_iterates_across_pages_following_cursor() {
        let (fetch, seen) = pages(vec![vec![1.0, 2.0], vec![], vec![3.0]]);
        let values: Vec<f64> = paged_items(fetch)
            .map(|i| i.unwrap().require_f64("waveheight").unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(
            *seen.borrow(),
            vec![
                None,
                Some(Cursor("page-1".to_string())),
                Some(Cursor("page-2".to_string()))
            ]
        );
    }

    #[test]
    fn test_first_item_stops_after_first_hit() {
        let (fetch, seen) = pages(vec![vec![], vec![4.0], vec![5.0]]);
        let first = first_item(fetch).unwrap().unwrap();
        assert_eq!(first.require_f64("waveheight").unwrap(), 4.0);
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn test_first_item_on_empty_result() {
        let (fetch, _) = pages(vec![vec![]]);
        assert!(first_item(fetch).unwrap().is_none());
    }

    #[test]
    fn test_error_ends_iteration() {
        let mut iter = paged_items(|_: Option<&Cursor>| -> Result<Page, StoreError> {
            Err(StoreError::Unsupported("query".to_string()))
        });
        assert!(matches!(iter.next(), Some(Err(StoreError::Unsupported(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_collect_and_sort() {
        let (fetch, _) = pages(vec![vec![3.0, 1.0], vec![2.0]]);
        assert_eq!(collect_and_sort(fetch, "waveheight").unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_percentile_counts_values_at_or_below() {
        let (fetch, _) = pages(vec![vec![1.0, 2.0, 2.0], vec![3.0]]);
        let rank = percentile(fetch, "waveheight", 2.0).unwrap();
        assert_eq!(rank, PercentileRank { percentile: 75, count: 3, total: 4 });
    }

    #[test]
    fn test_percentile_floors() {
        let rank = percentile_of(&[1.0, 2.0, 3.0], 1.0).unwrap();
        assert_eq!(rank.percentile, 33);
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile_of(&values, 29.0).unwrap().percentile, 29);
    }

    #[test]
    fn test_percentile_bounds() {
        let values = [1.0, 2.0, 3.0];
        assert_eq!(percentile_of(&values, 0.5).unwrap().percentile, 0);
        assert_eq!(percentile_of(&values, 3.0).unwrap().percentile, 100);
    }

    #[test]
    fn test_percentile_is_monotonic_in_threshold() {
        let values = [0.4, 0.9, 0.9, 1.3, 2.2, 2.2, 2.2, 3.8, 4.1];
        let thresholds = [0.0, 0.5, 0.9, 1.0, 2.2, 3.0, 5.0];
        let ranks: Vec<u32> = thresholds
            .iter()
            .map(|t| percentile_of(&values, *t).unwrap().percentile)
            .collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{:?}", ranks);
    }

    #[test]
    fn test_percentile_of_empty_population_is_an_error() {
        let (fetch, _) = pages(vec![vec![]]);
        assert!(matches!(
            percentile(fetch, "waveheight", 1.0),
            Err(StatsError::EmptyPopulation)
        ));
    }

    #[test]
    fn test_missing_attribute_is_malformed() {
        let mut fetch = |_: Option<&Cursor>| -> Result<Page, StoreError> {
            Ok(Page {
                items: vec![Item::new("46013", "2024010100")],
                cursor: None,
            })
        };
        assert!(matches!(
            collect_values(&mut fetch, "waveheight"),
            Err(StoreError::MalformedItem(_))
        ));
    }
}
