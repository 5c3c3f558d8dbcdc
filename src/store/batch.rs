/// Batch writes with bounded-growth backoff.
///
/// Items are split into chunks of at most `MAX_BATCH_SIZE`. Each chunk is
/// submitted with `Store::batch_put`; whatever the backend reports as
/// unprocessed is resubmitted on its own after a backoff sleep. The delay
/// starts at 100ms and doubles up to 5s.
///
/// By default there is no retry ceiling: a chunk is retried until the
/// backend accepts every item. `BackoffPolicy::max_attempts` bounds the
/// number of batch calls per chunk and turns exhaustion into
/// `StoreError::GaveUp`.
///
/// # Sleep injection
/// Sleeping goes through the `Sleeper` trait so tests can record the
/// delays instead of waiting on them.

use std::time::Duration;

use tracing::debug;

use super::{Item, Store, MAX_BATCH_SIZE};
use crate::model::StoreError;

pub const FIRST_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    /// Maximum batch calls per chunk, `None` for unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            first: FIRST_BACKOFF,
            max: MAX_BACKOFF,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.first,
            max: self.max,
        }
    }
}

/// Endless sequence of delays: `first`, `2 * first`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = self.max.min(current.saturating_mul(2));
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Sleeping
// ---------------------------------------------------------------------------

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Blocks the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct BatchWriter<Z: Sleeper = ThreadSleeper> {
    chunk_size: usize,
    policy: BackoffPolicy,
    sleeper: Z,
}

impl BatchWriter<ThreadSleeper> {
    pub fn new(policy: BackoffPolicy) -> Self {
        BatchWriter::with_sleeper(policy, MAX_BATCH_SIZE, ThreadSleeper)
    }
}

impl Default for BatchWriter<ThreadSleeper> {
    fn default() -> Self {
        BatchWriter::new(BackoffPolicy::default())
    }
}

impl<Z: Sleeper> BatchWriter<Z> {
    /// `chunk_size` is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_sleeper(policy: BackoffPolicy, chunk_size: usize, sleeper: Z) -> Self {
        BatchWriter {
            chunk_size: chunk_size.clamp(1, MAX_BATCH_SIZE),
            policy,
            sleeper,
        }
    }

    pub fn sleeper(&self) -> &Z {
        &self.sleeper
    }

    /// Writes every item, chunk by chunk. Returns the number written.
    ///
    /// Any error other than unprocessed items aborts the whole write;
    /// chunks already accepted stay written.
    pub fn put_items<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        let mut written = 0;
        let mut remaining = items.into_iter();
        loop {
            let chunk: Vec<Item> = remaining.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let size = chunk.len();
            self.write_chunk(store, chunk)?;
            written += size;
            debug!("wrote batch of {}, total written is {}", size, written);
        }
        Ok(written)
    }

    fn write_chunk<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        chunk: Vec<Item>,
    ) -> Result<(), StoreError> {
        let mut delays = self.policy.delays();
        let mut pending = chunk;
        let mut attempts: u32 = 0;

        while !pending.is_empty() {
            pending = store.batch_put(pending)?;
            attempts += 1;
            if pending.is_empty() {
                break;
            }
            if self.policy.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(StoreError::GaveUp {
                    attempts,
                    unprocessed: pending.len(),
                });
            }
            // Backoff is an endless iterator.
            let delay = delays.next().unwrap_or(self.policy.max);
            debug!(
                "{} unprocessed items, sleeping for {:?}",
                pending.len(),
                delay
            );
            self.sleeper.sleep(delay);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Condition, Cursor, Page, Query};

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Vec<Duration>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&mut self, duration: Duration) {
            self.delays.push(duration);
        }
    }

    /// Rejects a fixed number of items per call for the first `throttled_calls`
    /// calls, then accepts everything.
    #[derive(Default)]
    struct ThrottlingStore {
        unprocessed_per_call: usize,
        throttled_calls: usize,
        calls: Vec<Vec<String>>,
        written: Vec<Item>,
        fail_with_error: bool,
    }

    impl Store for ThrottlingStore {
        fn batch_put(&mut self, items: Vec<Item>) -> Result<Vec<Item>, StoreError> {
            if self.fail_with_error {
                return Err(StoreError::Unsupported("batch".to_string()));
            }
            self.calls.push(
                items
                    .iter()
                    .map(|i| i.sort_key().unwrap().to_string())
                    .collect(),
            );
            let mut items = items;
            let unprocessed = if self.calls.len() <= self.throttled_calls {
                let keep = items.len().saturating_sub(self.unprocessed_per_call);
                items.split_off(keep)
            } else {
                Vec::new()
            };
            self.written.extend(items);
            Ok(unprocessed)
        }

        fn conditional_put(&mut self, _: Item, _: &Condition) -> Result<(), StoreError> {
            unreachable!()
        }

        fn query(&mut self, _: &Query, _: Option<&Cursor>) -> Result<Page, StoreError> {
            unreachable!()
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item::new("46013", &format!("20240101{:02}", i)))
            .collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let delays: Vec<_> = BackoffPolicy::default().delays().take(8).collect();
        let ms: Vec<u128> = delays.iter().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[test]
    fn test_partial_batch_is_retried_once_after_sleep() {
        let mut store = ThrottlingStore {
            unprocessed_per_call: 3,
            throttled_calls: 1,
            ..Default::default()
        };
        let mut writer =
            BatchWriter::with_sleeper(BackoffPolicy::default(), MAX_BATCH_SIZE, RecordingSleeper::default());

        let written = writer.put_items(&mut store, items(10)).unwrap();

        assert_eq!(written, 10);
        assert_eq!(store.calls.len(), 2);
        assert_eq!(store.calls[0].len(), 10);
        // Only the unprocessed subset is resubmitted.
        assert_eq!(store.calls[1], vec!["2024010107", "2024010108", "2024010109"]);
        assert_eq!(writer.sleeper().delays, vec![Duration::from_millis(100)]);
        assert_eq!(store.written.len(), 10);
    }

    #[test]
    fn test_items_are_chunked_at_batch_limit() {
        let mut store = ThrottlingStore::default();
        let mut writer =
            BatchWriter::with_sleeper(BackoffPolicy::default(), MAX_BATCH_SIZE, RecordingSleeper::default());

        let written = writer.put_items(&mut store, items(60)).unwrap();

        assert_eq!(written, 60);
        let sizes: Vec<usize> = store.calls.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![25, 25, 10]);
        assert!(writer.sleeper().delays.is_empty());
    }

    #[test]
    fn test_repeated_throttling_grows_the_delay() {
        let mut store = ThrottlingStore {
            unprocessed_per_call: 1,
            throttled_calls: 4,
            ..Default::default()
        };
        let mut writer =
            BatchWriter::with_sleeper(BackoffPolicy::default(), MAX_BATCH_SIZE, RecordingSleeper::default());

        writer.put_items(&mut store, items(5)).unwrap();

        let ms: Vec<u128> = writer.sleeper().delays.iter().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![100, 200, 400, 800]);
        assert_eq!(store.written.len(), 5);
    }

    #[test]
    fn test_retry_ceiling_gives_up() {
        let mut store = ThrottlingStore {
            unprocessed_per_call: 2,
            throttled_calls: usize::MAX,
            ..Default::default()
        };
        let policy = BackoffPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        let mut writer = BatchWriter::with_sleeper(policy, MAX_BATCH_SIZE, RecordingSleeper::default());

        let err = writer.put_items(&mut store, items(4)).unwrap_err();

        assert!(matches!(err, StoreError::GaveUp { attempts: 3, unprocessed: 2 }));
        assert_eq!(writer.sleeper().delays.len(), 2);
    }

    #[test]
    fn test_store_error_aborts_write() {
        let mut store = ThrottlingStore {
            fail_with_error: true,
            ..Default::default()
        };
        let mut writer =
            BatchWriter::with_sleeper(BackoffPolicy::default(), MAX_BATCH_SIZE, RecordingSleeper::default());
        assert!(matches!(
            writer.put_items(&mut store, items(3)),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_empty_input_issues_no_calls() {
        let mut store = ThrottlingStore::default();
        let mut writer =
            BatchWriter::with_sleeper(BackoffPolicy::default(), MAX_BATCH_SIZE, RecordingSleeper::default());
        assert_eq!(writer.put_items(&mut store, Vec::new()).unwrap(), 0);
        assert!(store.calls.is_empty());
    }
}
