//! Buoy observation ingestion.
//!
//! Fetches NDBC standard meteorological feeds, normalizes and
//! de-duplicates the observations, and stores them in a key-value table
//! together with a per-month running-maximum index used for percentile and
//! "last seen at this height" queries.
//!
//! - `ingest`: feed client, parser and normalizer.
//! - `store`: the `Store` trait, batch writer, pagination and backends.
//! - `table`: `BuoyTable`, the buoy-specific item layout and queries.
//! - `report`: the latest-observation summary pipeline.

pub mod config;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod report;
pub mod store;
pub mod table;
