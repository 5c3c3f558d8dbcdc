/// Feed ingestion: fetching NDBC text files and turning them into
/// retained observations.
///
/// Submodules:
/// - `ndbc`: URL templates and the blocking HTTP client.
/// - `parse`: header-driven column parser.
/// - `normalize`: date validation, key derivation and per-hour de-duplication.

pub mod ndbc;
pub mod normalize;
pub mod parse;

pub use normalize::parse_normalize_filter;
