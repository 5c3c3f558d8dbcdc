/// NDBC (National Data Buoy Center) feed client
///
/// Retrieves standard meteorological text files for a buoy. Historical
/// years and months are served through the `view_text_file.php` viewer,
/// the current year's months and the rolling 45-day and 5-day windows
/// through the realtime data tree.
///
/// Data description: https://www.ndbc.noaa.gov/faq/measdes.shtml

use std::time::Duration;

use tracing::debug;

use crate::model::FeedError;

pub const NDBC_BASE_URL: &str = "https://www.ndbc.noaa.gov";

// ============================================================================
// Months
// ============================================================================

/// Calendar month as NDBC names it in directory paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Month {
    Jan = 1,
    Feb,
    Mar,
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
}

pub const MONTHS: [Month; 12] = [
    Month::Jan,
    Month::Feb,
    Month::Mar,
    Month::Apr,
    Month::May,
    Month::Jun,
    Month::Jul,
    Month::Aug,
    Month::Sep,
    Month::Oct,
    Month::Nov,
    Month::Dec,
];

impl Month {
    /// 1-based month number.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Three-letter name used in NDBC paths, e.g. "Jan".
    pub fn name(self) -> &'static str {
        match self {
            Month::Jan => "Jan",
            Month::Feb => "Feb",
            Month::Mar => "Mar",
            Month::Apr => "Apr",
            Month::May => "May",
            Month::Jun => "Jun",
            Month::Jul => "Jul",
            Month::Aug => "Aug",
            Month::Sep => "Sep",
            Month::Oct => "Oct",
            Month::Nov => "Nov",
            Month::Dec => "Dec",
        }
    }

    pub fn from_id(id: u32) -> Option<Month> {
        MONTHS.get(id.checked_sub(1)? as usize).copied()
    }

    /// Resolves a three-letter month name, ignoring case.
    pub fn from_name(name: &str) -> Option<Month> {
        MONTHS
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }

    /// This month followed by the next `count - 1` months of the same year.
    /// Stops at December.
    pub fn run(self, count: usize) -> impl Iterator<Item = Month> {
        MONTHS.into_iter().skip(self.id() as usize - 1).take(count)
    }
}

// ============================================================================
// URL construction
// ============================================================================

pub fn year_url(base: &str, buoy: &str, year: i32) -> String {
    format!(
        "{}/view_text_file.php?filename={}h{}.txt.gz&dir=data/historical/stdmet/",
        base, buoy, year
    )
}

pub fn year_month_url(base: &str, buoy: &str, year: i32, month: Month) -> String {
    format!(
        "{}/view_text_file.php?filename={}{}{}.txt.gz&dir=data/stdmet/{}/",
        base,
        buoy,
        month.id(),
        year,
        month.name()
    )
}

pub fn month_url(base: &str, buoy: &str, month: Month) -> String {
    format!("{}/data/stdmet/{}/{}.txt", base, month.name(), buoy)
}

pub fn last45_url(base: &str, buoy: &str) -> String {
    format!("{}/data/realtime2/{}.txt", base, buoy)
}

pub fn last5_url(base: &str, buoy: &str) -> String {
    format!("{}/data/5day2/{}_5day.txt", base, buoy)
}

// ============================================================================
// Client
// ============================================================================

/// Blocking client for one NDBC-compatible base URL.
pub struct NdbcClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl NdbcClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FeedError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(NdbcClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches a full historical year, e.g. `46013h1981.txt.gz`.
    pub fn fetch_year(&self, buoy: &str, year: i32) -> Result<String, FeedError> {
        self.fetch_text(&year_url(&self.base_url, buoy, year))
    }

    /// Fetches one month of a past year.
    pub fn fetch_year_month(&self, buoy: &str, year: i32, month: Month) -> Result<String, FeedError> {
        self.fetch_text(&year_month_url(&self.base_url, buoy, year, month))
    }

    /// Fetches one month of the current year.
    pub fn fetch_month(&self, buoy: &str, month: Month) -> Result<String, FeedError> {
        self.fetch_text(&month_url(&self.base_url, buoy, month))
    }

    pub fn fetch_last45(&self, buoy: &str) -> Result<String, FeedError> {
        self.fetch_text(&last45_url(&self.base_url, buoy))
    }

    pub fn fetch_last5(&self, buoy: &str) -> Result<String, FeedError> {
        self.fetch_text(&last5_url(&self.base_url, buoy))
    }

    fn fetch_text(&self, url: &str) -> Result<String, FeedError> {
        debug!("fetching {}", url);
        let response = self.http.get(url).send()?;

        if !response.status().is_success() {
            return Err(FeedError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let text = response.text()?;
        debug!("fetched {} bytes from {}", text.len(), url);
        Ok(text)
    }
}

// ============================================================================
// Tests
// ============================================================================
