use std::io;

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::constants;

/// Identifier of a tradable instrument as the vendor knows it.
pub type Ticker = String;

/// One day of OHLCV data for a symbol. `(symbol, date)` is the store key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalBar {
    pub symbol: Ticker, // Symbol of the asset.
    pub date: i64,      // Unix seconds, aligned to UTC midnight.
    pub open: f64,      // Opening price.
    pub high: f64,      // Highest price.
    pub low: f64,       // Lowest price.
    pub close: f64,     // Closing price.
    pub adj_close: f64, // Split and dividend adjusted close.
    pub volume: i64,    // Trading volume, zero for imputed bars.
}

impl HistoricalBar {
    /// Builds a synthetic bar for a missing day, carrying the prior close forward.
    pub fn imputed(symbol: &str, date: i64, prior: Option<&HistoricalBar>) -> HistoricalBar {
        let (close, adj_close) = match prior {
            Some(bar) => (bar.close, bar.adj_close),
            None => (
                constants::GAP_FILL_FALLBACK_PRICE,
                constants::GAP_FILL_FALLBACK_PRICE,
            ),
        };
        HistoricalBar {
            symbol: symbol.to_string(),
            date,
            open: close,
            high: close,
            low: close,
            close,
            adj_close,
            volume: 0,
        }
    }
}

/// Truncates a unix timestamp to midnight UTC of the same calendar day.
pub fn day_start(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(constants::SECONDS_PER_DAY)
}

/// Inclusive window of history to request from the vendor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Resolves optional `YYYY-MM-DD` bounds. A missing end means `now`, a missing
    /// start means `DEFAULT_LOOKBACK_YEARS` before the end.
    pub fn resolve(
        start_date: Option<&str>,
        end_date: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DateRange> {
        let end = match end_date {
            Some(s) => parse_day(s, "end_date")?,
            None => now,
        };
        let start = match start_date {
            Some(s) => parse_day(s, "start_date")?,
            None => end
                .checked_sub_months(Months::new(constants::DEFAULT_LOOKBACK_YEARS as u32 * 12))
                .ok_or_else(|| IngestError::Config("start_date out of range".into()))?,
        };
        if start > end {
            return Err(IngestError::Config(format!(
                "start_date {} is after end_date {}",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            )));
        }
        Ok(DateRange { start, end })
    }
}

fn parse_day(value: &str, field: &str) -> Result<DateTime<Utc>> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| IngestError::Config(format!("Invalid '{field}' format. Use YYYY-MM-DD.")))
}

/// A single unit of work for a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchJob {
    pub symbol: Ticker,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Outcome of one `FetchJob`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub symbol: Ticker,
    pub success: bool,
    pub bars_written: usize,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn ok(symbol: Ticker, bars_written: usize) -> Self {
        FetchResult {
            symbol,
            success: true,
            bars_written,
            error: None,
        }
    }

    pub fn failed(symbol: Ticker, err: &IngestError) -> Self {
        FetchResult {
            symbol,
            success: false,
            bars_written: 0,
            error: Some(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to fetch data after {attempts} retries: {reason}")]
    Transport { attempts: u32, reason: String },
    #[error("rate limit exceeded after {attempts} retries")]
    RateLimit { attempts: u32 },
    #[error("API request failed with status {0}")]
    HttpStatus(u16),
    #[error("{0}")]
    Parse(String),
    #[error("failed to save data: {0}")]
    Persist(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Store(String),
    #[error("cancelled before start")]
    Cancelled,
}

impl From<io::Error> for IngestError {
    fn from(value: io::Error) -> Self {
        Self::Config(value.to_string())
    }
}
