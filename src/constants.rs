use std::time::Duration;

// Number of concurrent fetch workers.
pub const DEFAULT_WORKERS: usize = 20;

// Total attempts per request, shared by transport and rate limit retries.
pub const MAX_RETRIES: u32 = 3;

// Backoff unit after a transport failure, multiplied by the attempt number.
pub const TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

// Backoff unit after an HTTP 429, multiplied by the attempt number.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(2);

// Pause after every successful fetch.
pub const INTER_REQUEST_DELAY: Duration = Duration::from_millis(100);

// Deadline of a single HTTP attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

// Default history window when no start date is given.
pub const DEFAULT_LOOKBACK_YEARS: i32 = 5;

// Price used by the gap filler when a symbol has no earlier bar.
pub const GAP_FILL_FALLBACK_PRICE: f64 = 100.0;

pub const SECONDS_PER_DAY: i64 = 86_400;

// SQLite busy timeout for the shared connection.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub const CHART_BASE_URL: &str = "https://query1.finance.yahoo.com/";

pub const VENDOR_ORIGIN: &str = "https://finance.yahoo.com";

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
