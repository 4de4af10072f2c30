use std::{env, path::PathBuf, time::Duration};

use crate::{
    constants,
    model::{self, IngestError},
    store::ticker_table::{SourceTable, TickerTables},
};

/// Runtime settings, read from the environment (and `.env` via dotenv).
#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_file: PathBuf,
    pub store_routes: Vec<(String, PathBuf)>,
    pub ticker_tables: TickerTables,
    pub workers: usize,
    pub chart_base_url: String,
    pub batch_deadline: Option<Duration>,
}

impl Config {
    pub fn from_env() -> model::Result<Config> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> model::Result<Config> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let sqlite_file = get("sqlite_file")
            .map(PathBuf::from)
            .ok_or_else(|| IngestError::Config("Environment variable 'sqlite_file' not set".into()))?;

        let store_routes = match get("store_routes") {
            Some(raw) => parse_routes(&raw)?,
            None => Vec::new(),
        };

        let mut ticker_tables = TickerTables::default();
        if let Some(raw) = get("ticker_tables") {
            for spec in raw.split(',').filter(|s| !s.trim().is_empty()) {
                ticker_tables.register(SourceTable::parse(spec)?);
            }
        }

        let workers = match get("workers") {
            Some(raw) => parse_positive(&raw, "workers")? as usize,
            None => constants::DEFAULT_WORKERS,
        };

        let batch_deadline = match get("batch_deadline_secs") {
            Some(raw) => Some(Duration::from_secs(parse_positive(&raw, "batch_deadline_secs")?)),
            None => None,
        };

        Ok(Config {
            sqlite_file,
            store_routes,
            ticker_tables,
            workers,
            chart_base_url: get("chart_base_url")
                .unwrap_or_else(|| constants::CHART_BASE_URL.to_string()),
            batch_deadline,
        })
    }
}

// `key=path,key=path`
fn parse_routes(raw: &str) -> model::Result<Vec<(String, PathBuf)>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, path)) if !key.trim().is_empty() && !path.trim().is_empty() => {
                Ok((key.trim().to_string(), PathBuf::from(path.trim())))
            }
            _ => Err(IngestError::Config(format!("invalid store route: {pair}"))),
        })
        .collect()
}

fn parse_positive(raw: &str, key: &str) -> model::Result<u64> {
    match raw.parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(IngestError::Config(format!(
            "'{key}' must be a positive integer, got '{raw}'"
        ))),
    }
}
