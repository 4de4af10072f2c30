use std::{
    collections::HashSet,
    fs::OpenOptions,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use crate::{
    model::{self, IngestError, Ticker},
    store::{sqlite::StoreRouter, ticker_table::TickerTables},
};

/// Where the symbols of a batch come from.
#[derive(Debug, Clone, PartialEq)]
pub enum TickerSource {
    Symbols(Vec<String>),
    Table(String),
    File(PathBuf),
}

impl TickerSource {
    /// Picks the first supplied source: explicit symbols, then table, then file.
    /// Comma separated symbol lists are split.
    pub fn from_parts(
        symbols: Option<&str>,
        table: Option<&str>,
        file: Option<&str>,
    ) -> model::Result<TickerSource> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|s| !s.is_empty())
        }
        if let Some(symbols) = present(symbols) {
            return Ok(TickerSource::Symbols(
                symbols.split(',').map(str::to_string).collect(),
            ));
        }
        if let Some(table) = present(table) {
            return Ok(TickerSource::Table(table.to_string()));
        }
        if let Some(file) = present(file) {
            return Ok(TickerSource::File(PathBuf::from(file)));
        }
        Err(IngestError::Config(
            "Either 'symbols' or 'table_name' parameter is required.".into(),
        ))
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            TickerSource::Table(name) => Some(name),
            _ => None,
        }
    }
}

/// Produces the deduplicated set of symbols to fetch. Order is not meaningful.
pub fn enumerate(
    source: &TickerSource,
    tables: &TickerTables,
    router: &StoreRouter,
) -> model::Result<Vec<Ticker>> {
    let raw = match source {
        TickerSource::Symbols(symbols) => symbols.clone(),
        TickerSource::Table(name) => {
            let table = tables.lookup(name)?;
            let store = router.for_table(name);
            store
                .with_conn(|conn| table.read_symbols(conn))
                .map_err(|e| {
                    IngestError::Config(format!(
                        "Error getting symbols from table {name}: {e}"
                    ))
                })?
        }
        TickerSource::File(path) => read_symbols_from_file(path)?,
    };

    let symbols = dedup(raw);
    if symbols.is_empty() {
        return Err(IngestError::Config(format!("no symbols found in {source:?}")));
    }
    Ok(symbols)
}

fn dedup(raw: Vec<String>) -> Vec<Ticker> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Reads one symbol per line; blank lines are skipped.
pub fn read_symbols_from_file(path: &Path) -> model::Result<Vec<String>> {
    if !path.exists() {
        return Err(IngestError::Config(format!(
            "File not found: {}",
            path.display()
        )));
    }

    let file = OpenOptions::new().read(true).open(path)?;
    let mut symbols = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            log::warn!("line {i} is empty");
            continue;
        }
        symbols.push(line);
    }
    Ok(symbols)
}
