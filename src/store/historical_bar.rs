use rusqlite::{Connection, OptionalExtension, Result, Row, params};

use crate::constants;
use crate::model::HistoricalBar;

/// Initializes the bar table. `(symbol, date)` is the primary key.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS stock_historical_data (
            symbol TEXT NOT NULL,
            date INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            adj_close REAL NOT NULL,
            volume INTEGER NOT NULL CHECK (volume >= 0),
            PRIMARY KEY (symbol, date)
        );",
        [],
    )?;
    Ok(())
}

/// Upserts a batch of bars in one transaction. Either every bar is written or,
/// on the first failing row, none are. Returns the number of rows written.
pub fn save_bars(conn: &mut Connection, bars: &[HistoricalBar]) -> Result<usize> {
    if bars.is_empty() {
        return Ok(0);
    }

    let transaction = conn.transaction()?;
    {
        let mut stmt = transaction.prepare(
            "INSERT INTO stock_historical_data (symbol, date, open, high, low, close, adj_close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (symbol, date) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                adj_close = excluded.adj_close,
                volume = excluded.volume",
        )?;
        for bar in bars {
            // An error here drops the transaction, which rolls it back.
            stmt.execute(params![
                bar.symbol,
                bar.date,
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.adj_close,
                bar.volume,
            ])?;
        }
    }
    transaction.commit()?;
    Ok(bars.len())
}

fn bar_from_row(row: &Row<'_>) -> Result<HistoricalBar> {
    Ok(HistoricalBar {
        symbol: row.get(0)?,
        date: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        adj_close: row.get(6)?,
        volume: row.get(7)?,
    })
}

/// All bars of a symbol, oldest first.
#[cfg(test)]
pub fn get_bars(conn: &Connection, symbol: &str) -> Result<Vec<HistoricalBar>> {
    let mut stmt = conn.prepare(
        "SELECT symbol, date, open, high, low, close, adj_close, volume
         FROM stock_historical_data
         WHERE symbol = ?1 ORDER BY date ASC",
    )?;
    let bars = stmt.query_map(params![symbol], bar_from_row)?;
    bars.collect()
}

/// Row count for one symbol, or for the whole table.
#[cfg(test)]
pub fn count_bars(conn: &Connection, symbol: Option<&str>) -> Result<i64> {
    match symbol {
        Some(symbol) => conn.query_row(
            "SELECT COUNT(*) FROM stock_historical_data WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        ),
        None => conn.query_row("SELECT COUNT(*) FROM stock_historical_data", [], |row| {
            row.get(0)
        }),
    }
}

/// Most recent bar of `symbol` strictly before `date`.
pub fn prior_bar(conn: &Connection, symbol: &str, date: i64) -> Result<Option<HistoricalBar>> {
    conn.query_row(
        "SELECT symbol, date, open, high, low, close, adj_close, volume
         FROM stock_historical_data
         WHERE symbol = ?1 AND date < ?2
         ORDER BY date DESC LIMIT 1",
        params![symbol, date],
        bar_from_row,
    )
    .optional()
}

/// Global `(min, max)` date across all symbols, `None` when the table is empty.
pub fn date_bounds(conn: &Connection) -> Result<Option<(i64, i64)>> {
    let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MIN(date), MAX(date) FROM stock_historical_data",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(min.zip(max))
}

pub fn distinct_symbols(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT symbol FROM stock_historical_data ORDER BY symbol")?;
    let symbols = stmt.query_map([], |row| row.get(0))?;
    symbols.collect()
}

/// `(symbol, day)` pairs with no bar, for every day from `from` to `to` inclusive
/// and every symbol present in the table. Ordered by symbol, then day.
pub fn missing_days(conn: &Connection, from: i64, to: i64) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE days(day) AS (
            SELECT ?1
            UNION ALL
            SELECT day + ?3 FROM days WHERE day + ?3 <= ?2
        ),
        symbols AS (SELECT DISTINCT symbol FROM stock_historical_data)
        SELECT s.symbol, d.day
        FROM symbols s CROSS JOIN days d
        WHERE NOT EXISTS (
            SELECT 1 FROM stock_historical_data h
            WHERE h.symbol = s.symbol AND h.date = d.day
        )
        ORDER BY s.symbol, d.day",
    )?;
    let pairs = stmt.query_map(params![from, to, constants::SECONDS_PER_DAY], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    pairs.collect()
}
