use serde::Serialize;

use crate::{
    constants,
    model::{self, HistoricalBar},
    store::{historical_bar, sqlite::Store},
};

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct GapFillReport {
    pub symbols: usize,
    pub days_scanned: i64,
    pub filled: usize,
}

/// Forward-fills every missing `(symbol, day)` between the global first and last
/// stored day. Imputed bars repeat the previous close with zero volume, or use
/// `GAP_FILL_FALLBACK_PRICE` when the symbol has no earlier bar. Running it twice
/// writes nothing the second time.
pub fn fill_gaps(store: &Store) -> model::Result<GapFillReport> {
    store.with_conn(|conn| -> model::Result<GapFillReport> {
        let Some((first, last)) = historical_bar::date_bounds(conn)? else {
            log::info!("no bars stored, nothing to fill");
            return Ok(GapFillReport::default());
        };
        let symbols = historical_bar::distinct_symbols(conn)?;
        let missing = historical_bar::missing_days(conn, first, last)?;
        let mut report = GapFillReport {
            symbols: symbols.len(),
            days_scanned: (last - first) / constants::SECONDS_PER_DAY + 1,
            filled: 0,
        };

        // `missing` is ordered by symbol, so each chunk is one symbol's gaps.
        for gaps in missing.chunk_by(|a, b| a.0 == b.0) {
            let symbol = gaps[0].0.as_str();
            let mut bars = Vec::with_capacity(gaps.len());
            for (_, day) in gaps {
                let prior = historical_bar::prior_bar(conn, symbol, *day)?;
                if prior.is_none() {
                    log::debug!("{symbol}: no bar before {day}, using fallback price");
                }
                bars.push(HistoricalBar::imputed(symbol, *day, prior.as_ref()));
            }
            let written = historical_bar::save_bars(conn, &bars)?;
            log::info!("{symbol}: filled {written} missing days");
            report.filled += written;
        }

        log::info!(
            "gap fill done: {} symbols, {} days, {} bars imputed",
            report.symbols,
            report.days_scanned,
            report.filled
        );
        Ok(report)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400;
    const D1: i64 = 1_704_153_600;

    fn bar(symbol: &str, date: i64, close: f64, volume: i64) -> HistoricalBar {
        HistoricalBar {
            symbol: symbol.into(),
            date,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            adj_close: close,
            volume,
        }
    }

    fn seeded(bars: &[HistoricalBar]) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| historical_bar::save_bars(conn, bars))
            .unwrap();
        store
    }

    #[test]
    fn fills_single_gap_from_prior_close() {
        let store = seeded(&[bar("X", D1, 10.0, 500), bar("X", D1 + 2 * DAY, 12.0, 700)]);

        let report = fill_gaps(&store).unwrap();
        assert_eq!(report.filled, 1);
        assert_eq!(report.days_scanned, 3);

        let bars = store
            .with_conn(|conn| historical_bar::get_bars(conn, "X"))
            .unwrap();
        assert_eq!(bars.len(), 3);
        let filled = &bars[1];
        assert_eq!(filled.date, D1 + DAY);
        assert_eq!(
            (filled.open, filled.high, filled.low, filled.close),
            (10.0, 10.0, 10.0, 10.0)
        );
        assert_eq!(filled.volume, 0);

        let again = fill_gaps(&store).unwrap();
        assert_eq!(again.filled, 0);
        let count = store
            .with_conn(|conn| historical_bar::count_bars(conn, None))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn uses_fallback_when_symbol_starts_late() {
        let store = seeded(&[bar("A", D1, 50.0, 1), bar("A", D1 + DAY, 51.0, 1), bar("B", D1 + DAY, 7.0, 1)]);

        let report = fill_gaps(&store).unwrap();
        assert_eq!(report.symbols, 2);
        assert_eq!(report.filled, 1);

        let b = store
            .with_conn(|conn| historical_bar::get_bars(conn, "B"))
            .unwrap();
        assert_eq!(b[0].date, D1);
        assert_eq!(b[0].close, constants::GAP_FILL_FALLBACK_PRICE);
        assert_eq!(b[0].volume, 0);
    }

    #[test]
    fn consecutive_gaps_carry_the_same_close() {
        let store = seeded(&[bar("X", D1, 10.0, 1), bar("X", D1 + 4 * DAY, 14.0, 1)]);
        assert_eq!(fill_gaps(&store).unwrap().filled, 3);

        let closes: Vec<f64> = store
            .with_conn(|conn| historical_bar::get_bars(conn, "X"))
            .unwrap()
            .iter()
            .map(|b| b.close)
            .collect();
        assert_eq!(closes, vec![10.0, 10.0, 10.0, 10.0, 14.0]);
    }

    #[test]
    fn real_data_overwrites_imputed_rows() {
        let store = seeded(&[bar("X", D1, 10.0, 1), bar("X", D1 + 2 * DAY, 12.0, 1)]);
        fill_gaps(&store).unwrap();

        store
            .with_conn(|conn| historical_bar::save_bars(conn, &[bar("X", D1 + DAY, 11.0, 900)]))
            .unwrap();
        assert_eq!(fill_gaps(&store).unwrap().filled, 0);

        let bars = store
            .with_conn(|conn| historical_bar::get_bars(conn, "X"))
            .unwrap();
        assert_eq!(bars[1].close, 11.0);
        assert_eq!(bars[1].volume, 900);
    }

    #[test]
    fn empty_store_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(fill_gaps(&store).unwrap(), GapFillReport::default());
    }
}
