use super::response::{ChartResponse, ChartResult};
use crate::model::{self, HistoricalBar, IngestError};

/// Parses a chart payload into bars ordered like the vendor's timestamp array.
///
/// The parallel arrays are zipped by position. Any index missing from one of the
/// arrays, or holding a null, is dropped instead of failing the whole symbol.
pub fn parse_chart(symbol: &str, body: &[u8]) -> model::Result<Vec<HistoricalBar>> {
    let resp: ChartResponse = serde_json::from_slice(body)
        .map_err(|e| IngestError::Parse(format!("failed to parse JSON: {e}")))?;

    if let Some(err) = resp.chart.error {
        return Err(IngestError::Parse(format!(
            "API error: {} - {}",
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        )));
    }

    let result = match resp.chart.result {
        Some(results) => match results.into_iter().next() {
            Some(result) => result,
            None => return Err(IngestError::Parse("no data returned".into())),
        },
        None => return Err(IngestError::Parse("no data returned".into())),
    };

    zip_bars(symbol, result)
}

fn zip_bars(symbol: &str, result: ChartResult) -> model::Result<Vec<HistoricalBar>> {
    let (Some(quote), Some(adj)) = (
        result.indicators.quote.first(),
        result.indicators.adjclose.first(),
    ) else {
        return Err(IngestError::Parse("no price data returned".into()));
    };

    let mut bars = Vec::with_capacity(result.timestamp.len());
    let mut skipped = 0;
    for (i, &ts) in result.timestamp.iter().enumerate() {
        let fields = (
            at(&quote.open, i),
            at(&quote.high, i),
            at(&quote.low, i),
            at(&quote.close, i),
            at(&adj.adjclose, i),
            at(&quote.volume, i),
        );
        let (Some(open), Some(high), Some(low), Some(close), Some(adj_close), Some(volume)) =
            fields
        else {
            skipped += 1;
            continue;
        };
        if volume < 0 {
            skipped += 1;
            continue;
        }

        bars.push(HistoricalBar {
            symbol: symbol.to_string(),
            date: model::day_start(ts),
            open,
            high,
            low,
            close,
            adj_close,
            volume,
        });
    }

    if skipped > 0 {
        log::debug!("{symbol}: skipped {skipped} incomplete points");
    }
    Ok(bars)
}

fn at<T: Copy>(values: &[Option<T>], i: usize) -> Option<T> {
    values.get(i).copied().flatten()
}
