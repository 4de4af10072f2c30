use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{FetchResult, Ticker};

/// Outcome of a batch as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub status: String,
    pub processed: usize,
    pub success_count: usize,
    pub bars_written: usize,
    pub failures: BTreeMap<Ticker, String>,
}

impl Summary {
    /// Tallies a set of results.
    pub fn from_results(results: impl IntoIterator<Item = FetchResult>) -> Summary {
        let mut summary = Summary {
            status: "completed".into(),
            processed: 0,
            success_count: 0,
            bars_written: 0,
            failures: BTreeMap::new(),
        };
        for result in results {
            summary.processed += 1;
            if result.success {
                summary.success_count += 1;
                summary.bars_written += result.bars_written;
            } else {
                let message = result.error.unwrap_or_else(|| "unknown error".into());
                summary.failures.insert(result.symbol, message);
            }
        }
        summary
    }

    /// Drains a closed result channel.
    pub async fn collect(mut results: mpsc::Receiver<FetchResult>) -> Summary {
        let mut drained = Vec::new();
        while let Some(result) = results.recv().await {
            drained.push(result);
        }
        Summary::from_results(drained)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}
