// HTTP plumbing shared by vendor clients.
mod http {
    // reqwest transport and its test seam.
    pub mod client;
    // Retry classification and backoff.
    pub mod retry;
}
// Yahoo chart endpoint.
mod yahoo {
    // Client fetching daily bars.
    pub mod api_caller;
    // Defensive chart parser.
    pub mod parser;
    // Response structures for the chart endpoint.
    pub mod response;
}
// Data storage module.
mod store {
    /// Daily bar table.
    pub mod historical_bar;
    /// SQLite database interaction.
    pub mod sqlite;
    /// Allow-listed symbol tables.
    pub mod ticker_table;
}
// Settings from the environment.
mod config;
// module storing defaults
mod constants;
// Forward fill of missing days.
mod gap_fill;
// Data models.
mod model;
// Worker pool.
mod pipeline;
// Batch outcome.
mod summary;
// Symbol enumeration.
mod symbols;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::http::{client::HttpTransport, retry::RetryPolicy};
use crate::model::DateRange;
use crate::pipeline::{FetchRequest, Pipeline};
use crate::store::sqlite::StoreRouter;
use crate::symbols::TickerSource;
use crate::yahoo::api_caller::ChartClient;

// Command-line argument parser.
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

// Subcommands for the application.
#[derive(Subcommand, Debug)]
enum Commands {
    // Fetch daily history and upsert it.
    FetchHistory {
        /// Comma separated symbols, e.g. AAPL,MSFT
        #[arg(long)]
        symbols: Option<String>,
        /// Allow-listed table to read symbols from
        #[arg(long)]
        table: Option<String>,
        /// File with one symbol per line
        #[arg(long)]
        symbols_file: Option<String>,
        /// YYYY-MM-DD, defaults to five years ago
        #[arg(long)]
        start_date: Option<String>,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        end_date: Option<String>,
        /// Overrides the configured pool size
        #[arg(long)]
        workers: Option<usize>,
    },
    // Impute missing days in the stored history.
    FillGaps {
        /// Only fill the store this table routes to
        #[arg(long)]
        table: Option<String>,
    },
}

#[tokio::main]
// Main function entry point.
async fn main() {
    dotenv().ok();

    env_logger::init();

    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("Error loading configuration: {}", err);
            return;
        }
    };
    log::debug!("ticker tables: {}", config.ticker_tables.names().join(", "));

    let router = match StoreRouter::open(&config.sqlite_file, &config.store_routes) {
        Ok(router) => router,
        Err(err) => {
            log::error!("Error initializing database connection: {}", err);
            return;
        }
    };

    match args.command {
        Commands::FetchHistory {
            symbols,
            table,
            symbols_file,
            start_date,
            end_date,
            workers,
        } => {
            if let Err(err) = fetch_history(
                &config,
                router,
                TickerSource::from_parts(
                    symbols.as_deref(),
                    table.as_deref(),
                    symbols_file.as_deref(),
                ),
                (start_date, end_date),
                workers,
            )
            .await
            {
                log::error!("Error fetching historical data: {}", err);
            }
        }

        Commands::FillGaps { table } => {
            let stores = match &table {
                Some(table) => vec![router.for_table(table).clone()],
                None => router.stores(),
            };
            for store in stores {
                let path = store
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                let report = tokio::task::spawn_blocking(move || gap_fill::fill_gaps(&store)).await;
                match report {
                    Ok(Ok(report)) => match serde_json::to_string_pretty(&report) {
                        Ok(json) => println!("{json}"),
                        Err(err) => log::error!("Error encoding gap fill report: {}", err),
                    },
                    Ok(Err(err)) => log::error!("Error filling gaps in {}: {}", path, err),
                    Err(err) => log::error!("Gap fill task for {} failed: {}", path, err),
                }
            }
        }
    }
}

async fn fetch_history(
    config: &Config,
    router: StoreRouter,
    source: model::Result<TickerSource>,
    (start_date, end_date): (Option<String>, Option<String>),
    workers: Option<usize>,
) -> model::Result<()> {
    let source = source?;
    let range = DateRange::resolve(
        start_date.as_deref(),
        end_date.as_deref(),
        chrono::Utc::now(),
    )?;

    let transport = HttpTransport::new(constants::REQUEST_TIMEOUT)
        .map_err(|e| model::IngestError::Config(e.to_string()))?;
    let client = ChartClient::new(transport, &config.chart_base_url, RetryPolicy::default())?;
    let pipeline = Pipeline::new(client, router, config.ticker_tables.clone())
        .with_workers(workers.unwrap_or(config.workers))
        .with_deadline(config.batch_deadline);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, finishing jobs in flight");
            on_signal.cancel();
        }
    });

    let summary = pipeline
        .fetch_history(&FetchRequest { source, range }, cancel)
        .await?;
    println!("{}", summary.to_json());
    Ok(())
}
