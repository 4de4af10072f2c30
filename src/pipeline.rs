use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    constants,
    model::{self, DateRange, FetchJob, FetchResult, IngestError},
    store::{historical_bar, sqlite::Store, sqlite::StoreRouter, ticker_table::TickerTables},
    summary::Summary,
    symbols::{self, TickerSource},
    yahoo::api_caller::BarSource,
};

/// A caller's request to refresh history for a set of symbols.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source: TickerSource,
    pub range: DateRange,
}

/// Fixed-size worker pool running fetch, parse and persist per symbol.
///
/// Jobs already in flight always run to completion. Cancelling the token (or
/// hitting the batch deadline) only stops workers from starting new jobs; those
/// jobs are still reported, as failures.
pub struct Pipeline<S> {
    source: Arc<S>,
    router: StoreRouter,
    tables: TickerTables,
    workers: usize,
    deadline: Option<Duration>,
}

type Queue = Arc<Mutex<mpsc::Receiver<(FetchJob, Store)>>>;

impl<S: BarSource + 'static> Pipeline<S> {
    pub fn new(source: S, router: StoreRouter, tables: TickerTables) -> Pipeline<S> {
        Pipeline {
            source: Arc::new(source),
            router,
            tables,
            workers: constants::DEFAULT_WORKERS,
            deadline: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Enumerates the symbols of `request`, runs one job per symbol and returns the
    /// batch summary. Per-symbol failures end up in the summary, never in `Err`.
    pub async fn fetch_history(
        &self,
        request: &FetchRequest,
        cancel: CancellationToken,
    ) -> model::Result<Summary> {
        // Table sources query SQLite.
        let (source, tables, router) = (
            request.source.clone(),
            self.tables.clone(),
            self.router.clone(),
        );
        let symbols =
            tokio::task::spawn_blocking(move || symbols::enumerate(&source, &tables, &router))
                .await
                .map_err(|e| IngestError::Store(format!("symbol enumeration failed: {e}")))??;
        log::info!(
            "Fetching historical data for {} symbols from {} to {}",
            symbols.len(),
            request.range.start.format("%Y-%m-%d"),
            request.range.end.format("%Y-%m-%d")
        );

        let jobs = symbols
            .into_iter()
            .map(|symbol| FetchJob {
                symbol,
                start: request.range.start,
                end: request.range.end,
            })
            .collect();
        let summary = self.run_jobs(jobs, request.source.table(), cancel).await;

        log::info!(
            "Successfully fetched and saved historical data for {} out of {} tickers",
            summary.success_count,
            summary.processed
        );
        if !summary.failures.is_empty() {
            log::warn!(
                "Encountered {} errors while fetching historical data",
                summary.failures.len()
            );
            for (i, (symbol, err)) in summary.failures.iter().take(5).enumerate() {
                log::warn!("Error {}: {}: {}", i + 1, symbol, err);
            }
        }
        Ok(summary)
    }

    /// Runs the given jobs on the pool. Exactly one result is tallied per job.
    pub async fn run_jobs(
        &self,
        jobs: Vec<FetchJob>,
        table: Option<&str>,
        cancel: CancellationToken,
    ) -> Summary {
        let job_count = jobs.len();
        let batch = cancel.child_token();
        let timer = self.deadline.map(|deadline| {
            let batch = batch.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                log::warn!("batch deadline of {deadline:?} reached, no new jobs will start");
                batch.cancel();
            })
        });

        // Both channels hold every job, so neither side ever waits on capacity.
        let (job_tx, job_rx) = mpsc::channel(job_count.max(1));
        let (result_tx, result_rx) = mpsc::channel(job_count.max(1));
        for job in jobs {
            let store = self.router.for_symbol(&job.symbol, table).clone();
            if job_tx.send((job, store)).await.is_err() {
                log::error!("job queue closed before all jobs were queued");
                break;
            }
        }
        drop(job_tx);

        let queue: Queue = Arc::new(Mutex::new(job_rx));
        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            handles.push(tokio::spawn(worker(
                id,
                Arc::clone(&self.source),
                Arc::clone(&queue),
                result_tx.clone(),
                batch.clone(),
            )));
        }
        drop(result_tx);

        for handle in handles {
            if let Err(err) = handle.await {
                log::error!("worker terminated abnormally: {err}");
            }
        }
        if let Some(timer) = timer {
            timer.abort();
        }

        Summary::collect(result_rx).await
    }
}

async fn worker<S: BarSource>(
    id: usize,
    source: Arc<S>,
    queue: Queue,
    results: mpsc::Sender<FetchResult>,
    cancel: CancellationToken,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some((job, store)) = next else {
            break;
        };

        let result = if cancel.is_cancelled() {
            FetchResult::failed(job.symbol, &IngestError::Cancelled)
        } else {
            process(id, source.as_ref(), job, store).await
        };

        if results.send(result).await.is_err() {
            log::error!("worker {id}: result channel closed");
            break;
        }
    }
    log::debug!("worker {id} exiting");
}

async fn process<S: BarSource>(id: usize, source: &S, job: FetchJob, store: Store) -> FetchResult {
    log::info!("worker {id}: processing {}", job.symbol);
    let bars = match source.fetch_bars(&job).await {
        Ok(bars) => bars,
        Err(err) => {
            log::error!("Error fetching historical data for {}: {}", job.symbol, err);
            return FetchResult::failed(job.symbol, &err);
        }
    };

    log::info!("Saving {} data points for {}", bars.len(), job.symbol);
    let saved = tokio::task::spawn_blocking(move || {
        store.with_conn(|conn| historical_bar::save_bars(conn, &bars))
    })
    .await;

    match saved {
        Ok(Ok(written)) => FetchResult::ok(job.symbol, written),
        Ok(Err(err)) => {
            let err = IngestError::Persist(err);
            log::error!("Error saving historical data for {}: {}", job.symbol, err);
            FetchResult::failed(job.symbol, &err)
        }
        Err(join) => {
            let err = IngestError::Store(format!("persist task failed: {join}"));
            log::error!("Error saving historical data for {}: {}", job.symbol, err);
            FetchResult::failed(job.symbol, &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::client::RawResponse;
    use crate::http::retry::RetryPolicy;
    use crate::model::HistoricalBar;
    use crate::yahoo::api_caller::ChartClient;
    use crate::yahoo::api_caller::tests::{ScriptedTransport, chart_body, job};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns two bars per symbol and records peak concurrency.
    #[derive(Default)]
    struct FakeSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl BarSource for FakeSource {
        async fn fetch_bars(&self, job: &FetchJob) -> model::Result<Vec<HistoricalBar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok((0..2)
                .map(|d| HistoricalBar::imputed(&job.symbol, 1_704_153_600 + d * 86_400, None))
                .collect())
        }
    }

    fn range() -> DateRange {
        DateRange {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        }
    }

    fn jobs(n: usize) -> Vec<FetchJob> {
        (0..n).map(|i| job(&format!("SYM{i}"))).collect()
    }

    fn router() -> StoreRouter {
        StoreRouter::single(Store::open_in_memory().unwrap())
    }

    fn chart_pipeline(transport: ScriptedTransport, router: StoreRouter) -> Pipeline<ChartClient<ScriptedTransport>> {
        let client =
            ChartClient::new(transport, constants::CHART_BASE_URL, RetryPolicy::immediate()).unwrap();
        Pipeline::new(client, router, TickerTables::default()).with_workers(4)
    }

    fn symbols(list: &[&str]) -> FetchRequest {
        FetchRequest {
            source: TickerSource::Symbols(list.iter().map(|s| s.to_string()).collect()),
            range: range(),
        }
    }

    #[tokio::test]
    async fn one_result_per_job_for_any_pool_size() {
        for job_count in [0, 1, 7, 25] {
            for workers in [1, 3, 20, 50] {
                let pipeline =
                    Pipeline::new(FakeSource::default(), router(), TickerTables::default())
                        .with_workers(workers);
                let summary = pipeline
                    .run_jobs(jobs(job_count), None, CancellationToken::new())
                    .await;
                assert_eq!(summary.processed, job_count, "J={job_count} N={workers}");
                assert_eq!(summary.success_count, job_count);
                assert_eq!(summary.bars_written, job_count * 2);
                assert_eq!(pipeline.source.calls.load(Ordering::SeqCst), job_count);
            }
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_pool_size() {
        let pipeline = Pipeline::new(FakeSource::default(), router(), TickerTables::default())
            .with_workers(4);
        let summary = pipeline
            .run_jobs(jobs(16), None, CancellationToken::new())
            .await;
        assert_eq!(summary.processed, 16);
        let peak = pipeline.source.peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak {peak}");
        assert!(peak >= 2, "peak {peak}");
    }

    #[tokio::test]
    async fn single_worker_matches_parallel_output() {
        let run = |workers| async move {
            let router = router();
            let pipeline = Pipeline::new(FakeSource::default(), router.clone(), TickerTables::default())
                .with_workers(workers);
            let summary = pipeline.run_jobs(jobs(6), None, CancellationToken::new()).await;
            let rows = router
                .default_store()
                .with_conn(|conn| historical_bar::count_bars(conn, None))
                .unwrap();
            (summary, rows)
        };
        assert_eq!(run(1).await, run(8).await);
    }

    #[tokio::test]
    async fn end_to_end_partial_failure() {
        let transport = ScriptedTransport::default()
            .script("AAPL", vec![Ok(RawResponse::new(200, chart_body(5)))])
            .script("BAD", vec![Ok(RawResponse::new(404, Vec::new()))]);
        let router = router();
        let pipeline = chart_pipeline(transport, router.clone());

        let summary = pipeline
            .fetch_history(&symbols(&["AAPL", "BAD"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, "completed");
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.success_count, 1);
        assert_eq!(
            summary.failures,
            BTreeMap::from([(
                "BAD".to_string(),
                "API request failed with status 404".to_string()
            )])
        );

        let store = router.default_store();
        assert_eq!(store.with_conn(|c| historical_bar::count_bars(c, Some("AAPL"))).unwrap(), 5);
        assert_eq!(store.with_conn(|c| historical_bar::count_bars(c, Some("BAD"))).unwrap(), 0);
        assert_eq!(pipeline.source.transport().calls("BAD"), 1);
    }

    #[tokio::test]
    async fn rerun_with_unchanged_data_is_idempotent() {
        let transport = ScriptedTransport::default()
            .script("AAPL", vec![Ok(RawResponse::new(200, chart_body(5)))]);
        let router = router();
        let pipeline = chart_pipeline(transport, router.clone());
        let store = router.default_store();

        pipeline
            .fetch_history(&symbols(&["AAPL"]), CancellationToken::new())
            .await
            .unwrap();
        let first = store.with_conn(|c| historical_bar::get_bars(c, "AAPL")).unwrap();

        pipeline
            .fetch_history(&symbols(&["AAPL"]), CancellationToken::new())
            .await
            .unwrap();
        let second = store.with_conn(|c| historical_bar::get_bars(c, "AAPL")).unwrap();

        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_writes_nothing() {
        let transport = ScriptedTransport::default()
            .script("AAPL", vec![Ok(RawResponse::new(429, Vec::new()))]);
        let router = router();
        let pipeline = chart_pipeline(transport, router.clone());

        let summary = pipeline
            .fetch_history(&symbols(&["AAPL"]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.success_count, 0);
        assert_eq!(
            summary.failures.get("AAPL").map(String::as_str),
            Some("rate limit exceeded after 3 retries")
        );
        let rows = router
            .default_store()
            .with_conn(|c| historical_bar::count_bars(c, None))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn symbols_are_routed_to_their_store() {
        let transport = ScriptedTransport::default()
            .script("AAPL", vec![Ok(RawResponse::new(200, chart_body(3)))])
            .script("SPXL", vec![Ok(RawResponse::new(200, chart_body(4)))]);
        let spxl = Store::open_in_memory().unwrap();
        let router = router().with_route("SPXL", spxl.clone());
        let pipeline = chart_pipeline(transport, router.clone());

        let summary = pipeline
            .fetch_history(&symbols(&["AAPL", "SPXL"]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.success_count, 2);

        let count = |store: &Store, symbol: &str| {
            store
                .with_conn(|c| historical_bar::count_bars(c, Some(symbol)))
                .unwrap()
        };
        assert_eq!(count(router.default_store(), "AAPL"), 3);
        assert_eq!(count(router.default_store(), "SPXL"), 0);
        assert_eq!(count(&spxl, "SPXL"), 4);
    }

    #[tokio::test]
    async fn cancelled_batch_still_reports_every_job() {
        let router = router();
        let pipeline = Pipeline::new(FakeSource::default(), router.clone(), TickerTables::default())
            .with_workers(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = pipeline.run_jobs(jobs(5), None, cancel).await;
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.success_count, 0);
        assert!(summary.failures.values().all(|m| m == "cancelled before start"));
        assert_eq!(pipeline.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn table_enumeration_leaves_the_runtime_free() {
        let router = router();
        router
            .default_store()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TABLE spxl_tickers (symbol TEXT);
                     INSERT INTO spxl_tickers VALUES ('SPXL'), ('SPY');",
                )
            })
            .unwrap();

        // Another thread holds the connection while the batch starts.
        let store = router.default_store().clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _conn = store.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let pipeline = Pipeline::new(FakeSource::default(), router, TickerTables::default())
            .with_workers(2);
        let request = FetchRequest {
            source: TickerSource::Table("spxl_tickers".into()),
            range: range(),
        };
        let summary = pipeline
            .fetch_history(&request, CancellationToken::new())
            .await
            .unwrap();
        ticker.abort();
        holder.join().unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.success_count, 2);
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn missing_source_is_a_config_error() {
        let pipeline = Pipeline::new(FakeSource::default(), router(), TickerTables::default());
        let request = FetchRequest {
            source: TickerSource::Symbols(vec![" ".into()]),
            range: range(),
        };
        assert!(matches!(
            pipeline.fetch_history(&request, CancellationToken::new()).await,
            Err(IngestError::Config(_))
        ));
    }
}
