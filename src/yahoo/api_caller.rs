use std::future::Future;

use tokio::time::sleep;
use url::Url;

use super::parser;
use crate::constants;
use crate::http::client::Transport;
use crate::http::retry::{self, RetryPolicy};
use crate::model::{self, FetchJob, HistoricalBar, IngestError};

/// Anything that can turn a `FetchJob` into parsed bars.
pub trait BarSource: Send + Sync {
    fn fetch_bars(
        &self,
        job: &FetchJob,
    ) -> impl Future<Output = model::Result<Vec<HistoricalBar>>> + Send;
}

/// Client for the vendor's historical chart endpoint.
pub struct ChartClient<T> {
    transport: T,
    base_url: Url,
    policy: RetryPolicy,
}

impl<T: Transport> ChartClient<T> {
    pub fn new(transport: T, base_url: &str, policy: RetryPolicy) -> model::Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| IngestError::Config(format!("invalid chart base url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(IngestError::Config(format!(
                "chart base url {base_url} cannot be a base"
            )));
        }
        Ok(ChartClient {
            transport,
            base_url,
            policy,
        })
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Builds `v8/finance/chart/{symbol}` with the unix-second window of the job.
    pub fn chart_url(&self, job: &FetchJob) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v8", "finance", "chart", job.symbol.as_str()]);
        }
        url.query_pairs_mut()
            .append_pair("period1", &job.start.timestamp().to_string())
            .append_pair("period2", &job.end.timestamp().to_string())
            .append_pair("interval", "1d")
            .append_pair("includeAdjustedClose", "true");
        url
    }

    /// Fetches the raw chart body for a job, retrying per the policy.
    pub async fn fetch_raw(&self, job: &FetchJob) -> model::Result<Vec<u8>> {
        let url = self.chart_url(job);
        let referer = format!("{}/quote/{}", constants::VENDOR_ORIGIN, job.symbol);
        let transport = &self.transport;
        let (url_ref, referer_ref) = (&url, referer.as_str());
        let symbol = job.symbol.as_str();

        let body = self
            .policy
            .run(|attempt| async move {
                log::debug!("GET {url_ref} for {symbol} (attempt {attempt})");
                retry::classify(transport.get(url_ref, referer_ref).await)
            })
            .await?;

        sleep(self.policy.inter_request_delay).await;
        Ok(body)
    }
}

impl<T: Transport> BarSource for ChartClient<T> {
    async fn fetch_bars(&self, job: &FetchJob) -> model::Result<Vec<HistoricalBar>> {
        let body = self.fetch_raw(job).await?;
        parser::parse_chart(&job.symbol, &body)
    }
}
