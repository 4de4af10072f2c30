use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use super::client::{RawResponse, RequestError};
use crate::constants;
use crate::model::IngestError;

/// Why an attempt may be repeated.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    Transport(String),
    RateLimited,
}

/// Classified outcome of a single HTTP attempt.
#[derive(Debug)]
pub enum Attempt {
    Ok(Vec<u8>),
    Retryable(RetryReason),
    Fatal(IngestError),
}

/// Maps one transport outcome onto the retry taxonomy.
pub fn classify(outcome: Result<RawResponse, RequestError>) -> Attempt {
    match outcome {
        Err(err) => Attempt::Retryable(RetryReason::Transport(err.to_string())),
        Ok(resp) => match resp.status {
            200 => Attempt::Ok(resp.body),
            429 => Attempt::Retryable(RetryReason::RateLimited),
            code => Attempt::Fatal(IngestError::HttpStatus(code)),
        },
    }
}

/// Linear backoff policy with separate units for transport failures and HTTP 429.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub transport_backoff: Duration,
    pub rate_limit_backoff: Duration,
    pub inter_request_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: constants::MAX_RETRIES,
            transport_backoff: constants::TRANSPORT_BACKOFF,
            rate_limit_backoff: constants::RATE_LIMIT_BACKOFF,
            inter_request_delay: constants::INTER_REQUEST_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Policy without any sleeping, used by tests.
    #[cfg(test)]
    pub fn immediate() -> Self {
        RetryPolicy {
            max_retries: constants::MAX_RETRIES,
            transport_backoff: Duration::ZERO,
            rate_limit_backoff: Duration::ZERO,
            inter_request_delay: Duration::ZERO,
        }
    }

    /// Delay after the given 1-based attempt failed for `reason`.
    pub fn backoff(&self, reason: &RetryReason, attempt: u32) -> Duration {
        match reason {
            RetryReason::Transport(_) => self.transport_backoff * attempt,
            RetryReason::RateLimited => self.rate_limit_backoff * attempt,
        }
    }

    /// Drives `op` until it succeeds, fails fatally or runs out of attempts.
    /// `op` receives the 1-based attempt number.
    pub async fn run<F, Fut>(&self, mut op: F) -> Result<Vec<u8>, IngestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt>,
    {
        let max = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Attempt::Ok(body) => return Ok(body),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Retryable(reason) => {
                    if attempt >= max {
                        return Err(match reason {
                            RetryReason::Transport(reason) => IngestError::Transport {
                                attempts: max,
                                reason,
                            },
                            RetryReason::RateLimited => IngestError::RateLimit { attempts: max },
                        });
                    }
                    let delay = self.backoff(&reason, attempt);
                    log::warn!("attempt {attempt} failed ({reason:?}), retrying in {delay:?}");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
