use std::future::Future;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use thiserror::Error;
use url::Url;

use crate::constants;

/// Transport level failure. Every variant is worth retrying.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Send(String),
    #[error("failed to read response: {0}")]
    Body(String),
}

/// Status and (already decompressed) body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        RawResponse {
            status,
            body: body.into(),
        }
    }
}

/// Issues a single GET. Implemented over reqwest in production and scripted in tests.
pub trait Transport: Send + Sync {
    fn get(
        &self,
        url: &Url,
        referer: &str,
    ) -> impl Future<Output = Result<RawResponse, RequestError>> + Send;
}

/// reqwest backed transport carrying the browser-like headers the chart endpoint expects.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<HttpTransport, RequestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(constants::USER_AGENT),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_static(constants::VENDOR_ORIGIN),
        );

        // Accept-Encoding is filled in by reqwest, which also decodes the body.
        let client = reqwest::Client::builder()
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RequestError::Send(e.to_string()))?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &Url, referer: &str) -> Result<RawResponse, RequestError> {
        let response = self
            .client
            .get(url.as_str())
            .header(header::REFERER, referer)
            .send()
            .await
            .map_err(|e| RequestError::Send(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Ok(RawResponse::new(status, Vec::new()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RequestError::Body(e.to_string()))?;
        Ok(RawResponse::new(status, body.to_vec()))
    }
}
