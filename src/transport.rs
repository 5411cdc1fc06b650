//! Blocking HTTP plumbing shared by the platform and calculation clients.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP client build error: {0}")]
    ClientBuild(String),
    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("HTTP request failed for {url}: {message}")]
    Request { url: String, message: String },
    #[error("unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl TransportError {
    /// Connection failures and server-side statuses are worth another attempt;
    /// client errors and malformed payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &Url) -> Result<Vec<u8>, TransportError>;
    fn post(&self, url: &Url, json_body: Option<Vec<u8>>) -> Result<Vec<u8>, TransportError>;
}

pub struct ReqwestBlockingTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingTransport {
    pub fn new(timeout_ms: u64) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| TransportError::ClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestBlockingTransport {
    fn get(&self, url: &Url) -> Result<Vec<u8>, TransportError> {
        let request = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/json");
        read_body(url, request.send())
    }

    fn post(&self, url: &Url, json_body: Option<Vec<u8>>) -> Result<Vec<u8>, TransportError> {
        let mut request = self
            .client
            .post(url.clone())
            .header(ACCEPT, "application/json");
        if let Some(body) = json_body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        read_body(url, request.send())
    }
}

fn read_body(
    url: &Url,
    sent: reqwest::Result<reqwest::blocking::Response>,
) -> Result<Vec<u8>, TransportError> {
    let response = sent.map_err(|err| TransportError::Request {
        url: url.to_string(),
        message: err.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    response
        .bytes()
        .map(|bytes| bytes.to_vec())
        .map_err(|err| TransportError::Request {
            url: url.to_string(),
            message: err.to_string(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

pub fn retry<T>(
    policy: &RetryPolicy,
    mut f: impl FnMut() -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_retries || !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = policy.backoff_ms.saturating_mul(factor);
                warn!(
                    component = "transport",
                    event = "http.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

/// `base` + `path` (+ `/id`) with query parameters encoded.
pub fn endpoint_url(
    base: &str,
    path: &str,
    id: Option<&str>,
    params: &[(&str, String)],
) -> Result<Url, TransportError> {
    let mut raw = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_matches('/')
    );
    if let Some(id) = id {
        raw.push('/');
        raw.push_str(id);
    }
    // `parse_with_params` leaves a dangling `?` when there is nothing to add.
    let parsed = if params.is_empty() {
        Url::parse(&raw)
    } else {
        Url::parse_with_params(&raw, params.iter().map(|(k, v)| (*k, v.as_str())))
    };
    parsed.map_err(|err| TransportError::InvalidUrl {
        url: raw.clone(),
        message: err.to_string(),
    })
}
