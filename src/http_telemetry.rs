//! Telemetry platform client over its HTTP data-layer API.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::format_timestamp;
use crate::conversion::CanonicalFactorSource;
use crate::telemetry::{RawSample, TelemetryError, TelemetryPoint, TelemetrySource};
use crate::transport::{
    endpoint_url, retry, HttpTransport, ReqwestBlockingTransport, RetryPolicy, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryHttpConfig {
    pub base_url: String,
    pub values_path: String,
    pub value_path: String,
    pub next_value_path: String,
    pub write_path: String,
    pub uom_path: String,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for TelemetryHttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            values_path: "/udl/dfa/values".to_string(),
            value_path: "/udl/dfa/value".to_string(),
            next_value_path: "/udl/dfa/next".to_string(),
            write_path: "/udl/dfa/write".to_string(),
            uom_path: "/uom".to_string(),
            http_timeout_ms: 15_000,
            max_retries: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

impl TelemetryHttpConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_ms: self.retry_backoff_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UomPayload {
    #[serde(rename = "canonicalFactor")]
    canonical_factor: Option<f64>,
}

pub struct HttpTelemetryClient {
    cfg: TelemetryHttpConfig,
    transport: Arc<dyn HttpTransport>,
}

impl HttpTelemetryClient {
    pub fn new(cfg: TelemetryHttpConfig) -> Result<Self, TelemetryError> {
        let transport = ReqwestBlockingTransport::new(cfg.http_timeout_ms)?;
        Ok(Self::with_transport(cfg, Arc::new(transport)))
    }

    pub fn with_transport(cfg: TelemetryHttpConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self { cfg, transport }
    }

    fn get_samples(
        &self,
        path: &str,
        tag_id: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<RawSample>, TelemetryError> {
        let url = endpoint_url(&self.cfg.base_url, path, Some(tag_id), params)?;
        let body = retry(&self.cfg.retry_policy(), || self.transport.get(&url))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let samples: Vec<RawSample> =
            serde_json::from_slice(&body).map_err(|err| TransportError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        debug!(
            component = "http_telemetry",
            event = "telemetry.http.get",
            tag_id,
            path,
            samples = samples.len()
        );
        Ok(samples)
    }
}

fn to_point(tag_id: &str, sample: &RawSample) -> Result<TelemetryPoint, TelemetryError> {
    let invalid = |message: String| TelemetryError::InvalidSample {
        tag_id: tag_id.to_string(),
        message,
    };
    let timestamp = sample
        .parsed_timestamp()
        .ok_or_else(|| invalid(format!("bad timestamp {:?}", sample.timestamp)))?;
    let value = sample
        .value
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| invalid("missing value".to_string()))?
        .parse::<f64>()
        .map_err(|err| invalid(err.to_string()))?;
    Ok(TelemetryPoint { timestamp, value })
}

impl TelemetrySource for HttpTelemetryClient {
    fn fetch_range(
        &self,
        tag_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryPoint>, TelemetryError> {
        let samples = self.get_samples(
            &self.cfg.values_path,
            tag_id,
            &[
                ("timeLeft", format_timestamp(start)),
                ("timeRight", format_timestamp(end)),
            ],
        )?;
        samples
            .iter()
            .map(|sample| to_point(tag_id, sample))
            .collect()
    }

    fn fetch_at(
        &self,
        tag_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TelemetryPoint>, TelemetryError> {
        let samples =
            self.get_samples(&self.cfg.value_path, tag_id, &[("time", format_timestamp(at))])?;
        samples
            .first()
            .map(|sample| to_point(tag_id, sample))
            .transpose()
    }

    fn lookahead(
        &self,
        tag_id: &str,
        at: DateTime<Utc>,
        only_good_values: bool,
    ) -> Result<Option<RawSample>, TelemetryError> {
        let samples = self.get_samples(
            &self.cfg.next_value_path,
            tag_id,
            &[
                ("time", format_timestamp(at)),
                ("onlyGoodValues", only_good_values.to_string()),
            ],
        )?;
        Ok(samples.into_iter().next())
    }

    fn write(&self, tag_id: &str, at: DateTime<Utc>, value: f64) -> Result<(), TelemetryError> {
        let url = endpoint_url(
            &self.cfg.base_url,
            &self.cfg.write_path,
            Some(tag_id),
            &[("time", format_timestamp(at)), ("value", value.to_string())],
        )?;
        retry(&self.cfg.retry_policy(), || self.transport.post(&url, None))?;
        debug!(
            component = "http_telemetry",
            event = "telemetry.http.write",
            tag_id,
            time = %format_timestamp(at),
            value
        );
        Ok(())
    }
}

impl CanonicalFactorSource for HttpTelemetryClient {
    fn canonical_factor(&self, unit_id: &str) -> Result<f64, TelemetryError> {
        let url = endpoint_url(&self.cfg.base_url, &self.cfg.uom_path, Some(unit_id), &[])?;
        let body = retry(&self.cfg.retry_policy(), || self.transport.get(&url))?;
        let payload: UomPayload =
            serde_json::from_slice(&body).map_err(|err| TransportError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        payload
            .canonical_factor
            .ok_or_else(|| TelemetryError::MissingFactor {
                unit_id: unit_id.to_string(),
            })
    }
}
