//! JSON client for the external validation and production-rate services.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::{CalculationOutputs, CalculationService, ComputeRequest, ValidationRequest};
use crate::transport::{
    endpoint_url, retry, HttpTransport, ReqwestBlockingTransport, RetryPolicy, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationHttpConfig {
    pub base_url: String,
    pub validate_path: String,
    pub compute_path: String,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CalculationHttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8082".to_string(),
            validate_path: "/validate".to_string(),
            compute_path: "/compute".to_string(),
            http_timeout_ms: 60_000,
            max_retries: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OutputsEnvelope {
    #[serde(default)]
    outputs: CalculationOutputs,
}

pub struct HttpCalculationService {
    cfg: CalculationHttpConfig,
    transport: Arc<dyn HttpTransport>,
}

impl HttpCalculationService {
    pub fn new(cfg: CalculationHttpConfig) -> Result<Self, TransportError> {
        let transport = ReqwestBlockingTransport::new(cfg.http_timeout_ms)?;
        Ok(Self::with_transport(cfg, Arc::new(transport)))
    }

    pub fn with_transport(cfg: CalculationHttpConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self { cfg, transport }
    }

    fn post<T: Serialize>(&self, path: &str, request: &T) -> Result<CalculationOutputs, TransportError> {
        let url = endpoint_url(&self.cfg.base_url, path, None, &[])?;
        let body = serde_json::to_vec(request).map_err(|err| TransportError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        let policy = RetryPolicy {
            max_retries: self.cfg.max_retries,
            backoff_ms: self.cfg.retry_backoff_ms,
        };
        let response = retry(&policy, || self.transport.post(&url, Some(body.clone())))?;
        let envelope: OutputsEnvelope =
            serde_json::from_slice(&response).map_err(|err| TransportError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        debug!(
            component = "calc_client",
            event = "calc.http.post",
            path,
            outputs = envelope.outputs.len()
        );
        Ok(envelope.outputs)
    }
}

impl CalculationService for HttpCalculationService {
    fn validate(&self, request: &ValidationRequest) -> Result<CalculationOutputs, TransportError> {
        self.post(&self.cfg.validate_path, request)
    }

    fn compute(&self, request: &ComputeRequest) -> Result<CalculationOutputs, TransportError> {
        self.post(&self.cfg.compute_path, request)
    }
}
