//! Step callbacks driven by the schedulers: lookahead, validate, compute.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{self, format_timestamp};
use crate::conversion::ConversionFactorCache;
use crate::store::{StoreError, TagDirectory, TagRole};
use crate::telemetry::{RawSample, TagRef, TelemetryError, TelemetrySource};
use crate::transport::TransportError;
use crate::window_fetch::{WindowFetchError, WindowFetcher};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Window(#[from] WindowFetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("calculation service failed: {0}")]
    Calculation(#[from] TransportError),
    #[error("entity {entity_key} has no {role} tags")]
    NoTags { entity_key: String, role: TagRole },
    #[error("tag {tag} of {entity_key} has no value at {time}")]
    MissingInput {
        entity_key: String,
        tag: String,
        time: String,
    },
}

/// Outcome of probing the platform for fresh data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LookaheadVerdict {
    pub tags_checked: usize,
    pub failing: Vec<String>,
}

impl LookaheadVerdict {
    pub fn passes(&self, bad_tag_tolerance: usize) -> bool {
        self.failing.len() <= bad_tag_tolerance
    }
}

/// A tag fails when its next sample is missing, has an empty value or
/// timestamp, or lands later than `check_step_after` steps past the probe.
pub fn evaluate_lookahead(
    samples: &[(String, Option<RawSample>)],
    probe: DateTime<Utc>,
    check_step_after: u32,
) -> LookaheadVerdict {
    let latest_acceptable = probe + clock::steps(i64::from(check_step_after));
    let failing = samples
        .iter()
        .filter(|(_, sample)| match sample {
            None => true,
            Some(sample) => {
                !sample.has_value()
                    || sample
                        .parsed_timestamp()
                        .map(|ts| ts > latest_acceptable)
                        .unwrap_or(true)
            }
        })
        .map(|(name, _)| name.clone())
        .collect();
    LookaheadVerdict {
        tags_checked: samples.len(),
        failing,
    }
}

pub trait StepPipeline: Send + Sync {
    fn lookahead(
        &self,
        entity_key: &str,
        probe: DateTime<Utc>,
    ) -> Result<LookaheadVerdict, PipelineError>;

    fn validate(
        &self,
        entity_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), PipelineError>;

    fn compute(&self, entity_key: &str, at: DateTime<Utc>) -> Result<(), PipelineError>;
}

pub type CalculationOutputs = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub entity_key: String,
    pub time_start: String,
    pub time_end: String,
    pub series: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub entity_key: String,
    pub time: String,
    pub inputs: BTreeMap<String, f64>,
}

/// The external physical and ML calculation services.
pub trait CalculationService: Send + Sync {
    fn validate(&self, request: &ValidationRequest) -> Result<CalculationOutputs, TransportError>;
    fn compute(&self, request: &ComputeRequest) -> Result<CalculationOutputs, TransportError>;
}

pub struct TelemetryPipeline {
    telemetry: Arc<dyn TelemetrySource>,
    directory: Arc<dyn TagDirectory>,
    fetcher: WindowFetcher,
    factors: Arc<ConversionFactorCache>,
    calculation: Arc<dyn CalculationService>,
    check_step_after: u32,
}

impl TelemetryPipeline {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        directory: Arc<dyn TagDirectory>,
        fetcher: WindowFetcher,
        factors: Arc<ConversionFactorCache>,
        calculation: Arc<dyn CalculationService>,
        check_step_after: u32,
    ) -> Self {
        Self {
            telemetry,
            directory,
            fetcher,
            factors,
            calculation,
            check_step_after,
        }
    }

    fn tags(&self, entity_key: &str, role: TagRole) -> Result<Vec<TagRef>, PipelineError> {
        let tags = self.directory.tags(entity_key, role)?;
        if tags.is_empty() {
            return Err(PipelineError::NoTags {
                entity_key: entity_key.to_string(),
                role,
            });
        }
        Ok(tags)
    }

    /// Writes every output that has a matching tag, converting back out of
    /// canonical units. Returns the number of values written.
    fn write_outputs(
        &self,
        entity_key: &str,
        role: TagRole,
        at: DateTime<Utc>,
        outputs: &CalculationOutputs,
    ) -> Result<usize, PipelineError> {
        let tags = self.directory.tags(entity_key, role)?;
        let mut written = 0;
        for tag in &tags {
            let value = outputs
                .iter()
                .find(|(name, _)| name.to_lowercase() == tag.name.to_lowercase())
                .map(|(_, value)| *value);
            let Some(value) = value else {
                warn!(
                    component = "pipeline",
                    event = "pipeline.output.missing",
                    entity_key,
                    tag = %tag.name
                );
                continue;
            };
            let factor = self.factors.factor(tag.unit_id.as_deref())?;
            let raw = if factor == 0.0 { value } else { value / factor };
            self.telemetry.write(&tag.id, at, raw)?;
            written += 1;
        }
        Ok(written)
    }
}

impl StepPipeline for TelemetryPipeline {
    fn lookahead(
        &self,
        entity_key: &str,
        probe: DateTime<Utc>,
    ) -> Result<LookaheadVerdict, PipelineError> {
        let tags = self.tags(entity_key, TagRole::Lookahead)?;
        let mut samples = Vec::with_capacity(tags.len());
        for tag in tags {
            let sample = self.telemetry.lookahead(&tag.id, probe, true)?;
            samples.push((tag.name, sample));
        }
        let verdict = evaluate_lookahead(&samples, probe, self.check_step_after);
        debug!(
            component = "pipeline",
            event = "pipeline.lookahead",
            entity_key,
            probe = %format_timestamp(probe),
            tags_checked = verdict.tags_checked,
            failing = verdict.failing.len()
        );
        Ok(verdict)
    }

    fn validate(
        &self,
        entity_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let tags = self.tags(entity_key, TagRole::Validation)?;
        let window = self.fetcher.fetch_window(entity_key, &tags, start, end)?;
        let request = ValidationRequest {
            entity_key: entity_key.to_string(),
            time_start: format_timestamp(start),
            time_end: format_timestamp(end),
            series: window
                .series
                .iter()
                .map(|s| (s.name.clone(), s.values.iter().copied().collect()))
                .collect(),
        };
        let outputs = self.calculation.validate(&request)?;
        let written = self.write_outputs(entity_key, TagRole::ValidationOutput, end, &outputs)?;
        info!(
            component = "pipeline",
            event = "pipeline.validate.finish",
            entity_key,
            time_start = %request.time_start,
            time_end = %request.time_end,
            samples = window.len(),
            written
        );
        Ok(())
    }

    fn compute(&self, entity_key: &str, at: DateTime<Utc>) -> Result<(), PipelineError> {
        let tags = self.tags(entity_key, TagRole::ComputeInput)?;
        let time = format_timestamp(at);
        let mut inputs = BTreeMap::new();
        for tag in &tags {
            let point = self.telemetry.fetch_at(&tag.id, at)?.ok_or_else(|| {
                PipelineError::MissingInput {
                    entity_key: entity_key.to_string(),
                    tag: tag.name.clone(),
                    time: time.clone(),
                }
            })?;
            let factor = self.factors.factor(tag.unit_id.as_deref())?;
            inputs.insert(tag.name.clone(), point.value * factor);
        }

        let request = ComputeRequest {
            entity_key: entity_key.to_string(),
            time,
            inputs,
        };
        let outputs = self.calculation.compute(&request)?;
        let written = self.write_outputs(entity_key, TagRole::ComputeOutput, at, &outputs)?;
        info!(
            component = "pipeline",
            event = "pipeline.compute.finish",
            entity_key,
            time = %request.time,
            inputs = request.inputs.len(),
            written
        );
        Ok(())
    }
}
