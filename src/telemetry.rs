//! Read/write contract of the telemetry platform.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::clock::{format_timestamp, parse_timestamp};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A sample exactly as the platform reported it. Lookahead checks need to see
/// missing or empty fields, so nothing is parsed up front.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(default, rename = "time", deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: Option<String>,
}

impl RawSample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp: Some(format_timestamp(timestamp)),
            value: Some(value.to_string()),
        }
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| parse_timestamp(raw).ok())
    }

    pub fn has_value(&self) -> bool {
        self.value
            .as_deref()
            .map(|raw| !raw.trim().is_empty())
            .unwrap_or(false)
    }
}

// The platform sends values as strings, but some gateways emit bare numbers.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(raw)) => Some(raw),
        Some(other) => Some(other.to_string()),
    })
}

/// A platform property (tag) attached to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagRef {
    pub id: String,
    pub name: String,
    pub unit_id: Option<String>,
}

impl TagRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            unit_id: None,
        }
    }

    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid sample for tag {tag_id}: {message}")]
    InvalidSample { tag_id: String, message: String },
    #[error("unit {unit_id} has no canonical factor")]
    MissingFactor { unit_id: String },
}

impl TelemetryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub trait TelemetrySource: Send + Sync {
    /// Samples in `[start, end]`, in whatever order the platform returns them.
    fn fetch_range(
        &self,
        tag_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryPoint>, TelemetryError>;

    fn fetch_at(
        &self,
        tag_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TelemetryPoint>, TelemetryError>;

    /// First sample at or after `at`.
    fn lookahead(
        &self,
        tag_id: &str,
        at: DateTime<Utc>,
        only_good_values: bool,
    ) -> Result<Option<RawSample>, TelemetryError>;

    fn write(&self, tag_id: &str, at: DateTime<Utc>, value: f64) -> Result<(), TelemetryError>;
}

/// Process-local telemetry used by tests and dry runs.
#[derive(Clone, Default)]
pub struct InMemoryTelemetrySource {
    inner: Arc<RwLock<InMemoryTelemetryState>>,
}

#[derive(Default)]
struct InMemoryTelemetryState {
    samples: HashMap<String, BTreeMap<DateTime<Utc>, f64>>,
    written: Vec<(String, DateTime<Utc>, f64)>,
}

impl InMemoryTelemetrySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tag_id: &str, at: DateTime<Utc>, value: f64) {
        let mut guard = self
            .inner
            .write()
            .expect("in-memory telemetry lock should not be poisoned");
        guard
            .samples
            .entry(tag_id.to_string())
            .or_default()
            .insert(at, value);
    }

    pub fn insert_series(&self, tag_id: &str, samples: impl IntoIterator<Item = (DateTime<Utc>, f64)>) {
        for (at, value) in samples {
            self.insert(tag_id, at, value);
        }
    }

    pub fn written(&self) -> Vec<(String, DateTime<Utc>, f64)> {
        self.inner
            .read()
            .expect("in-memory telemetry lock should not be poisoned")
            .written
            .clone()
    }
}

impl TelemetrySource for InMemoryTelemetrySource {
    fn fetch_range(
        &self,
        tag_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryPoint>, TelemetryError> {
        let guard = self
            .inner
            .read()
            .expect("in-memory telemetry lock should not be poisoned");
        let Some(samples) = guard.samples.get(tag_id) else {
            return Ok(Vec::new());
        };
        Ok(samples
            .range(start..=end)
            .map(|(timestamp, value)| TelemetryPoint {
                timestamp: *timestamp,
                value: *value,
            })
            .collect())
    }

    fn fetch_at(
        &self,
        tag_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TelemetryPoint>, TelemetryError> {
        let guard = self
            .inner
            .read()
            .expect("in-memory telemetry lock should not be poisoned");
        Ok(guard
            .samples
            .get(tag_id)
            .and_then(|samples| samples.get(&at))
            .map(|value| TelemetryPoint {
                timestamp: at,
                value: *value,
            }))
    }

    fn lookahead(
        &self,
        tag_id: &str,
        at: DateTime<Utc>,
        only_good_values: bool,
    ) -> Result<Option<RawSample>, TelemetryError> {
        let guard = self
            .inner
            .read()
            .expect("in-memory telemetry lock should not be poisoned");
        Ok(guard.samples.get(tag_id).and_then(|samples| {
            samples
                .range(at..)
                .find(|(_, value)| !only_good_values || value.is_finite())
                .map(|(timestamp, value)| RawSample::new(*timestamp, *value))
        }))
    }

    fn write(&self, tag_id: &str, at: DateTime<Utc>, value: f64) -> Result<(), TelemetryError> {
        let mut guard = self
            .inner
            .write()
            .expect("in-memory telemetry lock should not be poisoned");
        guard.written.push((tag_id.to_string(), at, value));
        guard
            .samples
            .entry(tag_id.to_string())
            .or_default()
            .insert(at, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::steps;

    fn t0() -> DateTime<Utc> {
        parse_timestamp("2023-11-20T13:17:00.000Z").unwrap()
    }

    #[test]
    fn raw_sample_detects_empty_fields() {
        let empty = RawSample {
            timestamp: Some(" ".to_string()),
            value: Some(String::new()),
        };
        assert!(!empty.has_value());
        assert!(empty.parsed_timestamp().is_none());

        let full = RawSample::new(t0(), 1.5);
        assert!(full.has_value());
        assert_eq!(full.parsed_timestamp(), Some(t0()));
    }

    #[test]
    fn platform_payload_decodes_into_raw_sample() {
        let payload = r#"[{"uid":"x","time":"2023-11-20T13:17:00.000Z","value":"12.5","valueQualityId":1}]"#;
        let samples: Vec<RawSample> = serde_json::from_str(payload).unwrap();
        assert_eq!(samples[0].parsed_timestamp(), Some(t0()));
        assert_eq!(samples[0].value.as_deref(), Some("12.5"));

        let numeric: Vec<RawSample> = serde_json::from_str(r#"[{"time":null,"value":3}]"#).unwrap();
        assert_eq!(numeric[0].value.as_deref(), Some("3"));
        assert!(numeric[0].timestamp.is_none());
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        let bad_gateway = TelemetryError::from(TransportError::Status {
            url: "u".to_string(),
            status: 502,
        });
        let invalid = TelemetryError::InvalidSample {
            tag_id: "t".to_string(),
            message: "NaN".to_string(),
        };
        assert!(bad_gateway.is_retryable());
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn in_memory_source_serves_ranges_and_lookahead() {
        let source = InMemoryTelemetrySource::new();
        source.insert_series("tag", (0..5).map(|i| (t0() + steps(i), i as f64)));

        let range = source.fetch_range("tag", t0() + steps(1), t0() + steps(3)).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].value, 1.0);

        let next = source.lookahead("tag", t0() + steps(4), true).unwrap().unwrap();
        assert_eq!(next.parsed_timestamp(), Some(t0() + steps(4)));
        assert!(source.lookahead("tag", t0() + steps(5), true).unwrap().is_none());

        source.write("out", t0(), 7.0).unwrap();
        assert_eq!(source.written(), vec![("out".to_string(), t0(), 7.0)]);
        assert_eq!(source.fetch_at("out", t0()).unwrap().map(|p| p.value), Some(7.0));
    }
}
