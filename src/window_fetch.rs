//! Cache-backed loading of an entity's validation window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::format_timestamp;
use crate::conversion::ConversionFactorCache;
use crate::telemetry::{TagRef, TelemetryError, TelemetrySource};
use crate::window_cache::{CacheError, CachedWindow, FetchPlan, NamedSeries, WindowCache};

#[derive(Debug, Error)]
pub enum WindowFetchError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("entity {entity_key} has no tags to fetch")]
    NoTags { entity_key: String },
    #[error("no data for tag {tag} between {start} and {end}")]
    NoData {
        tag: String,
        start: String,
        end: String,
    },
    #[error("tag {tag} returned {found}, expected {expected}")]
    BoundsMismatch {
        tag: String,
        expected: String,
        found: String,
    },
}

pub struct WindowFetcher {
    telemetry: Arc<dyn TelemetrySource>,
    factors: Arc<ConversionFactorCache>,
    cache: Arc<WindowCache>,
}

impl WindowFetcher {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        factors: Arc<ConversionFactorCache>,
        cache: Arc<WindowCache>,
    ) -> Self {
        Self {
            telemetry,
            factors,
            cache,
        }
    }

    pub fn cache(&self) -> &WindowCache {
        &self.cache
    }

    /// Returns the aligned window `[start, end]` for `tags`, fetching only the
    /// slice the cache does not already hold. Series come back ordered by tag id.
    pub fn fetch_window(
        &self,
        entity_key: &str,
        tags: &[TagRef],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CachedWindow, WindowFetchError> {
        if tags.is_empty() {
            return Err(WindowFetchError::NoTags {
                entity_key: entity_key.to_string(),
            });
        }

        let plan = self.cache.reconcile(entity_key, start, end)?;
        let (kind, slice_start, slice_end) = match plan {
            FetchPlan::UpToDate => {
                debug!(
                    component = "window_fetch",
                    event = "window.fetch.cached",
                    entity_key
                );
                return Ok(self.cache.merge(entity_key, start, end, Vec::new())?);
            }
            FetchPlan::Fetch { kind, start, end } => (kind, start, end),
        };

        let mut ordered: Vec<&TagRef> = tags.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut fetched = Vec::with_capacity(ordered.len());
        for tag in ordered {
            fetched.push(self.fetch_series(tag, slice_start, slice_end)?);
        }

        let window = self.cache.merge(entity_key, start, end, fetched)?;
        info!(
            component = "window_fetch",
            event = "window.fetch.merged",
            entity_key,
            kind = ?kind,
            slice_start = %format_timestamp(slice_start),
            slice_end = %format_timestamp(slice_end),
            samples = window.len()
        );
        Ok(window)
    }

    fn fetch_series(
        &self,
        tag: &TagRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<NamedSeries, WindowFetchError> {
        let mut points = self.telemetry.fetch_range(&tag.id, start, end)?;
        if points.is_empty() {
            return Err(WindowFetchError::NoData {
                tag: tag.name.clone(),
                start: format_timestamp(start),
                end: format_timestamp(end),
            });
        }

        points.sort_by_key(|point| point.timestamp);
        let before = points.len();
        points.dedup_by_key(|point| point.timestamp);
        if points.len() != before {
            debug!(
                component = "window_fetch",
                event = "window.fetch.duplicates_removed",
                tag = %tag.name,
                removed = before - points.len()
            );
        }

        let mut series = NamedSeries::from_samples(
            tag.id.clone(),
            tag.name.clone(),
            points.iter().map(|point| (point.timestamp, point.value)),
        )?;
        if series.time_start != start || series.time_end != end {
            return Err(WindowFetchError::BoundsMismatch {
                tag: tag.name.clone(),
                expected: format!("{}..={}", format_timestamp(start), format_timestamp(end)),
                found: format!(
                    "{}..={}",
                    format_timestamp(series.time_start),
                    format_timestamp(series.time_end)
                ),
            });
        }

        let factor = self.factors.factor(tag.unit_id.as_deref())?;
        series.scale(factor);
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{parse_timestamp, steps};
    use crate::conversion::CanonicalFactorSource;
    use crate::telemetry::{InMemoryTelemetrySource, RawSample, TelemetryPoint};
    use crate::window_cache::FetchKind;
    use std::sync::Mutex;

    struct FixedFactors;

    impl CanonicalFactorSource for FixedFactors {
        fn canonical_factor(&self, _unit_id: &str) -> Result<f64, TelemetryError> {
            Ok(10.0)
        }
    }

    /// Records every range request before delegating.
    struct RecordingSource {
        inner: InMemoryTelemetrySource,
        ranges: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    }

    impl TelemetrySource for RecordingSource {
        fn fetch_range(
            &self,
            tag_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<TelemetryPoint>, TelemetryError> {
            self.ranges
                .lock()
                .unwrap()
                .push((tag_id.to_string(), start, end));
            let mut points = self.inner.fetch_range(tag_id, start, end)?;
            points.reverse();
            Ok(points)
        }

        fn fetch_at(
            &self,
            tag_id: &str,
            at: DateTime<Utc>,
        ) -> Result<Option<TelemetryPoint>, TelemetryError> {
            self.inner.fetch_at(tag_id, at)
        }

        fn lookahead(
            &self,
            tag_id: &str,
            at: DateTime<Utc>,
            only_good_values: bool,
        ) -> Result<Option<RawSample>, TelemetryError> {
            self.inner.lookahead(tag_id, at, only_good_values)
        }

        fn write(&self, tag_id: &str, at: DateTime<Utc>, value: f64) -> Result<(), TelemetryError> {
            self.inner.write(tag_id, at, value)
        }
    }

    fn t0() -> DateTime<Utc> {
        parse_timestamp("2023-11-20T13:00:00.000Z").unwrap()
    }

    fn setup() -> (WindowFetcher, Arc<RecordingSource>) {
        let inner = InMemoryTelemetrySource::new();
        inner.insert_series("b-tag", (0..20).map(|i| (t0() + steps(i), i as f64)));
        inner.insert_series("a-tag", (0..20).map(|i| (t0() + steps(i), 100.0 + i as f64)));
        let source = Arc::new(RecordingSource {
            inner,
            ranges: Mutex::new(Vec::new()),
        });
        let fetcher = WindowFetcher::new(
            source.clone(),
            Arc::new(ConversionFactorCache::new(Arc::new(FixedFactors))),
            Arc::new(WindowCache::new()),
        );
        (fetcher, source)
    }

    fn tags() -> Vec<TagRef> {
        vec![
            TagRef::new("b-tag", "pressure").with_unit("kpa"),
            TagRef::new("a-tag", "temperature"),
        ]
    }

    #[test]
    fn first_fetch_orders_by_tag_id_and_applies_factors() {
        let (fetcher, _) = setup();
        let window = fetcher
            .fetch_window("well-1", &tags(), t0(), t0() + steps(4))
            .unwrap();

        assert_eq!(window.series[0].id, "a-tag");
        assert_eq!(window.series[1].id, "b-tag");
        assert_eq!(window.series[0].values[0], 100.0);
        assert_eq!(window.series[1].values[4], 40.0);
    }

    #[test]
    fn sliding_forward_fetches_only_the_new_sample() {
        let (fetcher, source) = setup();
        fetcher
            .fetch_window("well-1", &tags(), t0(), t0() + steps(4))
            .unwrap();
        source.ranges.lock().unwrap().clear();

        let plan = fetcher
            .cache()
            .reconcile("well-1", t0() + steps(1), t0() + steps(5))
            .unwrap();
        assert_eq!(plan.kind(), Some(FetchKind::RightExtension));

        let window = fetcher
            .fetch_window("well-1", &tags(), t0() + steps(1), t0() + steps(5))
            .unwrap();
        let ranges = source.ranges.lock().unwrap().clone();
        assert_eq!(ranges.len(), 2);
        assert!(ranges
            .iter()
            .all(|(_, start, end)| *start == t0() + steps(5) && *end == t0() + steps(5)));
        assert_eq!(window.time_start(), Some(t0() + steps(1)));
        assert_eq!(window.series[1].values.back().copied(), Some(50.0));
    }

    #[test]
    fn up_to_date_window_makes_no_requests() {
        let (fetcher, source) = setup();
        fetcher
            .fetch_window("well-1", &tags(), t0(), t0() + steps(4))
            .unwrap();
        source.ranges.lock().unwrap().clear();

        fetcher
            .fetch_window("well-1", &tags(), t0(), t0() + steps(4))
            .unwrap();
        assert!(source.ranges.lock().unwrap().is_empty());
    }

    #[test]
    fn short_upstream_series_is_rejected() {
        let (fetcher, _) = setup();
        let err = fetcher
            .fetch_window("well-1", &tags(), t0() + steps(18), t0() + steps(22))
            .unwrap_err();
        assert!(matches!(err, WindowFetchError::BoundsMismatch { .. }));
        assert!(fetcher.cache().window("well-1").is_none());
    }

    #[test]
    fn missing_upstream_data_is_no_data() {
        let (fetcher, _) = setup();
        let err = fetcher
            .fetch_window("well-1", &tags(), t0() + steps(100), t0() + steps(104))
            .unwrap_err();
        assert!(matches!(err, WindowFetchError::NoData { .. }));
    }
}
