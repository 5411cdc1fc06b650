//! Per-entity cache of aligned telemetry windows.
//!
//! Consecutive scheduler steps ask for validation windows that slide forward
//! one sample at a time. `reconcile` tells the caller which slice is actually
//! missing and `merge` stitches that slice into the cached window, shifting
//! every series of the entity together so they stay index-aligned.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{self, format_timestamp, ClockError, STEP_SECONDS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSeries {
    pub id: String,
    pub name: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub values: VecDeque<f64>,
    pub timestamps: VecDeque<DateTime<Utc>>,
}

impl NamedSeries {
    /// Builds a series from samples in any order. Samples must be non-empty
    /// and spaced by exactly one step once sorted.
    pub fn from_samples(
        id: impl Into<String>,
        name: impl Into<String>,
        samples: impl IntoIterator<Item = (DateTime<Utc>, f64)>,
    ) -> Result<Self, CacheError> {
        let id = id.into();
        let name = name.into();
        let mut samples: Vec<(DateTime<Utc>, f64)> = samples.into_iter().collect();
        samples.sort_by_key(|(ts, _)| *ts);

        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Err(CacheError::MisalignedSeries {
                series: name,
                reason: "series has no samples".to_string(),
            });
        };

        let series = Self {
            time_start: first.0,
            time_end: last.0,
            values: samples.iter().map(|(_, v)| *v).collect(),
            timestamps: samples.iter().map(|(ts, _)| *ts).collect(),
            id,
            name,
        };
        series.check_alignment()?;
        Ok(series)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn scale(&mut self, factor: f64) {
        for value in self.values.iter_mut() {
            *value *= factor;
        }
    }

    pub fn value_at(&self, ts: DateTime<Utc>) -> Option<f64> {
        let offset_ms = (ts - self.time_start).num_milliseconds();
        let step_ms = STEP_SECONDS * 1_000;
        if offset_ms < 0 || offset_ms % step_ms != 0 {
            return None;
        }
        self.values.get((offset_ms / step_ms) as usize).copied()
    }

    pub fn check_alignment(&self) -> Result<(), CacheError> {
        let misaligned = |reason: String| CacheError::MisalignedSeries {
            series: self.name.clone(),
            reason,
        };

        if self.values.len() != self.timestamps.len() {
            return Err(misaligned(format!(
                "{} values but {} timestamps",
                self.values.len(),
                self.timestamps.len()
            )));
        }
        let (Some(first), Some(last)) = (self.timestamps.front(), self.timestamps.back()) else {
            return Err(misaligned("series has no samples".to_string()));
        };
        if *first != self.time_start || *last != self.time_end {
            return Err(misaligned(format!(
                "bounds {}..={} do not match timestamps {}..={}",
                format_timestamp(self.time_start),
                format_timestamp(self.time_end),
                format_timestamp(*first),
                format_timestamp(*last)
            )));
        }
        let expected = clock::sample_count(self.time_start, self.time_end)
            .map_err(|err| misaligned(err.to_string()))?;
        if expected != self.timestamps.len() {
            return Err(misaligned(format!(
                "expected {expected} samples between bounds, found {}",
                self.timestamps.len()
            )));
        }
        for (prev, next) in self.timestamps.iter().zip(self.timestamps.iter().skip(1)) {
            if *next - *prev != clock::step() {
                return Err(misaligned(format!(
                    "gap between {} and {}",
                    format_timestamp(*prev),
                    format_timestamp(*next)
                )));
            }
        }
        Ok(())
    }

    fn refresh_bounds(&mut self) {
        if let (Some(first), Some(last)) = (self.timestamps.front(), self.timestamps.back()) {
            self.time_start = *first;
            self.time_end = *last;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedWindow {
    pub series: Vec<NamedSeries>,
}

impl CachedWindow {
    pub fn new(series: Vec<NamedSeries>) -> Self {
        Self { series }
    }

    pub fn time_start(&self) -> Option<DateTime<Utc>> {
        self.series.first().map(|s| s.time_start)
    }

    pub fn time_end(&self) -> Option<DateTime<Utc>> {
        self.series.first().map(|s| s.time_end)
    }

    /// Sample count per series.
    pub fn len(&self) -> usize {
        self.series.first().map(NamedSeries::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn series_named(&self, name: &str) -> Option<&NamedSeries> {
        self.series.iter().find(|s| same_name(&s.name, name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchKind {
    Full,
    LeftExtension,
    RightExtension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    UpToDate,
    Fetch {
        kind: FetchKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl FetchPlan {
    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            Self::UpToDate => None,
            Self::Fetch { start, end, .. } => Some((*start, *end)),
        }
    }

    pub fn kind(&self) -> Option<FetchKind> {
        match self {
            Self::UpToDate => None,
            Self::Fetch { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("cached window for {entity_key} is corrupted: no series or timestamps")]
    InvalidCacheState { entity_key: String },
    #[error(
        "tag order mismatch for {entity_key} at index {index}: cached '{expected}', fetched '{found}'"
    )]
    TagOrderMismatch {
        entity_key: String,
        index: usize,
        expected: String,
        found: String,
    },
    #[error(
        "truncated data for {entity_key}: wanted {want_start}..={want_end}, fetched {fetched}"
    )]
    TruncatedData {
        entity_key: String,
        want_start: String,
        want_end: String,
        fetched: String,
    },
    #[error(
        "cannot reconcile {entity_key}: wanted {want_start}..={want_end}, cached {cached}, fetched {fetched}"
    )]
    UnreconcilableRange {
        entity_key: String,
        want_start: String,
        want_end: String,
        cached: String,
        fetched: String,
    },
    #[error("series '{series}' is misaligned: {reason}")]
    MisalignedSeries { series: String, reason: String },
    #[error("invalid requested range: {0}")]
    InvalidRange(#[from] ClockError),
}

/// Shared store of cached windows keyed by entity.
#[derive(Debug, Default)]
pub struct WindowCache {
    windows: RwLock<HashMap<String, CachedWindow>>,
}

impl WindowCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_windows(windows: HashMap<String, CachedWindow>) -> Self {
        Self {
            windows: RwLock::new(windows),
        }
    }

    pub fn window(&self, entity_key: &str) -> Option<CachedWindow> {
        self.windows
            .read()
            .expect("window cache lock should not be poisoned")
            .get(entity_key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.windows
            .read()
            .expect("window cache lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reconcile(
        &self,
        entity_key: &str,
        want_start: DateTime<Utc>,
        want_end: DateTime<Utc>,
    ) -> Result<FetchPlan, CacheError> {
        let want_len = clock::sample_count(want_start, want_end)?;
        let guard = self
            .windows
            .read()
            .expect("window cache lock should not be poisoned");

        let full = FetchPlan::Fetch {
            kind: FetchKind::Full,
            start: want_start,
            end: want_end,
        };
        let Some(window) = guard.get(entity_key) else {
            return Ok(full);
        };
        let (c_start, c_end) = cached_bounds(entity_key, window)?;

        if want_start == c_start && want_end == c_end {
            return Ok(FetchPlan::UpToDate);
        }

        // Extensions shift a fixed-length window; a request of another length
        // (or an extension longer than the cached window) is a plain miss.
        let same_shape = want_len == window.len() && whole_steps_apart(c_start, want_start);

        if same_shape && c_start > want_start && c_start <= want_end && c_end >= want_end {
            return Ok(FetchPlan::Fetch {
                kind: FetchKind::LeftExtension,
                start: want_start,
                end: c_start - clock::step(),
            });
        }
        if same_shape && c_start <= want_start && c_end < want_end && c_end >= want_start {
            return Ok(FetchPlan::Fetch {
                kind: FetchKind::RightExtension,
                start: c_end + clock::step(),
                end: want_end,
            });
        }

        Ok(full)
    }

    pub fn merge(
        &self,
        entity_key: &str,
        want_start: DateTime<Utc>,
        want_end: DateTime<Utc>,
        fetched: Vec<NamedSeries>,
    ) -> Result<CachedWindow, CacheError> {
        let fetched_bounds = slice_bounds(&fetched)?;
        let mut guard = self
            .windows
            .write()
            .expect("window cache lock should not be poisoned");

        let Some(window) = guard.get_mut(entity_key) else {
            return match fetched_bounds {
                Some((f_start, f_end)) if f_start == want_start && f_end == want_end => {
                    let window = CachedWindow::new(fetched);
                    guard.insert(entity_key.to_string(), window.clone());
                    debug!(
                        component = "window_cache",
                        event = "cache.merge.populate",
                        entity_key,
                        samples = window.len(),
                        series = window.series.len()
                    );
                    Ok(window)
                }
                _ => Err(CacheError::TruncatedData {
                    entity_key: entity_key.to_string(),
                    want_start: format_timestamp(want_start),
                    want_end: format_timestamp(want_end),
                    fetched: describe_bounds(fetched_bounds),
                }),
            };
        };

        let (c_start, c_end) = cached_bounds(entity_key, window)?;
        if want_start == c_start && want_end == c_end {
            return Ok(window.clone());
        }

        let unreconcilable = || CacheError::UnreconcilableRange {
            entity_key: entity_key.to_string(),
            want_start: format_timestamp(want_start),
            want_end: format_timestamp(want_end),
            cached: describe_bounds(Some((c_start, c_end))),
            fetched: describe_bounds(fetched_bounds),
        };
        let Some((f_start, f_end)) = fetched_bounds else {
            return Err(unreconcilable());
        };

        if f_start == want_start && f_end == want_end {
            *window = CachedWindow::new(fetched);
            debug!(
                component = "window_cache",
                event = "cache.merge.replace",
                entity_key,
                samples = window.len()
            );
            return Ok(window.clone());
        }

        let shift = fetched.first().map(NamedSeries::len).unwrap_or(0);
        let cached_len = window.len();
        let shift_span = clock::steps(shift as i64);

        if f_start == want_start && f_end == c_start - clock::step() {
            if shift >= cached_len || c_end - shift_span != want_end {
                return Err(unreconcilable());
            }
            check_tag_order(entity_key, window, &fetched)?;
            for (stored, slice) in window.series.iter_mut().zip(fetched) {
                for (ts, value) in slice.timestamps.into_iter().zip(slice.values).rev() {
                    stored.values.pop_back();
                    stored.values.push_front(value);
                    stored.timestamps.pop_back();
                    stored.timestamps.push_front(ts);
                }
                stored.refresh_bounds();
            }
            debug!(
                component = "window_cache",
                event = "cache.merge.left",
                entity_key,
                shifted = shift
            );
            return Ok(window.clone());
        }

        if f_end == want_end && f_start == c_end + clock::step() {
            if shift >= cached_len || c_start + shift_span != want_start {
                return Err(unreconcilable());
            }
            check_tag_order(entity_key, window, &fetched)?;
            for (stored, slice) in window.series.iter_mut().zip(fetched) {
                for (ts, value) in slice.timestamps.into_iter().zip(slice.values) {
                    stored.values.pop_front();
                    stored.values.push_back(value);
                    stored.timestamps.pop_front();
                    stored.timestamps.push_back(ts);
                }
                stored.refresh_bounds();
            }
            debug!(
                component = "window_cache",
                event = "cache.merge.right",
                entity_key,
                shifted = shift
            );
            return Ok(window.clone());
        }

        let err = unreconcilable();
        warn!(
            component = "window_cache",
            event = "cache.merge.unreconcilable",
            entity_key,
            error = %err
        );
        Err(err)
    }
}

fn cached_bounds(
    entity_key: &str,
    window: &CachedWindow,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CacheError> {
    let corrupted = || CacheError::InvalidCacheState {
        entity_key: entity_key.to_string(),
    };
    let first = window.series.first().ok_or_else(corrupted)?;
    match (first.timestamps.front(), first.timestamps.back()) {
        (Some(_), Some(_)) => Ok((first.time_start, first.time_end)),
        _ => Err(corrupted()),
    }
}

/// Common bounds of a fetched slice, or `None` for an empty slice.
fn slice_bounds(
    fetched: &[NamedSeries],
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, CacheError> {
    let Some(first) = fetched.first() else {
        return Ok(None);
    };
    for series in fetched {
        series.check_alignment()?;
        if series.time_start != first.time_start || series.time_end != first.time_end {
            return Err(CacheError::MisalignedSeries {
                series: series.name.clone(),
                reason: format!(
                    "bounds {} differ from '{}' bounds {}",
                    describe_bounds(Some((series.time_start, series.time_end))),
                    first.name,
                    describe_bounds(Some((first.time_start, first.time_end)))
                ),
            });
        }
    }
    Ok(Some((first.time_start, first.time_end)))
}

fn check_tag_order(
    entity_key: &str,
    window: &CachedWindow,
    fetched: &[NamedSeries],
) -> Result<(), CacheError> {
    let count = window.series.len().max(fetched.len());
    for index in 0..count {
        let expected = window.series.get(index).map(|s| s.name.as_str());
        let found = fetched.get(index).map(|s| s.name.as_str());
        let matches = match (expected, found) {
            (Some(a), Some(b)) => same_name(a, b),
            _ => false,
        };
        if !matches {
            return Err(CacheError::TagOrderMismatch {
                entity_key: entity_key.to_string(),
                index,
                expected: expected.unwrap_or("<none>").to_string(),
                found: found.unwrap_or("<none>").to_string(),
            });
        }
    }
    Ok(())
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn whole_steps_apart(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_milliseconds() % (STEP_SECONDS * 1_000) == 0
}

fn describe_bounds(bounds: Option<(DateTime<Utc>, DateTime<Utc>)>) -> String {
    match bounds {
        Some((start, end)) => format!("{}..={}", format_timestamp(start), format_timestamp(end)),
        None => "nothing".to_string(),
    }
}
