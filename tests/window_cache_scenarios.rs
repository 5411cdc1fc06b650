use std::sync::Arc;

use chrono::{DateTime, Utc};
use wellcalc::{
    parse_timestamp, steps, CacheError, CanonicalFactorSource, ConversionFactorCache,
    FetchKind, FetchPlan, InMemoryTelemetrySource, NamedSeries, TagRef, TelemetryError,
    WindowCache, WindowFetcher,
};

const TAGS: [(&str, &str); 3] = [("t1", "p_buf"), ("t2", "t_buf"), ("t3", "q_liq")];

fn t0() -> DateTime<Utc> {
    parse_timestamp("2023-11-20T13:00:00.000Z").unwrap()
}

fn at(offset: i64) -> DateTime<Utc> {
    t0() + steps(offset)
}

/// Deterministic value per tag and instant so any two windows over the same
/// bounds must agree bit for bit.
fn reading(tag_index: usize, ts: DateTime<Utc>) -> f64 {
    (tag_index as f64 + 1.0) * 100.0 + (ts - t0()).num_seconds() as f64 / 30.0
}

fn slice(from: i64, to: i64) -> Vec<NamedSeries> {
    TAGS.iter()
        .enumerate()
        .map(|(index, (id, name))| {
            NamedSeries::from_samples(
                *id,
                *name,
                (from..=to).map(|offset| (at(offset), reading(index, at(offset)))),
            )
            .unwrap()
        })
        .collect()
}

fn apply(cache: &WindowCache, from: i64, to: i64) -> FetchPlan {
    let plan = cache.reconcile("w1", at(from), at(to)).unwrap();
    let fetched = match plan.range() {
        Some((start, end)) => slice(
            (start - t0()).num_seconds() / 30,
            (end - t0()).num_seconds() / 30,
        ),
        None => Vec::new(),
    };
    cache.merge("w1", at(from), at(to), fetched).unwrap();
    plan
}

fn assert_consistent(cache: &WindowCache) {
    let window = cache.window("w1").unwrap();
    let first = &window.series[0];
    for series in &window.series {
        assert_eq!(series.len(), first.len());
        assert_eq!(series.time_start, first.time_start);
        assert_eq!(series.time_end, first.time_end);
        assert_eq!(series.values.len(), series.timestamps.len());
    }
}

#[test]
fn empty_cache_fetches_the_whole_request() {
    let cache = WindowCache::new();
    let plan = apply(&cache, 0, 4);

    assert_eq!(plan.kind(), Some(FetchKind::Full));
    assert_eq!(plan.range(), Some((at(0), at(4))));
    assert_eq!(cache.window("w1").unwrap().len(), 5);
    assert_consistent(&cache);
}

#[test]
fn one_step_forward_is_a_single_sample_right_extension() {
    let cache = WindowCache::new();
    apply(&cache, 0, 4);
    let plan = apply(&cache, 1, 5);

    assert_eq!(plan.kind(), Some(FetchKind::RightExtension));
    assert_eq!(plan.range(), Some((at(5), at(5))));
    let window = cache.window("w1").unwrap();
    assert_eq!(window.len(), 5);
    assert_eq!(window.time_start(), Some(at(1)));
    assert_eq!(window.time_end(), Some(at(5)));
    assert_consistent(&cache);
}

#[test]
fn two_steps_back_is_a_left_extension() {
    let cache = WindowCache::new();
    apply(&cache, 0, 4);
    let plan = apply(&cache, -2, 2);

    assert_eq!(plan.kind(), Some(FetchKind::LeftExtension));
    assert_eq!(plan.range(), Some((at(-2), at(-1))));
    let window = cache.window("w1").unwrap();
    assert_eq!(window.len(), 5);
    assert_eq!(window.time_start(), Some(at(-2)));
    assert_eq!(window.time_end(), Some(at(2)));
    assert_consistent(&cache);
}

#[test]
fn disjoint_request_is_a_full_miss() {
    let cache = WindowCache::new();
    apply(&cache, 0, 4);
    let plan = cache.reconcile("w1", at(10), at(14)).unwrap();

    assert_eq!(plan.kind(), Some(FetchKind::Full));
    assert_eq!(plan.range(), Some((at(10), at(14))));
}

#[test]
fn left_then_right_matches_a_direct_fetch() {
    let walked = WindowCache::new();
    apply(&walked, 0, 4);
    apply(&walked, -3, 1);
    apply(&walked, 0, 4);

    let direct = WindowCache::new();
    apply(&direct, 0, 4);

    assert_eq!(walked.window("w1"), direct.window("w1"));
}

#[test]
fn repeating_an_applied_merge_leaves_the_cache_unchanged() {
    let cache = WindowCache::new();
    apply(&cache, 0, 4);
    cache.merge("w1", at(1), at(5), slice(5, 5)).unwrap();
    let once = cache.window("w1");

    let again = cache.merge("w1", at(1), at(5), slice(5, 5)).unwrap();
    assert_eq!(Some(again), once);
    assert_eq!(cache.window("w1"), once);
}

#[test]
fn slice_matching_no_shape_is_unreconcilable() {
    let cache = WindowCache::new();
    apply(&cache, 0, 4);

    let err = cache.merge("w1", at(2), at(6), slice(6, 6)).unwrap_err();
    assert!(matches!(err, CacheError::UnreconcilableRange { .. }));
    assert_eq!(cache.window("w1").unwrap().time_start(), Some(at(0)));
}

#[test]
fn extension_longer_than_the_window_is_a_full_miss() {
    let cache = WindowCache::new();
    apply(&cache, 0, 4);

    let plan = cache.reconcile("w1", at(3), at(12)).unwrap();
    assert_eq!(plan.kind(), Some(FetchKind::Full));
}

struct UnitFactors;

impl CanonicalFactorSource for UnitFactors {
    fn canonical_factor(&self, unit_id: &str) -> Result<f64, TelemetryError> {
        match unit_id {
            "kpa" => Ok(1_000.0),
            _ => Ok(1.0),
        }
    }
}

#[test]
fn fetcher_walks_a_sliding_window_against_telemetry() {
    let telemetry = InMemoryTelemetrySource::new();
    for (index, (id, _)) in TAGS.iter().enumerate() {
        telemetry.insert_series(
            id,
            (-10..=20).rev().map(|offset| (at(offset), reading(index, at(offset)))),
        );
    }
    let factors = Arc::new(ConversionFactorCache::new(Arc::new(UnitFactors)));
    let fetcher = WindowFetcher::new(
        Arc::new(telemetry),
        factors,
        Arc::new(WindowCache::new()),
    );
    let tags: Vec<TagRef> = TAGS
        .iter()
        .rev()
        .map(|(id, name)| TagRef::new(*id, *name).with_unit(if *id == "t1" { "kpa" } else { "" }))
        .collect();

    for offset in 0..6 {
        let window = fetcher
            .fetch_window("w1", &tags, at(offset), at(offset + 4))
            .unwrap();
        assert_eq!(window.len(), 5);
        assert_eq!(window.time_start(), Some(at(offset)));
        let names: Vec<&str> = window.series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["p_buf", "t_buf", "q_liq"]);
        assert_eq!(
            window.series[0].value_at(at(offset)),
            Some(reading(0, at(offset)) * 1_000.0)
        );
    }
}
