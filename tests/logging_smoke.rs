use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{DateTime, Utc};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;
use wellcalc::{
    log_app_start, log_mode_selected, log_status_bind, parse_timestamp, status_router, steps,
    AppConfig, EntityProgressTracker, LoggingConfig, LookaheadVerdict, NamedSeries, PipelineError,
    SchedulerConfig, SchedulerMode, SqliteEntityStore, StepPipeline, WalkForwardScheduler,
    WalkStop, WindowCache,
};

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn t0() -> DateTime<Utc> {
    parse_timestamp("2023-11-20T13:00:00.000Z").expect("fixture timestamp should parse")
}

struct IdlePipeline;

impl StepPipeline for IdlePipeline {
    fn lookahead(
        &self,
        _entity_key: &str,
        _probe: DateTime<Utc>,
    ) -> Result<LookaheadVerdict, PipelineError> {
        Ok(LookaheadVerdict::default())
    }

    fn validate(
        &self,
        _entity_key: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    fn compute(&self, _entity_key: &str, _at: DateTime<Utc>) -> Result<(), PipelineError> {
        Ok(())
    }
}

fn series(start: DateTime<Utc>, len: i64) -> NamedSeries {
    NamedSeries::from_samples(
        "t1",
        "p_buf",
        (0..len).map(|i| (start + steps(i), i as f64)),
    )
    .expect("aligned fixture series")
}

#[test]
fn unreconcilable_merge_is_logged_as_warning() {
    let cache = WindowCache::new();
    cache
        .merge("w1", t0(), t0() + steps(2), vec![series(t0(), 3)])
        .expect("first population with exact bounds");

    let logs = capture_logs(Level::INFO, || {
        let err = cache
            .merge(
                "w1",
                t0() + steps(10),
                t0() + steps(12),
                vec![series(t0() + steps(10), 2)],
            )
            .expect_err("disjoint short slice must be rejected");
        assert!(err.to_string().contains("cannot reconcile w1"));
    });

    assert!(logs.contains("\"event\":\"cache.merge.unreconcilable\""));
    assert_eq!(
        cache.window("w1").and_then(|w| w.time_end()),
        Some(t0() + steps(2))
    );
}

#[test]
fn unknown_entity_walk_logs_load_failure_and_abort() {
    let store = Arc::new(SqliteEntityStore::open_in_memory().expect("in-memory sqlite"));
    let scheduler = WalkForwardScheduler::new(
        Arc::new(IdlePipeline),
        store,
        EntityProgressTracker::new(t0()),
        SchedulerConfig {
            task_date_start: t0(),
            ..SchedulerConfig::default()
        },
    );

    let logs = capture_logs(Level::INFO, || {
        let outcome = scheduler.run_entity("ghost");
        assert_eq!(outcome.stop, WalkStop::Aborted);
    });

    assert!(logs.contains("\"event\":\"walk.cursor.load_failed\""));
    assert!(logs.contains("\"event\":\"walk.stop.aborted\""));
}

#[test]
fn lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start(&LoggingConfig::default(), &AppConfig::default());
        log_mode_selected(SchedulerMode::FixedTime, 30_000);
        log_status_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8090));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"scheduler.mode.selected\""));
    assert!(logs.contains("\"mode\":\"fixed_time\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
}

#[test]
fn status_route_emits_request_event_at_debug() {
    let logs = capture_logs(Level::DEBUG, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let tracker = EntityProgressTracker::new(t0());
            tracker.sync_entities(["w1"]);
            let app = status_router(SchedulerMode::DataFound, tracker);

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/status")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("status request should succeed");

            assert_eq!(response.status(), StatusCode::OK);
        });
    });

    assert!(logs.contains("\"event\":\"http.status.request\""));
}
