//! Walk-forward scheduling.
//!
//! Every enabled entity owns a persisted cursor. A loop advances it one step
//! at a time: confirm fresh data exists ahead of the cursor, validate the
//! trailing window, compute at the cursor, then move on or retry per the
//! error tolerance. Loops run on a bounded pool; a tick skips entities whose
//! loop is still running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::{self, format_timestamp, minus_days};
use crate::config::SchedulerConfig;
use crate::pipeline::{PipelineError, StepPipeline};
use crate::progress::EntityProgressTracker;
use crate::store::{EntityRecord, EntityStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalkStop {
    /// Lookahead found no fresh data past the cursor.
    CaughtUp,
    Disabled,
    LookaheadError,
    /// Loading or persisting the cursor failed.
    Aborted,
    Shutdown,
}

impl WalkStop {
    fn event(self) -> &'static str {
        match self {
            Self::CaughtUp => "walk.stop.caught_up",
            Self::Disabled => "walk.stop.disabled",
            Self::LookaheadError => "walk.stop.lookahead_error",
            Self::Aborted => "walk.stop.aborted",
            Self::Shutdown => "walk.stop.shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkOutcome {
    pub entity_key: String,
    pub cursor: DateTime<Utc>,
    pub computes_attempted: u32,
    pub stop: WalkStop,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub initialization: bool,
    pub started: Vec<String>,
    pub skipped_busy: Vec<String>,
    pub handles: Vec<JoinHandle<Option<WalkOutcome>>>,
}

impl TickReport {
    /// Waits for every loop started by the tick.
    pub async fn join(self) -> Vec<WalkOutcome> {
        let mut out = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(Some(outcome)) => out.push(outcome),
                Ok(None) => {}
                Err(err) => error!(
                    component = "scheduler",
                    event = "walk.join_failed",
                    error = %err
                ),
            }
        }
        out
    }
}

enum Freshness {
    Confirmed,
    CaughtUp,
}

#[derive(Clone)]
pub struct WalkForwardScheduler {
    pipeline: Arc<dyn StepPipeline>,
    store: Arc<dyn EntityStore>,
    tracker: EntityProgressTracker,
    cfg: SchedulerConfig,
    pool: Arc<Semaphore>,
    initialized: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl WalkForwardScheduler {
    pub fn new(
        pipeline: Arc<dyn StepPipeline>,
        store: Arc<dyn EntityStore>,
        tracker: EntityProgressTracker,
        cfg: SchedulerConfig,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(cfg.worker_pool_size.max(1)));
        Self {
            pipeline,
            store,
            tracker,
            cfg,
            pool,
            initialized: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tracker(&self) -> &EntityProgressTracker {
        &self.tracker
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Walks one entity forward until it catches up, gets disabled or fails.
    /// Blocking; the caller is expected to hold the entity's busy guard.
    pub fn run_entity(&self, entity_key: &str) -> WalkOutcome {
        let mut cursor = match self.store.load_cursor(entity_key) {
            Ok(Some(cursor)) => cursor,
            Ok(None) => self.cfg.default_start(),
            Err(err) => {
                error!(
                    component = "scheduler",
                    event = "walk.cursor.load_failed",
                    entity_key,
                    error = %err
                );
                return self.finish(entity_key, self.cfg.default_start(), 0, WalkStop::Aborted);
            }
        };
        self.tracker.record_cursor(entity_key, cursor);
        info!(
            component = "scheduler",
            event = "walk.start",
            entity_key,
            cursor = %format_timestamp(cursor)
        );

        let mut computes = 0u32;
        loop {
            if self.is_shutdown() {
                return self.finish(entity_key, cursor, computes, WalkStop::Shutdown);
            }

            match self.store.is_enabled(entity_key) {
                Ok(true) => {}
                Ok(false) => {
                    return self.finish(entity_key, cursor, computes, WalkStop::Disabled);
                }
                Err(err) => {
                    error!(
                        component = "scheduler",
                        event = "walk.status.load_failed",
                        entity_key,
                        error = %err
                    );
                    return self.finish(entity_key, cursor, computes, WalkStop::Aborted);
                }
            }

            match self.ensure_fresh_data(entity_key, cursor) {
                Ok(Freshness::Confirmed) => {}
                Ok(Freshness::CaughtUp) => {
                    return self.finish(entity_key, cursor, computes, WalkStop::CaughtUp);
                }
                Err(err) => {
                    warn!(
                        component = "scheduler",
                        event = "walk.lookahead.error",
                        entity_key,
                        cursor = %format_timestamp(cursor),
                        error = %err
                    );
                    return self.finish(entity_key, cursor, computes, WalkStop::LookaheadError);
                }
            }

            computes += 1;
            match self.pipeline.compute(entity_key, cursor) {
                Ok(()) => self.tracker.reset_error(entity_key),
                Err(err) => {
                    let attempt = self.tracker.increment_error(entity_key);
                    warn!(
                        component = "scheduler",
                        event = "walk.step.compute_failed",
                        entity_key,
                        cursor = %format_timestamp(cursor),
                        attempt,
                        error = %err
                    );
                }
            }

            let errors = self.tracker.error_count(entity_key);
            if errors == 0 {
                cursor += clock::step();
            } else if errors > self.cfg.retry_tolerance {
                warn!(
                    component = "scheduler",
                    event = "walk.step.skipped",
                    entity_key,
                    cursor = %format_timestamp(cursor),
                    attempts = errors
                );
                cursor += clock::step();
                self.tracker.reset_error(entity_key);
            }

            if let Err(err) = self.store.persist_cursor(entity_key, cursor) {
                error!(
                    component = "scheduler",
                    event = "walk.cursor.persist_failed",
                    entity_key,
                    cursor = %format_timestamp(cursor),
                    error = %err
                );
                return self.finish(entity_key, cursor, computes, WalkStop::Aborted);
            }
            self.tracker.record_cursor(entity_key, cursor);
        }
    }

    /// Confirms data exists ahead of the cursor. Inside the confirmed region no
    /// platform call is made; otherwise a passing lookahead validates the
    /// trailing window and extends the region to the probe.
    fn ensure_fresh_data(
        &self,
        entity_key: &str,
        cursor: DateTime<Utc>,
    ) -> Result<Freshness, PipelineError> {
        if let Some(boundary) = self.tracker.good_data_boundary(entity_key) {
            if cursor < boundary {
                return Ok(Freshness::Confirmed);
            }
        }

        let probe = cursor + clock::steps(i64::from(self.cfg.deep_check_steps));
        let verdict = self.pipeline.lookahead(entity_key, probe)?;
        if !verdict.passes(self.cfg.bad_tag_tolerance) {
            debug!(
                component = "scheduler",
                event = "walk.lookahead.stale",
                entity_key,
                probe = %format_timestamp(probe),
                failing = ?verdict.failing
            );
            return Ok(Freshness::CaughtUp);
        }

        let window_start = minus_days(cursor, self.cfg.validation_window_days);
        if let Err(err) = self.pipeline.validate(entity_key, window_start, probe) {
            warn!(
                component = "scheduler",
                event = "walk.step.validate_failed",
                entity_key,
                probe = %format_timestamp(probe),
                error = %err
            );
        }
        self.tracker.set_good_data_boundary(entity_key, probe);
        Ok(Freshness::Confirmed)
    }

    fn finish(
        &self,
        entity_key: &str,
        cursor: DateTime<Utc>,
        computes_attempted: u32,
        stop: WalkStop,
    ) -> WalkOutcome {
        info!(
            component = "scheduler",
            event = stop.event(),
            entity_key,
            cursor = %format_timestamp(cursor),
            computes_attempted
        );
        WalkOutcome {
            entity_key: entity_key.to_string(),
            cursor,
            computes_attempted,
            stop,
        }
    }

    /// Validates each entity once at its cursor, in order, skipping busy ones.
    pub fn initial_validation(&self, entities: &[EntityRecord]) -> usize {
        let mut validated = 0;
        for entity in entities {
            let Some(_guard) = self.tracker.try_acquire(&entity.key) else {
                continue;
            };
            let cursor = entity.cursor.unwrap_or_else(|| self.cfg.default_start());
            self.tracker.record_cursor(&entity.key, cursor);
            let window_start = minus_days(cursor, self.cfg.validation_window_days);
            match self.pipeline.validate(&entity.key, window_start, cursor) {
                Ok(()) => validated += 1,
                Err(err) => warn!(
                    component = "scheduler",
                    event = "walk.init.validate_failed",
                    entity_key = %entity.key,
                    error = %err
                ),
            }
        }
        validated
    }

    /// One scheduling round. The first round only runs initial validation;
    /// later rounds start a loop for every enabled entity that is not busy.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let enabled: Vec<EntityRecord> = self
            .store
            .list_entities()?
            .into_iter()
            .filter(|entity| entity.enabled)
            .collect();
        self.tracker
            .sync_entities(enabled.iter().map(|entity| entity.key.as_str()));

        let mut report = TickReport::default();
        if !self.initialized.swap(true, Ordering::SeqCst) {
            report.initialization = true;
            info!(
                component = "scheduler",
                event = "walk.init.start",
                entities = enabled.len()
            );
            let this = self.clone();
            match tokio::task::spawn_blocking(move || this.initial_validation(&enabled)).await {
                Ok(validated) => info!(
                    component = "scheduler",
                    event = "walk.init.finish",
                    validated
                ),
                Err(err) => error!(
                    component = "scheduler",
                    event = "walk.init.failed",
                    error = %err
                ),
            }
            return Ok(report);
        }

        for entity in enabled {
            let Some(guard) = self.tracker.try_acquire(&entity.key) else {
                debug!(
                    component = "scheduler",
                    event = "walk.tick.skipped_busy",
                    entity_key = %entity.key
                );
                report.skipped_busy.push(entity.key);
                continue;
            };

            report.started.push(entity.key.clone());
            let this = self.clone();
            let pool = Arc::clone(&self.pool);
            report.handles.push(tokio::spawn(async move {
                let permit = pool.acquire_owned().await.ok()?;
                let key = entity.key;
                let joined = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let _guard = guard;
                    this.run_entity(&key)
                })
                .await;
                match joined {
                    Ok(outcome) => Some(outcome),
                    Err(err) => {
                        error!(
                            component = "scheduler",
                            event = "walk.task_failed",
                            error = %err
                        );
                        None
                    }
                }
            }));
        }

        info!(
            component = "scheduler",
            event = "walk.tick",
            started = report.started.len(),
            skipped_busy = report.skipped_busy.len()
        );
        Ok(report)
    }

    /// Ticks at the configured cadence until `shutdown` is called. Loops
    /// started by a tick keep running in the background.
    pub async fn run_forever(&self) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.cfg.tick_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while !self.is_shutdown() {
            interval.tick().await;
            if self.is_shutdown() {
                break;
            }
            if let Err(err) = self.tick().await {
                error!(
                    component = "scheduler",
                    event = "walk.tick_failed",
                    error = %err
                );
            }
        }
        info!(component = "scheduler", event = "walk.shutdown");
    }
}
