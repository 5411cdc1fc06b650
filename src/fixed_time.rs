//! Fixed-time scheduling: one shared cursor for every entity, advanced a step
//! per tick once the wall clock is a full step ahead of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::{self, correct_month_boundary, format_timestamp, minus_days};
use crate::config::SchedulerConfig;
use crate::pipeline::StepPipeline;
use crate::store::{EntityRecord, EntityStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixedTickKind {
    /// The cursor is less than one step behind the wall clock.
    Waiting,
    Initialized,
    Stepped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTickReport {
    pub kind: FixedTickKind,
    pub at: DateTime<Utc>,
    pub entities: usize,
    pub computed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct FixedTimeScheduler {
    pipeline: Arc<dyn StepPipeline>,
    store: Arc<dyn EntityStore>,
    cfg: SchedulerConfig,
    pool: Arc<Semaphore>,
    cursor: Arc<Mutex<DateTime<Utc>>>,
    initialized: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl FixedTimeScheduler {
    pub fn new(
        pipeline: Arc<dyn StepPipeline>,
        store: Arc<dyn EntityStore>,
        cfg: SchedulerConfig,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(cfg.worker_pool_size.max(1)));
        let cursor = Arc::new(Mutex::new(cfg.default_start()));
        Self {
            pipeline,
            store,
            cfg,
            pool,
            cursor,
            initialized: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        *self
            .cursor
            .lock()
            .expect("fixed-time cursor lock should not be poisoned")
    }

    fn set_cursor(&self, next: DateTime<Utc>) {
        *self
            .cursor
            .lock()
            .expect("fixed-time cursor lock should not be poisoned") = next;
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn tick(&self) -> Result<FixedTickReport, StoreError> {
        self.tick_at(Utc::now()).await
    }

    /// Runs one round as if the wall clock read `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<FixedTickReport, StoreError> {
        let at = self.cursor();
        if at >= now - clock::step() {
            return Ok(FixedTickReport {
                kind: FixedTickKind::Waiting,
                at,
                entities: 0,
                computed: 0,
                failed: 0,
            });
        }

        let entities: Vec<EntityRecord> = self
            .store
            .list_entities()?
            .into_iter()
            .filter(|entity| entity.enabled)
            .collect();
        let window_start = minus_days(at, self.cfg.validation_window_days);

        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(
                component = "fixed_time",
                event = "fixed.init.start",
                at = %format_timestamp(at),
                entities = entities.len()
            );
            let pipeline = Arc::clone(&self.pipeline);
            let keys: Vec<String> = entities.iter().map(|entity| entity.key.clone()).collect();
            let failed = tokio::task::spawn_blocking(move || {
                keys.iter()
                    .filter(|key| {
                        match pipeline.validate(key, window_start, at) {
                            Ok(()) => false,
                            Err(err) => {
                                warn!(
                                    component = "fixed_time",
                                    event = "fixed.init.validate_failed",
                                    entity_key = %key,
                                    error = %err
                                );
                                true
                            }
                        }
                    })
                    .count()
            })
            .await
            .unwrap_or_else(|err| {
                error!(
                    component = "fixed_time",
                    event = "fixed.init.failed",
                    error = %err
                );
                entities.len()
            });
            self.set_cursor(at + clock::step());
            return Ok(FixedTickReport {
                kind: FixedTickKind::Initialized,
                at,
                entities: entities.len(),
                computed: 0,
                failed,
            });
        }

        let mut tasks = JoinSet::new();
        for entity in &entities {
            let pipeline = Arc::clone(&self.pipeline);
            let pool = Arc::clone(&self.pool);
            let key = entity.key.clone();
            tasks.spawn(async move {
                let Ok(permit) = pool.acquire_owned().await else {
                    return false;
                };
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    Self::validate_then_compute(pipeline.as_ref(), &key, window_start, at)
                })
                .await
                .unwrap_or(false)
            });
        }

        let mut computed = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => computed += 1,
                _ => failed += 1,
            }
        }

        self.set_cursor(correct_month_boundary(at + clock::step()));
        info!(
            component = "fixed_time",
            event = "fixed.tick",
            at = %format_timestamp(at),
            entities = entities.len(),
            computed,
            failed
        );
        Ok(FixedTickReport {
            kind: FixedTickKind::Stepped,
            at,
            entities: entities.len(),
            computed,
            failed,
        })
    }

    /// Compute runs only after a successful validation.
    fn validate_then_compute(
        pipeline: &dyn StepPipeline,
        entity_key: &str,
        window_start: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> bool {
        if let Err(err) = pipeline.validate(entity_key, window_start, at) {
            warn!(
                component = "fixed_time",
                event = "fixed.validate_failed",
                entity_key,
                at = %format_timestamp(at),
                error = %err
            );
            return false;
        }
        match pipeline.compute(entity_key, at) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    component = "fixed_time",
                    event = "fixed.compute_failed",
                    entity_key,
                    at = %format_timestamp(at),
                    error = %err
                );
                false
            }
        }
    }

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
                    component = "fixed_time",
                    event = "fixed.tick_failed",
                    error = %err
                );
            }
        }
        info!(component = "fixed_time", event = "fixed.shutdown");
    }
}
