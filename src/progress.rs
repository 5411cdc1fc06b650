//! Per-entity progress shared between walk-forward loops.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProgress {
    pub busy: bool,
    pub error_count: u32,
    pub good_data_boundary: DateTime<Utc>,
    pub cursor: DateTime<Utc>,
}

impl EntityProgress {
    fn new(default_start: DateTime<Utc>) -> Self {
        Self {
            busy: false,
            error_count: 0,
            good_data_boundary: default_start,
            cursor: default_start,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityProgressTracker {
    inner: Arc<RwLock<TrackerState>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    default_start: Option<DateTime<Utc>>,
    entities: BTreeMap<String, EntityProgress>,
}

impl TrackerState {
    fn entry(&mut self, entity_key: &str) -> &mut EntityProgress {
        let default_start = self.default_start.unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.entities
            .entry(entity_key.to_string())
            .or_insert_with(|| EntityProgress::new(default_start))
    }
}

/// Clears the busy flag of its entity when dropped.
#[derive(Debug)]
pub struct BusyGuard {
    tracker: EntityProgressTracker,
    entity_key: String,
}

impl BusyGuard {
    pub fn entity_key(&self) -> &str {
        &self.entity_key
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.tracker.set_busy(&self.entity_key, false);
    }
}

impl EntityProgressTracker {
    pub fn new(default_start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackerState {
                default_start: Some(default_start),
                entities: BTreeMap::new(),
            })),
        }
    }

    /// Registers keys that are not tracked yet. Existing progress is kept.
    pub fn sync_entities<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let mut guard = self.write();
        let before = guard.entities.len();
        for key in keys {
            guard.entry(key);
        }
        let added = guard.entities.len() - before;
        if added > 0 {
            debug!(
                component = "progress",
                event = "progress.entities.synced",
                added,
                total = guard.entities.len()
            );
        }
        added
    }

    pub fn contains(&self, entity_key: &str) -> bool {
        self.read().entities.contains_key(entity_key)
    }

    pub fn is_busy(&self, entity_key: &str) -> bool {
        self.read()
            .entities
            .get(entity_key)
            .map(|p| p.busy)
            .unwrap_or(false)
    }

    pub fn set_busy(&self, entity_key: &str, busy: bool) {
        self.write().entry(entity_key).busy = busy;
    }

    /// Marks the entity busy unless it already is; the check and the set happen
    /// under one write lock.
    pub fn try_acquire(&self, entity_key: &str) -> Option<BusyGuard> {
        let mut guard = self.write();
        let progress = guard.entry(entity_key);
        if progress.busy {
            return None;
        }
        progress.busy = true;
        Some(BusyGuard {
            tracker: self.clone(),
            entity_key: entity_key.to_string(),
        })
    }

    pub fn error_count(&self, entity_key: &str) -> u32 {
        self.read()
            .entities
            .get(entity_key)
            .map(|p| p.error_count)
            .unwrap_or(0)
    }

    pub fn increment_error(&self, entity_key: &str) -> u32 {
        let mut guard = self.write();
        let progress = guard.entry(entity_key);
        progress.error_count = progress.error_count.saturating_add(1);
        progress.error_count
    }

    pub fn reset_error(&self, entity_key: &str) {
        self.write().entry(entity_key).error_count = 0;
    }

    pub fn good_data_boundary(&self, entity_key: &str) -> Option<DateTime<Utc>> {
        self.read()
            .entities
            .get(entity_key)
            .map(|p| p.good_data_boundary)
    }

    pub fn set_good_data_boundary(&self, entity_key: &str, boundary: DateTime<Utc>) {
        self.write().entry(entity_key).good_data_boundary = boundary;
    }

    pub fn cursor(&self, entity_key: &str) -> Option<DateTime<Utc>> {
        self.read().entities.get(entity_key).map(|p| p.cursor)
    }

    pub fn record_cursor(&self, entity_key: &str, cursor: DateTime<Utc>) {
        self.write().entry(entity_key).cursor = cursor;
    }

    pub fn progress(&self, entity_key: &str) -> Option<EntityProgress> {
        self.read().entities.get(entity_key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, EntityProgress> {
        self.read().entities.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerState> {
        self.inner
            .read()
            .expect("progress tracker lock should not be poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrackerState> {
        self.inner
            .write()
            .expect("progress tracker lock should not be poisoned")
    }
}
