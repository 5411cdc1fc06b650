//! Persisted entity registry: scheduler status, cursor and tag roles.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::{format_timestamp, parse_timestamp};
use crate::telemetry::TagRef;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown entity {0}")]
    UnknownEntity(String),
    #[error("stored cursor for {entity_key} is invalid: {raw}")]
    InvalidCursor { entity_key: String, raw: String },
    #[error("unknown tag role '{0}'")]
    UnknownRole(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: String,
    pub name: String,
    pub enabled: bool,
    pub cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagRole {
    Lookahead,
    Validation,
    ComputeInput,
    ValidationOutput,
    ComputeOutput,
}

impl TagRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lookahead => "lookahead",
            Self::Validation => "validation",
            Self::ComputeInput => "compute_input",
            Self::ValidationOutput => "validation_output",
            Self::ComputeOutput => "compute_output",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lookahead" => Ok(Self::Lookahead),
            "validation" => Ok(Self::Validation),
            "compute_input" => Ok(Self::ComputeInput),
            "validation_output" => Ok(Self::ValidationOutput),
            "compute_output" => Ok(Self::ComputeOutput),
            _ => Err(StoreError::UnknownRole(raw.to_string())),
        }
    }
}

impl fmt::Display for TagRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait EntityStore: Send + Sync {
    fn list_entities(&self) -> Result<Vec<EntityRecord>, StoreError>;
    fn load_cursor(&self, entity_key: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
    fn persist_cursor(&self, entity_key: &str, cursor: DateTime<Utc>) -> Result<(), StoreError>;
    /// `false` for unknown entities and for entities whose scheduler is off.
    fn is_enabled(&self, entity_key: &str) -> Result<bool, StoreError>;
}

pub trait TagDirectory: Send + Sync {
    /// Tags of an entity for one role, ordered by tag id.
    fn tags(&self, entity_key: &str, role: TagRole) -> Result<Vec<TagRef>, StoreError>;
}

pub struct SqliteEntityStore {
    conn: Mutex<Connection>,
}

impl SqliteEntityStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;
        info!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_entity(&self, key: &str, name: &str, enabled: bool) -> Result<(), StoreError> {
        self.conn().execute(
            "
            INSERT INTO entities (entity_key, name, scheduler_on)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_key) DO UPDATE SET
                name = excluded.name,
                scheduler_on = excluded.scheduler_on
            ",
            params![key, name, enabled],
        )?;
        Ok(())
    }

    pub fn set_enabled(&self, key: &str, enabled: bool) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE entities SET scheduler_on = ?2 WHERE entity_key = ?1",
            params![key, enabled],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownEntity(key.to_string()));
        }
        Ok(())
    }

    pub fn add_tag(&self, entity_key: &str, role: TagRole, tag: &TagRef) -> Result<(), StoreError> {
        self.conn().execute(
            "
            INSERT INTO entity_tags (entity_key, role, tag_id, name, unit_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_key, role, tag_id) DO UPDATE SET
                name = excluded.name,
                unit_id = excluded.unit_id
            ",
            params![entity_key, role.as_str(), tag.id, tag.name, tag.unit_id],
        )?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .expect("sqlite connection lock should not be poisoned")
    }
}

impl EntityStore for SqliteEntityStore {
    fn list_entities(&self) -> Result<Vec<EntityRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT entity_key, name, scheduler_on, cursor
            FROM entities
            ORDER BY entity_key
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, name, enabled, raw_cursor) = row?;
            let cursor = decode_cursor(&key, raw_cursor)?;
            out.push(EntityRecord {
                key,
                name,
                enabled,
                cursor,
            });
        }
        Ok(out)
    }

    fn load_cursor(&self, entity_key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT cursor FROM entities WHERE entity_key = ?1",
                params![entity_key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Err(StoreError::UnknownEntity(entity_key.to_string())),
            Some(raw) => decode_cursor(entity_key, raw),
        }
    }

    fn persist_cursor(&self, entity_key: &str, cursor: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE entities SET cursor = ?2 WHERE entity_key = ?1",
            params![entity_key, format_timestamp(cursor)],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownEntity(entity_key.to_string()));
        }
        debug!(
            component = "store",
            event = "store.cursor.persisted",
            entity_key,
            cursor = %format_timestamp(cursor)
        );
        Ok(())
    }

    fn is_enabled(&self, entity_key: &str) -> Result<bool, StoreError> {
        let enabled: Option<bool> = self
            .conn()
            .query_row(
                "SELECT scheduler_on FROM entities WHERE entity_key = ?1",
                params![entity_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(enabled.unwrap_or(false))
    }
}

impl TagDirectory for SqliteEntityStore {
    fn tags(&self, entity_key: &str, role: TagRole) -> Result<Vec<TagRef>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT tag_id, name, unit_id
            FROM entity_tags
            WHERE entity_key = ?1 AND role = ?2
            ORDER BY tag_id
            ",
        )?;
        let rows = stmt.query_map(params![entity_key, role.as_str()], |row| {
            Ok(TagRef {
                id: row.get(0)?,
                name: row.get(1)?,
                unit_id: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

fn decode_cursor(
    entity_key: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|raw| {
        parse_timestamp(&raw).map_err(|_| StoreError::InvalidCursor {
            entity_key: entity_key.to_string(),
            raw,
        })
    })
    .transpose()
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS entities (
            entity_key TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            scheduler_on INTEGER NOT NULL DEFAULT 1,
            cursor TEXT
        );
        CREATE TABLE IF NOT EXISTS entity_tags (
            entity_key TEXT NOT NULL REFERENCES entities(entity_key),
            role TEXT NOT NULL,
            tag_id TEXT NOT NULL,
            name TEXT NOT NULL,
            unit_id TEXT,
            PRIMARY KEY(entity_key, role, tag_id)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}
