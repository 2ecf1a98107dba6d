//! Custodian Database
//!
//! SQLite-backed persistent state for the gatekeeper.
//! Uses rusqlite for synchronous, single-process access; the apply
//! pipeline is serialized above this layer, so a plain `Mutex` around
//! the connection is sufficient.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{
    HealingEvent, ModResult, ModificationAttempt, Priority, SafetyEvent, SafetyViolation,
    Suggestion, SuggestionStatus,
};

use super::schema::{CREATE_TABLES, SCHEMA_VERSION};

/// The custodian's SQLite database handle.
pub struct Database {
    conn: Mutex<Connection>,
}

fn enum_from_str<T: serde::de::DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_str(&format!("\"{}\"", s)).ok()
}

impl Database {
    /// Open (or create) the database at `db_path`, apply migrations, and
    /// return the handle.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;

        // WAL for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::initialize(conn)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                params![SCHEMA_VERSION],
            )
            .context("failed to update schema version")?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ─── Suggestions ─────────────────────────────────────────────

    pub fn upsert_suggestion(&self, s: &Suggestion) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO suggestions
             (id, file_path, description, priority, confidence, current_code,
              improved_code, status, created_at, applied_at, error, attempt_id, branch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                s.id,
                s.file_path,
                s.description,
                s.priority.as_str(),
                s.confidence,
                s.current_code,
                s.improved_code,
                s.status.as_str(),
                s.created_at,
                s.applied_at,
                s.error,
                s.attempt_id,
                s.branch,
            ],
        )?;
        Ok(())
    }

    pub fn get_suggestion(&self, id: &str) -> Result<Option<Suggestion>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT id, file_path, description, priority, confidence, current_code,
                        improved_code, status, created_at, applied_at, error, attempt_id, branch
                 FROM suggestions WHERE id = ?1",
                params![id],
                row_to_suggestion,
            )
            .optional()?;
        Ok(result)
    }

    pub fn suggestions_by_status(&self, status: SuggestionStatus) -> Result<Vec<Suggestion>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, file_path, description, priority, confidence, current_code,
                    improved_code, status, created_at, applied_at, error, attempt_id, branch
             FROM suggestions WHERE status = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_suggestion)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Suggestion counts keyed by status string.
    pub fn suggestion_counts(&self) -> Result<Vec<(String, u32)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM suggestions GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Modification attempts ───────────────────────────────────

    pub fn insert_attempt(&self, a: &ModificationAttempt) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO attempts
             (id, file_path, hash_before, hash_after, timestamp, result, diff, backup_path, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                a.id,
                a.file_path,
                a.hash_before,
                a.hash_after,
                a.timestamp,
                a.result.as_str(),
                a.diff,
                a.backup_path,
                a.error,
            ],
        )?;
        Ok(())
    }

    pub fn get_attempt(&self, id: &str) -> Result<Option<ModificationAttempt>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT id, file_path, hash_before, hash_after, timestamp, result, diff, backup_path, error
                 FROM attempts WHERE id = ?1",
                params![id],
                row_to_attempt,
            )
            .optional()?;
        Ok(result)
    }

    /// Most recent attempts, newest first.
    pub fn recent_attempts(&self, limit: i64) -> Result<Vec<ModificationAttempt>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, file_path, hash_before, hash_after, timestamp, result, diff, backup_path, error
             FROM attempts ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_attempt)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent successful attempt for a path, if any.
    pub fn latest_attempt_for_path(&self, path: &str) -> Result<Option<ModificationAttempt>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT id, file_path, hash_before, hash_after, timestamp, result, diff, backup_path, error
                 FROM attempts WHERE file_path = ?1 AND result = 'success'
                 ORDER BY timestamp DESC LIMIT 1",
                params![path],
                row_to_attempt,
            )
            .optional()?;
        Ok(result)
    }

    // ─── Meta key/value store ────────────────────────────────────

    /// Persist a small flag or setting that must survive restarts
    /// (e.g. the emergency stop).
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    // ─── Safety events ───────────────────────────────────────────

    pub fn insert_safety_event(&self, e: &SafetyEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO safety_events (id, timestamp, file_path, violation, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![e.id, e.timestamp, e.file_path, e.violation.as_str(), e.detail],
        )?;
        Ok(())
    }

    pub fn recent_safety_events(&self, limit: i64) -> Result<Vec<SafetyEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, file_path, violation, detail
             FROM safety_events ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let violation: String = row.get(3)?;
                Ok(SafetyEvent {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    file_path: row.get(2)?,
                    violation: enum_from_str(&violation)
                        .unwrap_or(SafetyViolation::CriticalPathBlocked),
                    detail: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Healing events ──────────────────────────────────────────

    pub fn insert_healing_event(&self, e: &HealingEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let actions = serde_json::to_string(&e.actions)?;
        conn.execute(
            "INSERT INTO healing_events (id, timestamp, trigger_checks, actions, healed, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![e.id, e.timestamp, e.trigger, actions, e.healed as i32, e.detail],
        )?;
        Ok(())
    }

    pub fn recent_healing_events(&self, limit: i64) -> Result<Vec<HealingEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, trigger_checks, actions, healed, detail
             FROM healing_events ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let actions: String = row.get(3)?;
                Ok(HealingEvent {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    trigger: row.get(2)?,
                    actions: serde_json::from_str(&actions).unwrap_or_default(),
                    healed: row.get::<_, i32>(4)? != 0,
                    detail: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Healing attempts recorded since the given RFC 3339 timestamp.
    pub fn healing_events_since(&self, since: &str) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM healing_events WHERE timestamp > ?1",
            params![since],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_suggestion(row: &rusqlite::Row<'_>) -> rusqlite::Result<Suggestion> {
    let priority: String = row.get(3)?;
    let status: String = row.get(7)?;
    Ok(Suggestion {
        id: row.get(0)?,
        file_path: row.get(1)?,
        description: row.get(2)?,
        priority: Priority::parse(&priority).unwrap_or(Priority::Low),
        confidence: row.get(4)?,
        current_code: row.get(5)?,
        improved_code: row.get(6)?,
        status: SuggestionStatus::parse(&status).unwrap_or(SuggestionStatus::Failed),
        created_at: row.get(8)?,
        applied_at: row.get(9)?,
        error: row.get(10)?,
        attempt_id: row.get(11)?,
        branch: row.get(12)?,
    })
}

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModificationAttempt> {
    let result: String = row.get(5)?;
    Ok(ModificationAttempt {
        id: row.get(0)?,
        file_path: row.get(1)?,
        hash_before: row.get(2)?,
        hash_after: row.get(3)?,
        timestamp: row.get(4)?,
        result: enum_from_str(&result).unwrap_or(ModResult::WriteFailed),
        diff: row.get(6)?,
        backup_path: row.get(7)?,
        error: row.get(8)?,
    })
}
