//! Database schema for the custodian state store.

/// Current schema version. Bump when adding migrations.
pub const SCHEMA_VERSION: i64 = 1;

/// Initial table set. Executed on every open; all statements are
/// idempotent.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suggestions (
    id TEXT PRIMARY KEY,
    file_path TEXT NOT NULL,
    description TEXT NOT NULL,
    priority TEXT NOT NULL,
    confidence REAL NOT NULL,
    current_code TEXT,
    improved_code TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    applied_at TEXT,
    error TEXT,
    attempt_id TEXT,
    branch TEXT
);
CREATE INDEX IF NOT EXISTS idx_suggestions_status ON suggestions(status);

CREATE TABLE IF NOT EXISTS attempts (
    id TEXT PRIMARY KEY,
    file_path TEXT NOT NULL,
    hash_before TEXT,
    hash_after TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    result TEXT NOT NULL,
    diff TEXT NOT NULL,
    backup_path TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_attempts_path ON attempts(file_path);

CREATE TABLE IF NOT EXISTS safety_events (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    file_path TEXT NOT NULL,
    violation TEXT NOT NULL,
    detail TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS healing_events (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    trigger_checks TEXT NOT NULL,
    actions TEXT NOT NULL,
    healed INTEGER NOT NULL,
    detail TEXT NOT NULL
);
"#;
