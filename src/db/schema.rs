//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::RecommendError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), RecommendError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        if current_version < 2 {
            conn.execute_batch(REKEY_BEHAVIOR_COUNTERS)?;
        }
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, RecommendError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    Ok(version.unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), RecommendError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), RecommendError> {
    conn.execute_batch(BEHAVIOR_SCHEMA)?;
    conn.execute_batch(PROFILE_SCHEMA)?;
    conn.execute_batch(RECOMMENDATION_SCHEMA)?;
    Ok(())
}

/// Behavior log and its counters
const BEHAVIOR_SCHEMA: &str = r#"
-- Append-only interaction log; rows are never updated or deleted
CREATE TABLE IF NOT EXISTS behavior_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    behavior_type TEXT NOT NULL,
    weight REAL NOT NULL,
    occurred_at TEXT NOT NULL,
    -- Actor profile fingerprint, set on dismiss events
    profile_fingerprint TEXT
);

CREATE INDEX IF NOT EXISTS idx_behavior_actor_time ON behavior_events(actor_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_behavior_target ON behavior_events(target_id);

-- Per-actor counts maintained alongside each append, split by the
-- target type that identifies the actor's role
CREATE TABLE IF NOT EXISTS behavior_counters (
    actor_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    behavior_type TEXT NOT NULL,
    event_count INTEGER NOT NULL DEFAULT 0,
    last_occurred_at TEXT NOT NULL,
    PRIMARY KEY (actor_id, target_type, behavior_type)
);
"#;

/// v1 counters were keyed by actor id alone; rebuild them from the log
const REKEY_BEHAVIOR_COUNTERS: &str = r#"
BEGIN;
DROP TABLE IF EXISTS behavior_counters;
CREATE TABLE behavior_counters (
    actor_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    behavior_type TEXT NOT NULL,
    event_count INTEGER NOT NULL DEFAULT 0,
    last_occurred_at TEXT NOT NULL,
    PRIMARY KEY (actor_id, target_type, behavior_type)
);
INSERT INTO behavior_counters (actor_id, target_type, behavior_type, event_count, last_occurred_at)
    SELECT actor_id, target_type, behavior_type, COUNT(*), MAX(occurred_at)
    FROM behavior_events
    GROUP BY actor_id, target_type, behavior_type;
COMMIT;
"#;

/// Feature profiles
const PROFILE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feature_profiles (
    subject_id INTEGER NOT NULL,
    subject_type TEXT NOT NULL,
    attributes_json TEXT NOT NULL DEFAULT '{}',
    revision INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (subject_id, subject_type)
);

-- Superseded attribute sets, kept for audit
CREATE TABLE IF NOT EXISTS feature_profile_revisions (
    subject_id INTEGER NOT NULL,
    subject_type TEXT NOT NULL,
    revision INTEGER NOT NULL,
    attributes_json TEXT NOT NULL,
    superseded_at TEXT NOT NULL,
    PRIMARY KEY (subject_id, subject_type, revision)
);
"#;

/// Recommendations
const RECOMMENDATION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS recommendations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id INTEGER NOT NULL,
    subject_type TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    score REAL NOT NULL,
    rank INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    lifecycle TEXT NOT NULL DEFAULT 'active',
    batch_id TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recommendations_subject
    ON recommendations(subject_type, subject_id, status, rank);

-- At most one active recommendation per (subject, target)
CREATE UNIQUE INDEX IF NOT EXISTS idx_recommendations_active_target
    ON recommendations(subject_type, subject_id, target_id)
    WHERE lifecycle = 'active';
"#;
