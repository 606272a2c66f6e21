//! SQLite persistence for the recommendation engine
//!
//! ## Tables
//!
//! - `behavior_events` - Append-only interaction log (actor + time, target indexes)
//! - `behavior_counters` - Per-actor counts kept in step with the log
//! - `feature_profiles` - One attribute map per (subject, subject type)
//! - `feature_profile_revisions` - Superseded attribute maps
//! - `recommendations` - Ranked recommendations with status and lifecycle
//!
//! Repository functions take a `&Connection`, so they compose inside a
//! `rusqlite::Transaction` (which derefs to `Connection`).

pub mod schema;
pub mod models;
pub mod behavior_events;
pub mod feature_profiles;
pub mod recommendations;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::RecommendError;

/// SQLite database shared by all stores
pub struct RecommendDb {
    conn: Mutex<Connection>,
}

impl RecommendDb {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self, RecommendError> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)?;

        // WAL for concurrent readers; other processes may hold the write lock briefly
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, RecommendError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), RecommendError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read with the shared connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, RecommendError>
    where
        F: FnOnce(&Connection) -> Result<T, RecommendError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RecommendError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run a write with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, RecommendError>
    where
        F: FnOnce(&mut Connection) -> Result<T, RecommendError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| RecommendError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, RecommendError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, RecommendError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                behavior_events: count("SELECT COUNT(*) FROM behavior_events")?,
                feature_profiles: count("SELECT COUNT(*) FROM feature_profiles")?,
                active_recommendations: count(
                    "SELECT COUNT(*) FROM recommendations WHERE lifecycle = 'active'",
                )?,
                retired_recommendations: count(
                    "SELECT COUNT(*) FROM recommendations WHERE lifecycle = 'retired'",
                )?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub behavior_events: u64,
    pub feature_profiles: u64,
    pub active_recommendations: u64,
    pub retired_recommendations: u64,
}

// Re-exports
pub use models::{
    BehaviorEvent, BehaviorEventId, BehaviorType, Clock, FeatureProfile, FixedClock, Lifecycle,
    Recommendation, RecommendationId, RecommendationStatus, SubjectId, SubjectType, SystemClock,
    TargetId, TargetType,
};
