//! Behavior log operations
//!
//! Events are only ever inserted. Every insert bumps the actor's row in
//! `behavior_counters` within the same transaction, which is what the
//! statistics read instead of replaying the log.
//!
//! Students and organizations share one id space. An actor's role is the
//! target type it acts on, so every per-actor read filters on both.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::models::{
    format_timestamp, timestamp_column, BehaviorEvent, BehaviorEventId, BehaviorType, SubjectId,
    SubjectType, TargetId, TargetType,
};
use crate::error::RecommendError;

/// Number of distinct targets reported in statistics
pub const RECENT_TARGETS_LIMIT: i64 = 10;

/// Input for appending an event
#[derive(Debug, Clone)]
pub struct NewBehaviorEvent {
    pub actor_id: SubjectId,
    pub target_id: TargetId,
    pub target_type: TargetType,
    pub behavior_type: BehaviorType,
    pub weight: f64,
    pub occurred_at: DateTime<Utc>,
    pub profile_fingerprint: Option<String>,
}

/// Most recent interaction with one target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTarget {
    pub target_id: TargetId,
    pub target_type: TargetType,
    pub last_behavior: BehaviorType,
    pub last_occurred_at: DateTime<Utc>,
}

/// Aggregated behavior of one actor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorStatistics {
    pub actor_id: SubjectId,
    pub actor_type: SubjectType,
    pub total_events: i64,
    pub counts_by_kind: BTreeMap<BehaviorType, i64>,
    pub recent_targets: Vec<RecentTarget>,
}

fn event_from_row(row: &Row) -> rusqlite::Result<BehaviorEvent> {
    Ok(BehaviorEvent {
        id: row.get("id")?,
        actor_id: row.get("actor_id")?,
        target_id: row.get("target_id")?,
        target_type: row.get("target_type")?,
        behavior_type: row.get("behavior_type")?,
        weight: row.get("weight")?,
        occurred_at: timestamp_column(row, "occurred_at")?,
        profile_fingerprint: row.get("profile_fingerprint")?,
    })
}

/// Append an event on an open connection or transaction
pub fn insert_event(conn: &Connection, input: &NewBehaviorEvent) -> Result<BehaviorEvent, RecommendError> {
    let occurred_at = format_timestamp(input.occurred_at);

    conn.execute(
        r#"
        INSERT INTO behavior_events (
            actor_id, target_id, target_type, behavior_type, weight, occurred_at, profile_fingerprint
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.actor_id,
            input.target_id,
            input.target_type,
            input.behavior_type,
            input.weight,
            occurred_at,
            input.profile_fingerprint,
        ],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        r#"
        INSERT INTO behavior_counters (actor_id, target_type, behavior_type, event_count, last_occurred_at)
        VALUES (?, ?, ?, 1, ?)
        ON CONFLICT (actor_id, target_type, behavior_type) DO UPDATE SET
            event_count = event_count + 1,
            last_occurred_at = MAX(last_occurred_at, excluded.last_occurred_at)
        "#,
        params![input.actor_id, input.target_type, input.behavior_type, occurred_at],
    )?;

    Ok(BehaviorEvent {
        id,
        actor_id: input.actor_id,
        target_id: input.target_id,
        target_type: input.target_type,
        behavior_type: input.behavior_type,
        weight: input.weight,
        occurred_at: input.occurred_at,
        profile_fingerprint: input.profile_fingerprint.clone(),
    })
}

/// Append an event in its own transaction
pub fn record_event(conn: &mut Connection, input: &NewBehaviorEvent) -> Result<BehaviorEvent, RecommendError> {
    let tx = conn.transaction()?;
    let event = insert_event(&tx, input)?;
    tx.commit()?;
    Ok(event)
}

/// Events of an actor, newest first
///
/// `limit = None` returns the full history.
pub fn history(
    conn: &Connection,
    actor_id: SubjectId,
    target_type: Option<TargetType>,
    limit: Option<u32>,
    offset: u32,
) -> Result<Vec<BehaviorEvent>, RecommendError> {
    let limit = limit.map(i64::from).unwrap_or(-1);

    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM behavior_events
        WHERE actor_id = ?1 AND (?2 IS NULL OR target_type = ?2)
        ORDER BY occurred_at DESC, id DESC
        LIMIT ?3 OFFSET ?4
        "#,
    )?;

    let events = stmt
        .query_map(params![actor_id, target_type, limit, offset], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Events recorded against a target, newest first
pub fn events_for_target(
    conn: &Connection,
    target_id: TargetId,
    target_type: TargetType,
) -> Result<Vec<BehaviorEvent>, RecommendError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM behavior_events
        WHERE target_id = ? AND target_type = ?
        ORDER BY occurred_at DESC, id DESC
        "#,
    )?;

    let events = stmt
        .query_map(params![target_id, target_type], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Counts per behavior kind, zero-filled
pub fn counts_by_kind(
    conn: &Connection,
    actor_id: SubjectId,
    target_type: TargetType,
) -> Result<BTreeMap<BehaviorType, i64>, RecommendError> {
    let mut counts: BTreeMap<BehaviorType, i64> =
        BehaviorType::ALL.iter().map(|kind| (*kind, 0)).collect();

    let mut stmt = conn.prepare(
        "SELECT behavior_type, event_count FROM behavior_counters WHERE actor_id = ? AND target_type = ?",
    )?;
    let rows = stmt.query_map(params![actor_id, target_type], |row| {
        Ok((row.get::<_, BehaviorType>(0)?, row.get::<_, i64>(1)?))
    })?;

    for row in rows {
        let (kind, count) = row?;
        counts.insert(kind, count);
    }

    Ok(counts)
}

/// Distinct targets the actor touched most recently
pub fn recent_targets(
    conn: &Connection,
    actor_id: SubjectId,
    target_type: TargetType,
    limit: i64,
) -> Result<Vec<RecentTarget>, RecommendError> {
    // SQLite takes bare columns from the row that produced MAX()
    let mut stmt = conn.prepare(
        r#"
        SELECT target_id, target_type, behavior_type, MAX(occurred_at) AS occurred_at
        FROM behavior_events
        WHERE actor_id = ? AND target_type = ?
        GROUP BY target_id, target_type
        ORDER BY occurred_at DESC, target_id ASC
        LIMIT ?
        "#,
    )?;

    let targets = stmt
        .query_map(params![actor_id, target_type, limit], |row| {
            Ok(RecentTarget {
                target_id: row.get("target_id")?,
                target_type: row.get("target_type")?,
                last_behavior: row.get("behavior_type")?,
                last_occurred_at: timestamp_column(row, "occurred_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(targets)
}

/// Highest event id, 0 for an empty log
pub fn latest_event_id(conn: &Connection) -> Result<BehaviorEventId, RecommendError> {
    let id = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM behavior_events", [], |row| row.get(0))?;
    Ok(id)
}

/// Actors (with the target type they acted on) that recorded events after `after_id`
pub fn actors_after(
    conn: &Connection,
    after_id: BehaviorEventId,
) -> Result<Vec<(SubjectId, TargetType)>, RecommendError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT actor_id, target_type FROM behavior_events WHERE id > ? ORDER BY actor_id",
    )?;

    let actors = stmt
        .query_map(params![after_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(actors)
}

/// Aggregate statistics for an actor in one role
pub fn statistics(
    conn: &Connection,
    actor_id: SubjectId,
    actor_type: SubjectType,
) -> Result<BehaviorStatistics, RecommendError> {
    let target_type = actor_type.target_type();
    let counts_by_kind = counts_by_kind(conn, actor_id, target_type)?;
    let total_events = counts_by_kind.values().sum();
    let recent_targets = recent_targets(conn, actor_id, target_type, RECENT_TARGETS_LIMIT)?;

    Ok(BehaviorStatistics {
        actor_id,
        actor_type,
        total_events,
        counts_by_kind,
        recent_targets,
    })
}
