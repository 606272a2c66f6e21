//! Recommendation row operations
//!
//! Rows move through `pending -> viewed -> applied|contacted|dismissed`
//! and may be retired by regeneration. Retiring flips `lifecycle` so the
//! partial unique index frees the (subject, target) slot for a later run.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{
    format_timestamp, timestamp_column, Recommendation, RecommendationId, RecommendationStatus,
    SubjectId, SubjectType, TargetId, TargetType,
};
use crate::error::RecommendError;

/// Input for creating a recommendation
#[derive(Debug, Clone)]
pub struct NewRecommendation<'a> {
    pub subject_id: SubjectId,
    pub subject_type: SubjectType,
    pub target_id: TargetId,
    pub target_type: TargetType,
    pub score: f64,
    pub rank: i64,
    pub batch_id: &'a str,
    pub now: DateTime<Utc>,
}

fn recommendation_from_row(row: &Row) -> rusqlite::Result<Recommendation> {
    Ok(Recommendation {
        id: row.get("id")?,
        subject_id: row.get("subject_id")?,
        subject_type: row.get("subject_type")?,
        target_id: row.get("target_id")?,
        target_type: row.get("target_type")?,
        score: row.get("score")?,
        rank: row.get("rank")?,
        status: row.get("status")?,
        lifecycle: row.get("lifecycle")?,
        batch_id: row.get("batch_id")?,
        generated_at: timestamp_column(row, "generated_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

/// Get recommendation by ID
pub fn get_recommendation(
    conn: &Connection,
    id: RecommendationId,
) -> Result<Option<Recommendation>, RecommendError> {
    let rec = conn
        .query_row(
            "SELECT * FROM recommendations WHERE id = ?",
            params![id],
            recommendation_from_row,
        )
        .optional()?;
    Ok(rec)
}

/// All active recommendations of a subject, any status
pub fn active_for_subject(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
) -> Result<Vec<Recommendation>, RecommendError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM recommendations
        WHERE subject_id = ? AND subject_type = ? AND lifecycle = 'active'
        ORDER BY rank ASC, id ASC
        "#,
    )?;

    let recs = stmt
        .query_map(params![subject_id, subject_type], recommendation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(recs)
}

/// One page of visible recommendations, by rank
pub fn list_visible(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
    status: Option<RecommendationStatus>,
    limit: u32,
    offset: u32,
) -> Result<Vec<Recommendation>, RecommendError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM recommendations
        WHERE subject_id = ?1 AND subject_type = ?2 AND lifecycle = 'active'
          AND (?3 IS NULL OR status = ?3)
        ORDER BY rank ASC, id ASC
        LIMIT ?4 OFFSET ?5
        "#,
    )?;

    let recs = stmt
        .query_map(
            params![subject_id, subject_type, status, limit, offset],
            recommendation_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(recs)
}

/// Number of visible recommendations
pub fn count_visible(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
    status: Option<RecommendationStatus>,
) -> Result<u64, RecommendError> {
    let count: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM recommendations
        WHERE subject_id = ?1 AND subject_type = ?2 AND lifecycle = 'active'
          AND (?3 IS NULL OR status = ?3)
        "#,
        params![subject_id, subject_type, status],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Create a pending recommendation
pub fn insert_recommendation(
    conn: &Connection,
    input: &NewRecommendation<'_>,
) -> Result<RecommendationId, RecommendError> {
    let ts = format_timestamp(input.now);
    conn.execute(
        r#"
        INSERT INTO recommendations (
            subject_id, subject_type, target_id, target_type, score, rank,
            status, lifecycle, batch_id, generated_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 'active', ?, ?, ?)
        "#,
        params![
            input.subject_id,
            input.subject_type,
            input.target_id,
            input.target_type,
            input.score,
            input.rank,
            input.batch_id,
            ts,
            ts,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Update score and rank of a pending/viewed recommendation in place
pub fn rerank(
    conn: &Connection,
    id: RecommendationId,
    score: f64,
    rank: i64,
    batch_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, RecommendError> {
    let updated = conn.execute(
        r#"
        UPDATE recommendations
        SET score = ?, rank = ?, batch_id = ?, updated_at = ?
        WHERE id = ? AND lifecycle = 'active' AND status IN ('pending', 'viewed')
        "#,
        params![score, rank, batch_id, format_timestamp(now), id],
    )?;
    Ok(updated > 0)
}

/// Retire a pending/viewed recommendation
pub fn retire(conn: &Connection, id: RecommendationId, now: DateTime<Utc>) -> Result<bool, RecommendError> {
    let updated = conn.execute(
        r#"
        UPDATE recommendations
        SET status = 'retired', lifecycle = 'retired', updated_at = ?
        WHERE id = ? AND lifecycle = 'active' AND status IN ('pending', 'viewed')
        "#,
        params![format_timestamp(now), id],
    )?;
    Ok(updated > 0)
}

/// Set the status only if it still equals `expected`
///
/// Returns false when another writer changed the row first.
pub fn compare_and_set_status(
    conn: &Connection,
    id: RecommendationId,
    expected: RecommendationStatus,
    next: RecommendationStatus,
    now: DateTime<Utc>,
) -> Result<bool, RecommendError> {
    let updated = conn.execute(
        r#"
        UPDATE recommendations
        SET status = ?, updated_at = ?
        WHERE id = ? AND status = ? AND lifecycle = 'active'
        "#,
        params![next, format_timestamp(now), id, expected],
    )?;
    Ok(updated > 0)
}
