//! Feature profile operations
//!
//! Profiles are never deleted. Each write that changes the attribute set
//! archives the superseded map in `feature_profile_revisions`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use super::models::{
    format_timestamp, parse_timestamp, timestamp_column, FeatureProfile, SubjectId, SubjectType,
};
use crate::error::RecommendError;
use crate::features::Attributes;

/// An archived attribute set
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRevision {
    pub revision: i64,
    pub attributes: Attributes,
    pub superseded_at: DateTime<Utc>,
}

fn parse_attributes(json: &str) -> rusqlite::Result<Attributes> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn profile_from_row(row: &Row) -> rusqlite::Result<FeatureProfile> {
    let attributes_json: String = row.get("attributes_json")?;
    Ok(FeatureProfile {
        subject_id: row.get("subject_id")?,
        subject_type: row.get("subject_type")?,
        attributes: parse_attributes(&attributes_json)?,
        revision: row.get("revision")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

/// Get a stored profile
pub fn get_profile(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
) -> Result<Option<FeatureProfile>, RecommendError> {
    let profile = conn
        .query_row(
            "SELECT * FROM feature_profiles WHERE subject_id = ? AND subject_type = ?",
            params![subject_id, subject_type],
            profile_from_row,
        )
        .optional()?;
    Ok(profile)
}

/// Insert an empty profile unless one exists, then return the stored row
pub fn ensure_profile(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
    now: DateTime<Utc>,
) -> Result<FeatureProfile, RecommendError> {
    let ts = format_timestamp(now);
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO feature_profiles
            (subject_id, subject_type, attributes_json, revision, created_at, updated_at)
        VALUES (?, ?, '{}', 0, ?, ?)
        "#,
        params![subject_id, subject_type, ts, ts],
    )?;
    if inserted > 0 {
        debug!(subject_id, subject_type = %subject_type, "Created default feature profile");
    }

    get_profile(conn, subject_id, subject_type)?
        .ok_or_else(|| RecommendError::Internal("Failed to retrieve ensured profile".into()))
}

/// Replace the attribute set, archiving the previous one
///
/// Returns the stored profile and whether anything changed.
pub fn write_profile(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
    attributes: &Attributes,
    now: DateTime<Utc>,
) -> Result<(FeatureProfile, bool), RecommendError> {
    let current = ensure_profile(conn, subject_id, subject_type, now)?;
    if &current.attributes == attributes {
        return Ok((current, false));
    }

    let ts = format_timestamp(now);

    conn.execute(
        r#"
        INSERT INTO feature_profile_revisions
            (subject_id, subject_type, revision, attributes_json, superseded_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![
            subject_id,
            subject_type,
            current.revision,
            serde_json::to_string(&current.attributes)?,
            ts,
        ],
    )?;

    conn.execute(
        r#"
        UPDATE feature_profiles
        SET attributes_json = ?, revision = revision + 1, updated_at = ?
        WHERE subject_id = ? AND subject_type = ?
        "#,
        params![serde_json::to_string(attributes)?, ts, subject_id, subject_type],
    )?;

    let updated = get_profile(conn, subject_id, subject_type)?
        .ok_or_else(|| RecommendError::Internal("Failed to retrieve updated profile".into()))?;
    Ok((updated, true))
}

/// Archived revisions, oldest first
pub fn profile_revisions(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
) -> Result<Vec<ProfileRevision>, RecommendError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT revision, attributes_json, superseded_at FROM feature_profile_revisions
        WHERE subject_id = ? AND subject_type = ?
        ORDER BY revision ASC
        "#,
    )?;

    let revisions = stmt
        .query_map(params![subject_id, subject_type], |row| {
            let attributes_json: String = row.get("attributes_json")?;
            Ok(ProfileRevision {
                revision: row.get("revision")?,
                attributes: parse_attributes(&attributes_json)?,
                superseded_at: timestamp_column(row, "superseded_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(revisions)
}

/// Latest profile write time, if any profile exists
pub fn latest_update(conn: &Connection) -> Result<Option<DateTime<Utc>>, RecommendError> {
    let latest: Option<String> =
        conn.query_row("SELECT MAX(updated_at) FROM feature_profiles", [], |row| row.get(0))?;
    latest.as_deref().map(parse_timestamp).transpose()
}

/// Subjects whose profile was written after `after` (`None` = ever written)
pub fn updated_after(
    conn: &Connection,
    after: Option<DateTime<Utc>>,
) -> Result<Vec<(SubjectId, SubjectType)>, RecommendError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT subject_id, subject_type FROM feature_profiles
        WHERE (?1 IS NULL OR updated_at > ?1) AND revision > 0
        "#,
    )?;

    let after = after.map(format_timestamp);
    let subjects = stmt
        .query_map(params![after], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(subjects)
}

/// Fingerprint of the attribute set currently in effect
pub fn current_fingerprint(
    conn: &Connection,
    subject_id: SubjectId,
    subject_type: SubjectType,
) -> Result<String, RecommendError> {
    let attributes = get_profile(conn, subject_id, subject_type)?
        .map(|p| p.attributes)
        .unwrap_or_default();
    Ok(crate::features::fingerprint(&attributes))
}
