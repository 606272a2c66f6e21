//! Row types and enumerations shared by the repositories
//!
//! Enumerations are stored as lowercase TEXT. Timestamps are stored as
//! fixed-width RFC 3339 UTC strings with microseconds, so ordering by the
//! TEXT column is chronological ordering.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::RecommendError;
use crate::features::Attributes;

pub type SubjectId = i64;
pub type TargetId = i64;
pub type BehaviorEventId = i64;
pub type RecommendationId = i64;

// ============================================================================
// Timestamps
// ============================================================================

/// Format a timestamp for a TEXT column
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a TEXT column timestamp
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RecommendError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RecommendError::Parse(format!("Bad timestamp '{}': {}", s, e)))
}

/// Read a timestamp column inside a row mapper
pub(crate) fn timestamp_column(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(name)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            let idx = row.as_ref().column_index(name).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

/// Source of "now" for recording and scoring
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for reproducible runs
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Implements Display, TEXT column conversion and serde via `as_str`/`FromStr`
macro_rules! text_enum {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e: RecommendError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Who receives recommendations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Student,
    Organization,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Student => "student",
            SubjectType::Organization => "organization",
        }
    }

    /// Kind of entity recommended to this subject
    pub fn target_type(&self) -> TargetType {
        match self {
            SubjectType::Student => TargetType::Job,
            SubjectType::Organization => TargetType::Student,
        }
    }

    /// Status recorded when the subject acts on a recommendation
    pub fn acted_status(&self) -> RecommendationStatus {
        match self {
            SubjectType::Student => RecommendationStatus::Applied,
            SubjectType::Organization => RecommendationStatus::Contacted,
        }
    }
}

impl FromStr for SubjectType {
    type Err = RecommendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Ok(SubjectType::Student),
            "organization" | "org" => Ok(SubjectType::Organization),
            other => Err(RecommendError::Parse(format!("Unknown subject type: {}", other))),
        }
    }
}

text_enum!(SubjectType);

/// What a behavior event or recommendation points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Job,
    Student,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Job => "job",
            TargetType::Student => "student",
        }
    }

    /// Subject type that interacts with targets of this type
    pub fn audience(&self) -> SubjectType {
        match self {
            TargetType::Job => SubjectType::Student,
            TargetType::Student => SubjectType::Organization,
        }
    }
}

impl FromStr for TargetType {
    type Err = RecommendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "job" => Ok(TargetType::Job),
            "student" => Ok(TargetType::Student),
            other => Err(RecommendError::Parse(format!("Unknown target type: {}", other))),
        }
    }
}

text_enum!(TargetType);

/// Kind of recorded interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorType {
    View,
    Apply,
    Favorite,
    Dismiss,
}

impl BehaviorType {
    pub const ALL: [BehaviorType; 4] = [
        BehaviorType::View,
        BehaviorType::Apply,
        BehaviorType::Favorite,
        BehaviorType::Dismiss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorType::View => "view",
            BehaviorType::Apply => "apply",
            BehaviorType::Favorite => "favorite",
            BehaviorType::Dismiss => "dismiss",
        }
    }

    /// Weight used when the caller does not supply one
    pub fn default_weight(&self) -> f64 {
        match self {
            BehaviorType::View => 0.1,
            BehaviorType::Favorite => 0.5,
            BehaviorType::Apply => 1.0,
            BehaviorType::Dismiss => -1.0,
        }
    }
}

impl FromStr for BehaviorType {
    type Err = RecommendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "view" => Ok(BehaviorType::View),
            "apply" => Ok(BehaviorType::Apply),
            "favorite" => Ok(BehaviorType::Favorite),
            "dismiss" => Ok(BehaviorType::Dismiss),
            _ => Err(RecommendError::InvalidBehaviorKind(s.to_string())),
        }
    }
}

text_enum!(BehaviorType);

/// Per-recommendation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Pending,
    Viewed,
    Applied,
    Contacted,
    Dismissed,
    Retired,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Pending => "pending",
            RecommendationStatus::Viewed => "viewed",
            RecommendationStatus::Applied => "applied",
            RecommendationStatus::Contacted => "contacted",
            RecommendationStatus::Dismissed => "dismissed",
            RecommendationStatus::Retired => "retired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecommendationStatus::Pending | RecommendationStatus::Viewed)
    }

    /// Whether a subject-initiated change from `self` to `next` is allowed
    ///
    /// `Retired` is never reachable here; only regeneration retires.
    pub fn allows_transition(&self, next: RecommendationStatus, subject_type: SubjectType) -> bool {
        use RecommendationStatus::*;
        let acted = subject_type.acted_status();
        match (*self, next) {
            (Pending, Viewed) => true,
            (Pending | Viewed, Dismissed) => true,
            (Pending | Viewed, n) if n == acted => true,
            _ => false,
        }
    }

    /// Behavior mirrored into the behavior log when a subject sets this status
    pub fn mirrored_behavior(&self) -> Option<BehaviorType> {
        match self {
            RecommendationStatus::Viewed => Some(BehaviorType::View),
            RecommendationStatus::Applied | RecommendationStatus::Contacted => Some(BehaviorType::Apply),
            RecommendationStatus::Dismissed => Some(BehaviorType::Dismiss),
            RecommendationStatus::Pending | RecommendationStatus::Retired => None,
        }
    }
}

impl FromStr for RecommendationStatus {
    type Err = RecommendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RecommendationStatus::Pending),
            "viewed" => Ok(RecommendationStatus::Viewed),
            "applied" => Ok(RecommendationStatus::Applied),
            "contacted" => Ok(RecommendationStatus::Contacted),
            "dismissed" => Ok(RecommendationStatus::Dismissed),
            "retired" => Ok(RecommendationStatus::Retired),
            other => Err(RecommendError::Parse(format!("Unknown recommendation status: {}", other))),
        }
    }
}

text_enum!(RecommendationStatus);

/// Row lifecycle; rows are never physically removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Retired,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::Retired => "retired",
        }
    }
}

impl FromStr for Lifecycle {
    type Err = RecommendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Lifecycle::Active),
            "retired" => Ok(Lifecycle::Retired),
            other => Err(RecommendError::Parse(format!("Unknown lifecycle: {}", other))),
        }
    }
}

text_enum!(Lifecycle);

// ============================================================================
// Rows
// ============================================================================

/// Immutable interaction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorEvent {
    pub id: BehaviorEventId,
    pub actor_id: SubjectId,
    pub target_id: TargetId,
    pub target_type: TargetType,
    pub behavior_type: BehaviorType,
    pub weight: f64,
    pub occurred_at: DateTime<Utc>,
    /// Actor's profile fingerprint at dismissal time (DISMISS events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_fingerprint: Option<String>,
}

/// Explicit feature profile of a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProfile {
    pub subject_id: SubjectId,
    pub subject_type: SubjectType,
    pub attributes: Attributes,
    /// 0 for a profile that has never been written
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

impl FeatureProfile {
    /// Default profile handed out before the subject has written one
    pub fn empty(subject_id: SubjectId, subject_type: SubjectType, now: DateTime<Utc>) -> Self {
        Self {
            subject_id,
            subject_type,
            attributes: Attributes::new(),
            revision: 0,
            updated_at: now,
        }
    }

    pub fn fingerprint(&self) -> String {
        crate::features::fingerprint(&self.attributes)
    }
}

/// Materialized recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: RecommendationId,
    pub subject_id: SubjectId,
    pub subject_type: SubjectType,
    pub target_id: TargetId,
    pub target_type: TargetType,
    pub score: f64,
    pub rank: i64,
    pub status: RecommendationStatus,
    pub lifecycle: Lifecycle,
    pub batch_id: String,
    pub generated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
