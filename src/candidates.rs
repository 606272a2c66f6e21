//! Candidate pool port
//!
//! The engine never owns jobs or student listings. It asks a
//! [`CandidatePoolProvider`] for whatever is currently eligible (open jobs,
//! students with a complete profile) and treats the answer as a snapshot
//! that may differ between runs.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::db::models::{SubjectId, SubjectType, TargetId, TargetType};
use crate::error::RecommendError;
use crate::features::{Attributes, FeatureKey, FeatureValue};

/// An entity eligible for recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRef {
    pub id: TargetId,
    pub target_type: TargetType,
    /// Owning organization (jobs only)
    #[serde(default)]
    pub organization_id: Option<SubjectId>,
    #[serde(default)]
    pub static_attributes: Attributes,
}

/// Visibility rules restricting a candidate pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationScope {
    pub organization_id: SubjectId,
    /// Students must list at least one of these majors (empty = any)
    #[serde(default)]
    pub allowed_majors: Vec<String>,
    /// Students must be located in one of these places (empty = any)
    #[serde(default)]
    pub allowed_locations: Vec<String>,
}

impl OrganizationScope {
    /// Scope with no allow-lists
    pub fn for_organization(organization_id: SubjectId) -> Self {
        Self {
            organization_id,
            ..Default::default()
        }
    }

    /// Whether a candidate is visible under this scope
    pub fn admits(&self, candidate: &CandidateRef) -> bool {
        match candidate.target_type {
            TargetType::Job => candidate.organization_id == Some(self.organization_id),
            TargetType::Student => {
                allow_list_admits(&self.allowed_majors, candidate, FeatureKey::Majors)
                    && allow_list_admits(&self.allowed_locations, candidate, FeatureKey::Location)
            }
        }
    }
}

fn allow_list_admits(allowed: &[String], candidate: &CandidateRef, key: FeatureKey) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let allowed = FeatureValue::List(allowed.to_vec());
    candidate
        .static_attributes
        .get(key.as_str())
        .map(|value| value.shares_value(&allowed))
        .unwrap_or(false)
}

/// Source of eligible candidates
#[async_trait]
pub trait CandidatePoolProvider: Send + Sync {
    /// Candidates a subject of `subject_type` may be recommended, ordered by id
    async fn list_active_candidates(
        &self,
        subject_type: SubjectType,
        scope: Option<&OrganizationScope>,
    ) -> Result<Vec<CandidateRef>, RecommendError>;
}

// ============================================================================
// Pool snapshot shared by the in-memory and file providers
// ============================================================================

/// A job posting as published by the jobs collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    pub id: TargetId,
    pub organization_id: SubjectId,
    #[serde(default = "default_job_status")]
    pub status: String,
    #[serde(default)]
    pub attributes: Attributes,
}

fn default_job_status() -> String {
    "open".to_string()
}

/// A student profile as published by the user collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentListing {
    pub id: TargetId,
    #[serde(default = "default_true")]
    pub profile_complete: bool,
    #[serde(default)]
    pub attributes: Attributes,
}

fn default_true() -> bool {
    true
}

/// Snapshot of everything the pool can offer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub jobs: Vec<JobListing>,
    #[serde(default)]
    pub students: Vec<StudentListing>,
    /// Organization visibility rules (consumed by the organization directory)
    #[serde(default)]
    pub organizations: Vec<OrganizationScope>,
}

impl PoolSnapshot {
    /// Eligible candidates for a subject type, ordered by id
    pub fn candidates_for(
        &self,
        subject_type: SubjectType,
        scope: Option<&OrganizationScope>,
    ) -> Vec<CandidateRef> {
        let mut candidates: Vec<CandidateRef> = match subject_type {
            SubjectType::Student => self
                .jobs
                .iter()
                .filter(|job| job.status.eq_ignore_ascii_case("open"))
                .map(|job| CandidateRef {
                    id: job.id,
                    target_type: TargetType::Job,
                    organization_id: Some(job.organization_id),
                    static_attributes: job.attributes.clone(),
                })
                .collect(),
            SubjectType::Organization => self
                .students
                .iter()
                .filter(|student| student.profile_complete)
                .map(|student| CandidateRef {
                    id: student.id,
                    target_type: TargetType::Student,
                    organization_id: None,
                    static_attributes: student.attributes.clone(),
                })
                .collect(),
        };

        if let Some(scope) = scope {
            candidates.retain(|c| scope.admits(c));
        }
        candidates.sort_by_key(|c| c.id);
        candidates
    }
}

/// In-memory candidate pool
pub struct StaticCandidatePool {
    snapshot: RwLock<PoolSnapshot>,
}

impl StaticCandidatePool {
    pub fn new(snapshot: PoolSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Add or replace a job listing
    pub async fn upsert_job(&self, job: JobListing) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.jobs.retain(|j| j.id != job.id);
        snapshot.jobs.push(job);
    }

    /// Add or replace a student listing
    pub async fn upsert_student(&self, student: StudentListing) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.students.retain(|s| s.id != student.id);
        snapshot.students.push(student);
    }

    /// Mark a job closed; it stops being offered
    pub async fn close_job(&self, id: TargetId) {
        let mut snapshot = self.snapshot.write().await;
        for job in snapshot.jobs.iter_mut().filter(|j| j.id == id) {
            job.status = "closed".to_string();
        }
    }
}

impl Default for StaticCandidatePool {
    fn default() -> Self {
        Self::new(PoolSnapshot::default())
    }
}

#[async_trait]
impl CandidatePoolProvider for StaticCandidatePool {
    async fn list_active_candidates(
        &self,
        subject_type: SubjectType,
        scope: Option<&OrganizationScope>,
    ) -> Result<Vec<CandidateRef>, RecommendError> {
        Ok(self.snapshot.read().await.candidates_for(subject_type, scope))
    }
}

/// Candidate pool re-read from a JSON file on every call
pub struct FileCandidatePool {
    path: PathBuf,
}

impl FileCandidatePool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and parse the current snapshot
    pub async fn load(&self) -> Result<PoolSnapshot, RecommendError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RecommendError::CandidateSourceUnavailable(format!(
                "Cannot read pool file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            RecommendError::CandidateSourceUnavailable(format!(
                "Malformed pool file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl CandidatePoolProvider for FileCandidatePool {
    async fn list_active_candidates(
        &self,
        subject_type: SubjectType,
        scope: Option<&OrganizationScope>,
    ) -> Result<Vec<CandidateRef>, RecommendError> {
        let snapshot = self.load().await?;
        let candidates = snapshot.candidates_for(subject_type, scope);
        debug!(
            path = %self.path.display(),
            subject_type = %subject_type,
            count = candidates.len(),
            "Loaded candidate pool"
        );
        Ok(candidates)
    }
}
