//! Identity and organization lookups
//!
//! Both are owned by other systems. The engine only needs to turn a caller
//! principal into a subject and an organization into its visibility scope.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::candidates::OrganizationScope;
use crate::db::models::{SubjectId, SubjectType};
use crate::error::RecommendError;

/// A resolved recommendation subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub subject_id: SubjectId,
    pub subject_type: SubjectType,
}

impl Subject {
    pub fn student(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            subject_type: SubjectType::Student,
        }
    }

    pub fn organization(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            subject_type: SubjectType::Organization,
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)
    }
}

/// Resolves an authenticated principal to a subject
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve_subject(&self, principal: &str) -> Result<Subject, RecommendError>;
}

/// Directory that reads the subject straight from `student:<id>` / `org:<id>`
#[derive(Debug, Default, Clone, Copy)]
pub struct PrincipalDirectory;

impl PrincipalDirectory {
    pub fn parse(principal: &str) -> Result<Subject, RecommendError> {
        let forbidden = || RecommendError::Forbidden(format!("Unrecognized principal: {}", principal));

        let (kind, id) = principal.trim().split_once(':').ok_or_else(forbidden)?;
        let subject_type: SubjectType = kind.parse().map_err(|_| forbidden())?;
        let subject_id: SubjectId = id.parse().map_err(|_| forbidden())?;
        if subject_id <= 0 {
            return Err(forbidden());
        }

        Ok(Subject {
            subject_id,
            subject_type,
        })
    }
}

#[async_trait]
impl UserDirectory for PrincipalDirectory {
    async fn resolve_subject(&self, principal: &str) -> Result<Subject, RecommendError> {
        Self::parse(principal)
    }
}

/// Supplies an organization's candidate visibility rules
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn scope_for(&self, organization_id: SubjectId) -> Result<OrganizationScope, RecommendError>;
}

/// In-memory organization rules, defaulting to an unrestricted scope
#[derive(Default)]
pub struct StaticOrganizationDirectory {
    scopes: DashMap<SubjectId, OrganizationScope>,
}

impl StaticOrganizationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scopes(scopes: impl IntoIterator<Item = OrganizationScope>) -> Self {
        let directory = Self::new();
        for scope in scopes {
            directory.set_scope(scope);
        }
        directory
    }

    pub fn set_scope(&self, scope: OrganizationScope) {
        self.scopes.insert(scope.organization_id, scope);
    }
}

#[async_trait]
impl OrganizationDirectory for StaticOrganizationDirectory {
    async fn scope_for(&self, organization_id: SubjectId) -> Result<OrganizationScope, RecommendError> {
        Ok(self
            .scopes
            .get(&organization_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| OrganizationScope::for_organization(organization_id)))
    }
}
