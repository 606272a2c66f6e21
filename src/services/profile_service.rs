//! Profile service - reading and merge-patching feature profiles

use std::sync::Arc;

use rusqlite::TransactionBehavior;
use tracing::debug;

use crate::db::feature_profiles::{self, ProfileRevision};
use crate::db::models::{Clock, FeatureProfile, SubjectId, SubjectType};
use crate::db::RecommendDb;
use crate::error::RecommendError;
use crate::features::{self, AttributePatch};

use super::events::{EventBus, RecommendationEvent};

/// Profile service for business logic
pub struct ProfileService {
    db: Arc<RecommendDb>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl ProfileService {
    pub fn new(db: Arc<RecommendDb>, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { db, events, clock }
    }

    /// Current profile, or an empty one if the subject never wrote any
    pub fn get_profile(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
    ) -> Result<FeatureProfile, RecommendError> {
        let stored = self
            .db
            .with_conn(|conn| feature_profiles::get_profile(conn, subject_id, subject_type))?;

        Ok(stored.unwrap_or_else(|| FeatureProfile::empty(subject_id, subject_type, self.clock.now())))
    }

    /// Merge-patch the attribute set
    ///
    /// Rejects the whole patch on the first unknown key or malformed value.
    pub fn update_profile(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
        patch: AttributePatch,
    ) -> Result<FeatureProfile, RecommendError> {
        let now = self.clock.now();

        let (profile, changed) = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = feature_profiles::ensure_profile(&tx, subject_id, subject_type, now)?;
            let merged = features::apply_patch(subject_type, &current.attributes, patch)?;
            let result = feature_profiles::write_profile(&tx, subject_id, subject_type, &merged, now)?;
            tx.commit()?;
            Ok(result)
        })?;

        if changed {
            debug!(subject_id, subject_type = %subject_type, revision = profile.revision, "Profile updated");
            self.events.emit(RecommendationEvent::ProfileUpdated {
                subject_id,
                subject_type,
                revision: profile.revision,
            });
        }

        Ok(profile)
    }

    /// Superseded attribute sets, oldest first
    pub fn revisions(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
    ) -> Result<Vec<ProfileRevision>, RecommendError> {
        self.db
            .with_conn(|conn| feature_profiles::profile_revisions(conn, subject_id, subject_type))
    }
}
