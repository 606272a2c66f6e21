//! Behavior service - recording and reading interaction signals
//!
//! Wraps the behavior repository with kind/weight validation, dismissal
//! fingerprinting and event emission.

use std::sync::Arc;

use rusqlite::TransactionBehavior;
use serde::Deserialize;
use tracing::debug;

use crate::db::behavior_events::{self, BehaviorStatistics, NewBehaviorEvent};
use crate::db::feature_profiles;
use crate::db::models::{
    BehaviorEvent, BehaviorType, Clock, SubjectId, SubjectType, TargetId, TargetType,
};
use crate::db::RecommendDb;
use crate::error::RecommendError;

use super::events::{EventBus, RecommendationEvent};

/// Input for recording a behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordBehaviorInput {
    pub actor_id: SubjectId,
    pub target_id: TargetId,
    pub target_type: TargetType,
    /// `view`, `apply`, `favorite` or `dismiss` (case-insensitive)
    pub behavior_type: String,
    #[serde(default)]
    pub weight: Option<f64>,
}

/// Behavior service for business logic
pub struct BehaviorService {
    db: Arc<RecommendDb>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl BehaviorService {
    pub fn new(db: Arc<RecommendDb>, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { db, events, clock }
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Append a behavior event
    ///
    /// Never deduplicates. DISMISS events capture the actor's current profile
    /// fingerprint so the dismissal lapses once the profile changes.
    pub fn record_behavior(&self, input: RecordBehaviorInput) -> Result<BehaviorEvent, RecommendError> {
        let behavior_type: BehaviorType = input.behavior_type.parse()?;
        let weight = match input.weight {
            Some(w) if !w.is_finite() => {
                return Err(RecommendError::InvalidBehaviorWeight(format!(
                    "weight must be finite, got {}",
                    w
                )));
            }
            Some(w) => w,
            None => behavior_type.default_weight(),
        };

        let actor_type = input.target_type.audience();
        let occurred_at = self.clock.now();

        let event = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let profile_fingerprint = if behavior_type == BehaviorType::Dismiss {
                Some(feature_profiles::current_fingerprint(&tx, input.actor_id, actor_type)?)
            } else {
                None
            };

            let event = behavior_events::insert_event(
                &tx,
                &NewBehaviorEvent {
                    actor_id: input.actor_id,
                    target_id: input.target_id,
                    target_type: input.target_type,
                    behavior_type,
                    weight,
                    occurred_at,
                    profile_fingerprint,
                },
            )?;

            tx.commit()?;
            Ok(event)
        })?;

        debug!(
            event_id = event.id,
            actor_id = event.actor_id,
            target_id = event.target_id,
            behavior = %behavior_type,
            weight,
            "Recorded behavior"
        );

        self.events.emit(RecommendationEvent::BehaviorRecorded {
            event_id: event.id,
            actor_id: event.actor_id,
            actor_type,
            target_id: event.target_id,
            target_type: event.target_type,
            behavior_type,
        });

        Ok(event)
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Counts per kind and most recent targets of the actor in one role
    pub fn get_behavior_statistics(
        &self,
        actor_id: SubjectId,
        actor_type: SubjectType,
    ) -> Result<BehaviorStatistics, RecommendError> {
        self.db
            .with_conn(|conn| behavior_events::statistics(conn, actor_id, actor_type))
    }

    /// Events of an actor, newest first
    pub fn history(
        &self,
        actor_id: SubjectId,
        target_type: Option<TargetType>,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<BehaviorEvent>, RecommendError> {
        self.db
            .with_conn(|conn| behavior_events::history(conn, actor_id, target_type, limit, offset))
    }
}
