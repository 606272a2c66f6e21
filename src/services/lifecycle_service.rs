//! Recommendation store and lifecycle manager
//!
//! Paged reads go through the cache port; status changes are
//! compare-and-swap updates that mirror the subject's action into the
//! behavior log within the same transaction.

use std::sync::Arc;

use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{self, RecommendationCache};
use crate::config::StoreConfig;
use crate::db::behavior_events::{self, NewBehaviorEvent};
use crate::db::feature_profiles;
use crate::db::models::{
    BehaviorEventId, BehaviorType, Clock, Recommendation, RecommendationId, RecommendationStatus,
    SubjectId, SubjectType, TargetId, TargetType,
};
use crate::db::recommendations;
use crate::db::RecommendDb;
use crate::error::RecommendError;

use super::events::{EventBus, RecommendationEvent};

/// One page of visible recommendations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationPage {
    pub items: Vec<Recommendation>,
    /// 1-based page index actually served
    pub page: u32,
    /// Page size actually served
    pub size: u32,
    /// Visible recommendations across all pages
    pub total: u64,
}

/// Outcome of an applied status change
struct StatusChange {
    previous: RecommendationStatus,
    subject_type: SubjectType,
    mirrored: Option<(BehaviorType, BehaviorEventId)>,
    target_id: TargetId,
    target_type: TargetType,
}

/// Lifecycle service for business logic
pub struct LifecycleService {
    db: Arc<RecommendDb>,
    events: Arc<EventBus>,
    cache: Arc<dyn RecommendationCache>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl LifecycleService {
    pub fn new(
        db: Arc<RecommendDb>,
        events: Arc<EventBus>,
        cache: Arc<dyn RecommendationCache>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Self {
        Self {
            db,
            events,
            cache,
            clock,
            config,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Visible recommendations by rank; page is 1-based
    pub fn list_recommendations(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
        page: u32,
        size: u32,
    ) -> Result<RecommendationPage, RecommendError> {
        self.list_page(subject_id, subject_type, None, page, size)
    }

    /// Visible recommendations in one status
    pub fn list_by_status(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
        status: RecommendationStatus,
        page: u32,
        size: u32,
    ) -> Result<RecommendationPage, RecommendError> {
        self.list_page(subject_id, subject_type, Some(status), page, size)
    }

    /// Get a recommendation by ID
    pub fn get(&self, id: RecommendationId) -> Result<Recommendation, RecommendError> {
        self.db
            .with_conn(|conn| recommendations::get_recommendation(conn, id))?
            .ok_or_else(|| RecommendError::NotFound(format!("recommendation {}", id)))
    }

    fn list_page(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
        status: Option<RecommendationStatus>,
        page: u32,
        size: u32,
    ) -> Result<RecommendationPage, RecommendError> {
        let page = page.max(1);
        let size = size.clamp(1, self.config.max_page_size.max(1));
        let key = cache::page_key(subject_type, subject_id, status, page, size);

        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_str::<RecommendationPage>(&cached) {
                Ok(hit) => return Ok(hit),
                Err(e) => warn!(key = %key, error = %e, "Discarding unreadable cached page"),
            }
        }

        let offset = (page - 1).saturating_mul(size);

        self.db.with_conn(|conn| {
            let items =
                recommendations::list_visible(conn, subject_id, subject_type, status, size, offset)?;
            let total = recommendations::count_visible(conn, subject_id, subject_type, status)?;
            let result = RecommendationPage {
                items,
                page,
                size,
                total,
            };

            // Filled while the connection is held so writers cannot interleave
            self.cache.set(&key, serde_json::to_string(&result)?);
            Ok(result)
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Apply a subject's status change
    ///
    /// Returns `Ok(false)` when the recommendation is already in the
    /// requested non-terminal status.
    pub fn set_recommendation_status(
        &self,
        recommendation_id: RecommendationId,
        subject_id: SubjectId,
        subject_type: SubjectType,
        new_status: RecommendationStatus,
    ) -> Result<bool, RecommendError> {
        let now = self.clock.now();

        let change = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = recommendations::get_recommendation(&tx, recommendation_id)?
                .ok_or_else(|| RecommendError::NotFound(format!("recommendation {}", recommendation_id)))?;

            if current.subject_id != subject_id || current.subject_type != subject_type {
                return Err(RecommendError::Forbidden(format!(
                    "recommendation {} does not belong to {}:{}",
                    recommendation_id, subject_type, subject_id
                )));
            }

            if current.status == new_status && !current.status.is_terminal() {
                return Ok(None);
            }

            if !current.status.allows_transition(new_status, subject_type) {
                return Err(invalid_transition(current.status, new_status));
            }

            if !recommendations::compare_and_set_status(&tx, recommendation_id, current.status, new_status, now)? {
                let latest = recommendations::get_recommendation(&tx, recommendation_id)?
                    .map(|r| r.status)
                    .unwrap_or(current.status);
                return Err(invalid_transition(latest, new_status));
            }

            let mirrored = match new_status.mirrored_behavior() {
                Some(behavior_type) => {
                    let profile_fingerprint = if behavior_type == BehaviorType::Dismiss {
                        Some(feature_profiles::current_fingerprint(&tx, subject_id, subject_type)?)
                    } else {
                        None
                    };
                    let event = behavior_events::insert_event(
                        &tx,
                        &NewBehaviorEvent {
                            actor_id: subject_id,
                            target_id: current.target_id,
                            target_type: current.target_type,
                            behavior_type,
                            weight: behavior_type.default_weight(),
                            occurred_at: now,
                            profile_fingerprint,
                        },
                    )?;
                    Some((behavior_type, event.id))
                }
                None => None,
            };

            tx.commit()?;
            self.cache
                .invalidate_prefix(&cache::subject_prefix(subject_type, subject_id));

            Ok(Some(StatusChange {
                previous: current.status,
                subject_type,
                mirrored,
                target_id: current.target_id,
                target_type: current.target_type,
            }))
        })?;

        let Some(change) = change else {
            debug!(recommendation_id, status = %new_status, "Status already set");
            return Ok(false);
        };

        self.events.emit(RecommendationEvent::StatusChanged {
            recommendation_id,
            subject_id,
            subject_type: change.subject_type,
            from: change.previous,
            to: new_status,
        });

        if let Some((behavior_type, event_id)) = change.mirrored {
            self.events.emit(RecommendationEvent::BehaviorRecorded {
                event_id,
                actor_id: subject_id,
                actor_type: change.subject_type,
                target_id: change.target_id,
                target_type: change.target_type,
                behavior_type,
            });
        }

        Ok(true)
    }
}

fn invalid_transition(from: RecommendationStatus, to: RecommendationStatus) -> RecommendError {
    RecommendError::InvalidStatusTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::db::models::FixedClock;
    use crate::db::recommendations::NewRecommendation;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Fixture {
        service: LifecycleService,
        db: Arc<RecommendDb>,
        cache: Arc<InMemoryCache>,
    }

    fn setup() -> Fixture {
        let db = Arc::new(RecommendDb::open_in_memory().unwrap());
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(60)));
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()));
        let config = StoreConfig {
            max_page_size: 3,
            ..Default::default()
        };
        let service = LifecycleService::new(db.clone(), Arc::new(EventBus::new()), cache.clone(), clock, config);
        Fixture { service, db, cache }
    }

    fn seed(db: &RecommendDb, subject_type: SubjectType, targets: &[i64]) -> Vec<RecommendationId> {
        let target_type = subject_type.target_type();
        db.with_conn(|conn| {
            targets
                .iter()
                .enumerate()
                .map(|(i, target_id)| {
                    recommendations::insert_recommendation(
                        conn,
                        &NewRecommendation {
                            subject_id: 1,
                            subject_type,
                            target_id: *target_id,
                            target_type,
                            score: 90.0 - i as f64,
                            rank: i as i64 + 1,
                            batch_id: "seed",
                            now: Utc::now(),
                        },
                    )
                })
                .collect()
        })
        .unwrap()
    }

    #[test]
    fn test_page_clamping() {
        let f = setup();
        seed(&f.db, SubjectType::Student, &[10, 11, 12, 13]);

        let first = f.service.list_recommendations(1, SubjectType::Student, 0, 50).unwrap();
        assert_eq!(first.page, 1);
        assert_eq!(first.size, 3);
        assert_eq!(first.total, 4);
        assert_eq!(first.items.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3]);

        let second = f.service.list_recommendations(1, SubjectType::Student, 2, 0).unwrap();
        assert_eq!(second.size, 1);
        assert_eq!(second.items[0].target_id, 11);
    }

    #[test]
    fn test_status_change_invalidates_cached_pages() {
        let f = setup();
        let ids = seed(&f.db, SubjectType::Student, &[10]);

        let before = f.service.list_recommendations(1, SubjectType::Student, 1, 3).unwrap();
        assert_eq!(before.items[0].status, RecommendationStatus::Pending);
        assert_eq!(f.cache.stats().entries, 1);

        assert!(f
            .service
            .set_recommendation_status(ids[0], 1, SubjectType::Student, RecommendationStatus::Viewed)
            .unwrap());
        assert_eq!(f.cache.stats().entries, 0);

        let after = f.service.list_recommendations(1, SubjectType::Student, 1, 3).unwrap();
        assert_eq!(after.items[0].status, RecommendationStatus::Viewed);

        let viewed = f
            .service
            .list_by_status(1, SubjectType::Student, RecommendationStatus::Viewed, 1, 3)
            .unwrap();
        assert_eq!(viewed.total, 1);
    }

    #[test]
    fn test_repeat_view_is_noop() {
        let f = setup();
        let ids = seed(&f.db, SubjectType::Student, &[10]);

        assert!(f
            .service
            .set_recommendation_status(ids[0], 1, SubjectType::Student, RecommendationStatus::Viewed)
            .unwrap());
        assert!(!f
            .service
            .set_recommendation_status(ids[0], 1, SubjectType::Student, RecommendationStatus::Viewed)
            .unwrap());

        let views = f.db.with_conn(|conn| behavior_events::history(conn, 1, None, None, 0)).unwrap();
        assert_eq!(views.len(), 1);
    }

    #[test]
    fn test_acted_status_depends_on_subject_type() {
        let f = setup();
        let student = seed(&f.db, SubjectType::Student, &[10]);
        let org = seed(&f.db, SubjectType::Organization, &[20]);

        assert!(matches!(
            f.service
                .set_recommendation_status(student[0], 1, SubjectType::Student, RecommendationStatus::Contacted),
            Err(RecommendError::InvalidStatusTransition { .. })
        ));
        assert!(f
            .service
            .set_recommendation_status(org[0], 1, SubjectType::Organization, RecommendationStatus::Contacted)
            .unwrap());

        let mirrored = f
            .db
            .with_conn(|conn| behavior_events::history(conn, 1, Some(TargetType::Student), None, 0))
            .unwrap();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].behavior_type, BehaviorType::Apply);
    }

    #[test]
    fn test_same_id_other_subject_type_is_forbidden() {
        let f = setup();
        let ids = seed(&f.db, SubjectType::Student, &[10]);

        assert!(matches!(
            f.service
                .set_recommendation_status(ids[0], 1, SubjectType::Organization, RecommendationStatus::Viewed),
            Err(RecommendError::Forbidden(_))
        ));
        assert!(matches!(
            f.service
                .set_recommendation_status(999, 1, SubjectType::Student, RecommendationStatus::Viewed),
            Err(RecommendError::NotFound(_))
        ));
        assert!(matches!(f.service.get(999), Err(RecommendError::NotFound(_))));
    }

    #[test]
    fn test_dismiss_mirrors_fingerprinted_behavior() {
        let f = setup();
        let ids = seed(&f.db, SubjectType::Student, &[10]);

        f.service
            .set_recommendation_status(ids[0], 1, SubjectType::Student, RecommendationStatus::Dismissed)
            .unwrap();

        let events = f.db.with_conn(|conn| behavior_events::history(conn, 1, None, None, 0)).unwrap();
        assert_eq!(events[0].behavior_type, BehaviorType::Dismiss);
        assert!(events[0].profile_fingerprint.is_some());
        assert_eq!(f.service.get(ids[0]).unwrap().status, RecommendationStatus::Dismissed);
    }
}
