//! Trigger-driven regeneration
//!
//! Listens on the event bus for behavior and profile changes, keeps the set
//! of affected subjects, and regenerates that set on a fixed tick. Subjects
//! whose run fails stay dirty until a later tick succeeds.
//!
//! With a change feed attached, each tick also scans the database for
//! behavior and profile writes made by other processes since the last scan.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::db::models::BehaviorEventId;
use crate::db::{behavior_events, feature_profiles, RecommendDb};
use crate::directory::Subject;
use crate::error::RecommendError;

use super::events::{EventBus, RecommendationEvent};
use super::generator::RecommendationGenerator;

/// Result of one refresh tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub produced: usize,
}

/// Position of the last database scan
#[derive(Debug, Clone, Copy, Default)]
struct Watermark {
    event_id: BehaviorEventId,
    profile_write: Option<DateTime<Utc>>,
}

pub struct RefreshScheduler {
    generator: Arc<RecommendationGenerator>,
    events: Arc<EventBus>,
    interval: Duration,
    dirty: Mutex<BTreeSet<Subject>>,
    feed: Option<Arc<RecommendDb>>,
    watermark: Mutex<Option<Watermark>>,
}

impl RefreshScheduler {
    pub fn new(generator: Arc<RecommendationGenerator>, events: Arc<EventBus>, interval: Duration) -> Self {
        Self {
            generator,
            events,
            interval,
            dirty: Mutex::new(BTreeSet::new()),
            feed: None,
            watermark: Mutex::new(None),
        }
    }

    /// Also pick up writes made to `db` outside this process
    ///
    /// The first scan only records the current position; history from
    /// before the scheduler started is not replayed.
    pub fn with_change_feed(mut self, db: Arc<RecommendDb>) -> Self {
        self.feed = Some(db);
        self
    }

    pub fn mark_dirty(&self, subject: Subject) {
        self.dirty_set().insert(subject);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_set().len()
    }

    /// Record the subject an event affects, if any
    pub fn observe(&self, event: &RecommendationEvent) {
        if let Some((subject_type, subject_id)) = event.dirty_subject() {
            self.mark_dirty(Subject {
                subject_id,
                subject_type,
            });
        }
    }

    /// Mark subjects written in the database since the previous scan
    ///
    /// Returns how many subjects the scan found.
    pub fn poll_changes(&self) -> Result<usize, RecommendError> {
        let Some(db) = &self.feed else {
            return Ok(0);
        };

        let (subjects, next) = db.with_conn(|conn| {
            let next = Watermark {
                event_id: behavior_events::latest_event_id(conn)?,
                profile_write: feature_profiles::latest_update(conn)?,
            };

            let Some(previous) = *self.watermark_slot() else {
                return Ok((Vec::new(), next));
            };

            let mut subjects = Vec::new();
            for (actor_id, target_type) in behavior_events::actors_after(conn, previous.event_id)? {
                subjects.push(Subject {
                    subject_id: actor_id,
                    subject_type: target_type.audience(),
                });
            }
            for (subject_id, subject_type) in feature_profiles::updated_after(conn, previous.profile_write)? {
                subjects.push(Subject {
                    subject_id,
                    subject_type,
                });
            }
            Ok((subjects, next))
        })?;

        *self.watermark_slot() = Some(next);

        let found = subjects.len();
        if found > 0 {
            debug!(found, "Change feed marked subjects dirty");
        }
        let mut dirty = self.dirty_set();
        dirty.extend(subjects);
        Ok(found)
    }

    /// Regenerate every dirty subject once
    pub async fn tick(&self) -> RefreshSummary {
        if let Err(e) = self.poll_changes() {
            warn!(error = %e, "Change feed scan failed");
        }

        let subjects: Vec<Subject> = std::mem::take(&mut *self.dirty_set()).into_iter().collect();
        if subjects.is_empty() {
            return RefreshSummary::default();
        }

        let mut summary = RefreshSummary::default();
        for (subject, result) in self.generator.generate_many(subjects).await {
            match result {
                Ok(report) => {
                    summary.refreshed += 1;
                    summary.produced += report.produced();
                }
                Err(_) => {
                    summary.failed += 1;
                    self.mark_dirty(subject);
                }
            }
        }

        info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            produced = summary.produced,
            "Refresh tick complete"
        );
        summary
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut receiver = self.events.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Ok(event) => self.observe(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Refresh scheduler lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed, stopping refresh scheduler");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Refresh scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn dirty_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<Subject>> {
        self.dirty.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn watermark_slot(&self) -> std::sync::MutexGuard<'_, Option<Watermark>> {
        self.watermark.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Spawn the scheduler loop
pub fn spawn_refresh_scheduler(
    scheduler: Arc<RefreshScheduler>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(scheduler.run(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use crate::candidates::{CandidatePoolProvider, CandidateRef, OrganizationScope};
    use crate::config::{GenerationConfig, ScoringConfig};
    use crate::db::models::{BehaviorType, FixedClock, SubjectType, TargetType};
    use crate::db::RecommendDb;
    use crate::directory::StaticOrganizationDirectory;
    use crate::error::RecommendError;
    use crate::scorer::BaselineScorer;
    use crate::services::generator::GeneratorParts;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyPool {
        down: AtomicBool,
    }

    #[async_trait]
    impl CandidatePoolProvider for FlakyPool {
        async fn list_active_candidates(
            &self,
            _subject_type: SubjectType,
            _scope: Option<&OrganizationScope>,
        ) -> Result<Vec<CandidateRef>, RecommendError> {
            if self.down.load(Ordering::SeqCst) {
                Err(RecommendError::CandidateSourceUnavailable("down".into()))
            } else {
                Ok(vec![])
            }
        }
    }

    fn scheduler(pool: Arc<FlakyPool>) -> (Arc<RefreshScheduler>, Arc<EventBus>) {
        let (scheduler, events, _) = scheduler_with_db(pool);
        (Arc::new(scheduler), events)
    }

    fn scheduler_with_db(pool: Arc<FlakyPool>) -> (RefreshScheduler, Arc<EventBus>, Arc<RecommendDb>) {
        let events = Arc::new(EventBus::new());
        let db = Arc::new(RecommendDb::open_in_memory().unwrap());
        let generator = RecommendationGenerator::new(
            GeneratorParts {
                db: db.clone(),
                events: events.clone(),
                pool,
                organizations: Arc::new(StaticOrganizationDirectory::new()),
                scorer: Arc::new(BaselineScorer::new(ScoringConfig::default())),
                cache: Arc::new(NoopCache),
                clock: Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())),
            },
            GenerationConfig::default(),
        );
        let scheduler = RefreshScheduler::new(Arc::new(generator), events.clone(), Duration::from_millis(20));
        (scheduler, events, db)
    }

    fn behavior(actor_id: i64) -> RecommendationEvent {
        RecommendationEvent::BehaviorRecorded {
            event_id: 1,
            actor_id,
            actor_type: SubjectType::Student,
            target_id: 9,
            target_type: TargetType::Job,
            behavior_type: BehaviorType::View,
        }
    }

    #[tokio::test]
    async fn test_failed_subjects_stay_dirty() {
        let pool = Arc::new(FlakyPool { down: AtomicBool::new(true) });
        let (scheduler, _) = scheduler(pool.clone());

        scheduler.observe(&behavior(1));
        scheduler.observe(&behavior(1));
        scheduler.observe(&behavior(2));
        assert_eq!(scheduler.dirty_count(), 2);

        let failed = scheduler.tick().await;
        assert_eq!(failed.failed, 2);
        assert_eq!(scheduler.dirty_count(), 2);

        pool.down.store(false, Ordering::SeqCst);
        let recovered = scheduler.tick().await;
        assert_eq!(recovered.refreshed, 2);
        assert_eq!(scheduler.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_change_feed_sees_writes_after_first_scan() {
        let pool = Arc::new(FlakyPool { down: AtomicBool::new(false) });
        let (scheduler, _, db) = scheduler_with_db(pool);
        let scheduler = scheduler.with_change_feed(db.clone());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();

        let record = |actor_id: i64, target_type: TargetType| {
            db.with_conn_mut(|conn| {
                behavior_events::record_event(
                    conn,
                    &behavior_events::NewBehaviorEvent {
                        actor_id,
                        target_id: 9,
                        target_type,
                        behavior_type: BehaviorType::View,
                        weight: 1.0,
                        profile_fingerprint: None,
                        occurred_at: t0,
                    },
                )
            })
            .unwrap();
        };

        // Writes before the first scan are history
        record(1, TargetType::Job);
        assert_eq!(scheduler.poll_changes().unwrap(), 0);
        assert_eq!(scheduler.dirty_count(), 0);

        record(2, TargetType::Job);
        record(5, TargetType::Student);
        let mut attrs = crate::features::Attributes::new();
        attrs.insert("skills".into(), crate::features::FeatureValue::List(vec!["rust".into()]));
        db.with_conn(|conn| feature_profiles::write_profile(conn, 6, SubjectType::Student, &attrs, t1))
            .unwrap();

        assert_eq!(scheduler.poll_changes().unwrap(), 3);
        let dirty = scheduler.dirty_set().clone();
        assert!(dirty.contains(&Subject::student(2)));
        assert!(dirty.contains(&Subject::organization(5)));
        assert!(dirty.contains(&Subject::student(6)));

        // Nothing new since the last scan
        assert_eq!(scheduler.poll_changes().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_picks_up_events_and_stops() {
        let pool = Arc::new(FlakyPool { down: AtomicBool::new(false) });
        let (scheduler, events) = scheduler(pool);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_refresh_scheduler(scheduler.clone(), shutdown_rx);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut observer = events.subscribe();
        events.emit(behavior(3));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.dirty_count(), 0);

        let mut regenerated = false;
        while let Ok(event) = observer.try_recv() {
            if let RecommendationEvent::RecommendationsGenerated { subject_id: 3, .. } = event {
                regenerated = true;
            }
        }
        assert!(regenerated);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
