//! Recommendation generator
//!
//! One run for one subject:
//!
//! ```text
//! candidate pool (async, bounded by timeout)
//!     ↓
//! ┌─ single SQLite transaction ───────────────────────────┐
//! │ profile (created lazily) + behavior history           │
//! │     ↓                                                 │
//! │ skip targets with a terminal decision                 │
//! │     ↓                                                 │
//! │ score → drop dismissed / irrelevant → rank → cap      │
//! │     ↓                                                 │
//! │ insert new, rerank pending/viewed, retire the rest    │
//! └───────────────────────────────────────────────────────┘
//!     ↓
//! invalidate cached pages, emit RecommendationsGenerated
//! ```
//!
//! Runs for the same subject are serialized by a per-subject async lock.
//! Any failure before commit leaves the previous set untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{self, RecommendationCache};
use crate::candidates::{CandidatePoolProvider, CandidateRef, OrganizationScope};
use crate::config::GenerationConfig;
use crate::db::models::{Clock, SubjectId, SubjectType};
use crate::db::recommendations::{self, NewRecommendation};
use crate::db::{behavior_events, feature_profiles, RecommendDb};
use crate::directory::{OrganizationDirectory, Subject};
use crate::error::RecommendError;
use crate::scorer::{rank_candidates, BehaviorHistory, ScoredCandidate, Scorer};

use super::events::{EventBus, RecommendationEvent};

/// Outcome of one generation run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub subject_id: SubjectId,
    pub subject_type: SubjectType,
    pub batch_id: String,
    /// Candidates offered by the pool
    pub candidates: usize,
    /// Candidates skipped because the subject already acted on them
    pub decided: usize,
    /// Candidates excluded by an active dismissal
    pub dismissed: usize,
    /// Candidates at or below the relevance threshold, or past the cap
    pub dropped: usize,
    pub created: usize,
    /// Existing recommendations whose rank changed
    pub reranked: usize,
    /// Existing recommendations with only a new score
    pub rescored: usize,
    pub unchanged: usize,
    pub retired: usize,
}

impl GenerationReport {
    fn new(subject_id: SubjectId, subject_type: SubjectType, batch_id: String, candidates: usize) -> Self {
        Self {
            subject_id,
            subject_type,
            batch_id,
            candidates,
            decided: 0,
            dismissed: 0,
            dropped: 0,
            created: 0,
            reranked: 0,
            rescored: 0,
            unchanged: 0,
            retired: 0,
        }
    }

    /// Diagnostic count: created plus rank-changed recommendations
    pub fn produced(&self) -> usize {
        self.created + self.reranked
    }
}

type SubjectKey = (SubjectType, SubjectId);

/// Orchestrates pool, profile, behavior and scorer into the store
pub struct RecommendationGenerator {
    db: Arc<RecommendDb>,
    events: Arc<EventBus>,
    pool: Arc<dyn CandidatePoolProvider>,
    organizations: Arc<dyn OrganizationDirectory>,
    scorer: Arc<dyn Scorer>,
    cache: Arc<dyn RecommendationCache>,
    clock: Arc<dyn Clock>,
    config: GenerationConfig,
    subject_locks: DashMap<SubjectKey, Arc<Mutex<()>>>,
}

/// Collaborators of a generator
pub struct GeneratorParts {
    pub db: Arc<RecommendDb>,
    pub events: Arc<EventBus>,
    pub pool: Arc<dyn CandidatePoolProvider>,
    pub organizations: Arc<dyn OrganizationDirectory>,
    pub scorer: Arc<dyn Scorer>,
    pub cache: Arc<dyn RecommendationCache>,
    pub clock: Arc<dyn Clock>,
}

impl RecommendationGenerator {
    pub fn new(parts: GeneratorParts, config: GenerationConfig) -> Self {
        Self {
            db: parts.db,
            events: parts.events,
            pool: parts.pool,
            organizations: parts.organizations,
            scorer: parts.scorer,
            cache: parts.cache,
            clock: parts.clock,
            config,
            subject_locks: DashMap::new(),
        }
    }

    /// Regenerate a subject and return the diagnostic count
    pub async fn generate_recommendations(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
        scope: Option<OrganizationScope>,
    ) -> Result<usize, RecommendError> {
        self.generate(subject_id, subject_type, scope)
            .await
            .map(|report| report.produced())
    }

    /// Regenerate a subject and return the full report
    pub async fn generate(
        &self,
        subject_id: SubjectId,
        subject_type: SubjectType,
        scope: Option<OrganizationScope>,
    ) -> Result<GenerationReport, RecommendError> {
        let lock = self.subject_lock((subject_type, subject_id));
        let _guard = lock.lock().await;

        let scope = match (scope, subject_type) {
            (Some(scope), _) => Some(scope),
            (None, SubjectType::Organization) => Some(self.organizations.scope_for(subject_id).await?),
            (None, SubjectType::Student) => None,
        };

        let candidates = self.fetch_candidates(subject_type, scope.as_ref()).await?;
        let batch_id = Uuid::new_v4().to_string();
        let now = self.clock.now();

        let report = self.db.with_conn_mut(|conn| {
            // Take the write lock up front; another process may be generating too
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let profile = feature_profiles::ensure_profile(&tx, subject_id, subject_type, now)?;
            let events = behavior_events::history(&tx, subject_id, Some(subject_type.target_type()), None, 0)?;
            let history = BehaviorHistory::new(events, &candidates);
            let active = recommendations::active_for_subject(&tx, subject_id, subject_type)?;

            let mut report =
                GenerationReport::new(subject_id, subject_type, batch_id.clone(), candidates.len());

            let decided: HashSet<_> = active
                .iter()
                .filter(|r| r.status.is_terminal())
                .map(|r| r.target_id)
                .collect();
            let open: HashMap<_, _> = active
                .iter()
                .filter(|r| !r.status.is_terminal())
                .map(|r| (r.target_id, r))
                .collect();

            let mut scored = Vec::with_capacity(candidates.len());
            for candidate in &candidates {
                if decided.contains(&candidate.id) {
                    report.decided += 1;
                    continue;
                }
                match self.scorer.score(&profile, &history, candidate, now) {
                    Some(score) => scored.push(ScoredCandidate {
                        target_id: candidate.id,
                        target_type: candidate.target_type,
                        score,
                    }),
                    None => report.dismissed += 1,
                }
            }

            let scored_count = scored.len();
            let ranked = rank_candidates(scored, self.config.min_relevance, self.config.max_recommendations);
            report.dropped = scored_count - ranked.len();

            let mut kept = HashSet::with_capacity(ranked.len());
            for (index, candidate) in ranked.iter().enumerate() {
                let rank = index as i64 + 1;
                kept.insert(candidate.target_id);

                match open.get(&candidate.target_id) {
                    Some(existing) if existing.rank == rank && existing.score == candidate.score => {
                        report.unchanged += 1;
                    }
                    Some(existing) => {
                        if recommendations::rerank(&tx, existing.id, candidate.score, rank, &batch_id, now)? {
                            if existing.rank != rank {
                                report.reranked += 1;
                            } else {
                                report.rescored += 1;
                            }
                        }
                    }
                    None => {
                        recommendations::insert_recommendation(
                            &tx,
                            &NewRecommendation {
                                subject_id,
                                subject_type,
                                target_id: candidate.target_id,
                                target_type: candidate.target_type,
                                score: candidate.score,
                                rank,
                                batch_id: &batch_id,
                                now,
                            },
                        )?;
                        report.created += 1;
                    }
                }
            }

            for (target_id, existing) in &open {
                if !kept.contains(target_id) && recommendations::retire(&tx, existing.id, now)? {
                    report.retired += 1;
                }
            }

            tx.commit()?;

            // Still under the connection lock, so no reader can re-cache the old set
            self.cache
                .invalidate_prefix(&cache::subject_prefix(subject_type, subject_id));

            Ok(report)
        })?;

        info!(
            subject_id,
            subject_type = %subject_type,
            batch_id = %report.batch_id,
            candidates = report.candidates,
            created = report.created,
            reranked = report.reranked,
            retired = report.retired,
            dismissed = report.dismissed,
            "Generation run complete"
        );

        self.events.emit(RecommendationEvent::RecommendationsGenerated {
            subject_id,
            subject_type,
            batch_id: report.batch_id.clone(),
            created: report.created,
            reranked: report.reranked,
            retired: report.retired,
        });

        Ok(report)
    }

    /// Regenerate many subjects with bounded parallelism
    ///
    /// Results come back in input order; one failure does not stop the rest.
    pub async fn generate_many(
        &self,
        subjects: Vec<Subject>,
    ) -> Vec<(Subject, Result<GenerationReport, RecommendError>)> {
        let parallelism = self.config.max_parallel_generations.max(1);

        stream::iter(subjects)
            .map(|subject| async move {
                let result = self
                    .generate(subject.subject_id, subject.subject_type, None)
                    .await;
                if let Err(ref e) = result {
                    warn!(subject = %subject, error = %e, "Generation failed");
                }
                (subject, result)
            })
            .buffered(parallelism)
            .collect()
            .await
    }

    async fn fetch_candidates(
        &self,
        subject_type: SubjectType,
        scope: Option<&OrganizationScope>,
    ) -> Result<Vec<CandidateRef>, RecommendError> {
        let timeout = Duration::from_millis(self.config.candidate_timeout_ms);

        let candidates = match tokio::time::timeout(timeout, self.pool.list_active_candidates(subject_type, scope)).await {
            Err(_) => {
                return Err(RecommendError::CandidateSourceUnavailable(format!(
                    "candidate pool timed out after {}ms",
                    self.config.candidate_timeout_ms
                )));
            }
            Ok(Err(e @ RecommendError::CandidateSourceUnavailable(_))) => return Err(e),
            Ok(Err(e)) => return Err(RecommendError::CandidateSourceUnavailable(e.to_string())),
            Ok(Ok(candidates)) => candidates,
        };

        let expected = subject_type.target_type();
        let mut seen = HashSet::with_capacity(candidates.len());
        let offered = candidates.len();

        let candidates: Vec<CandidateRef> = candidates
            .into_iter()
            .filter(|c| c.target_type == expected && seen.insert(c.id))
            .collect();

        if candidates.len() != offered {
            debug!(
                offered,
                kept = candidates.len(),
                "Dropped duplicate or mistyped candidates"
            );
        }

        Ok(candidates)
    }

    fn subject_lock(&self, key: SubjectKey) -> Arc<Mutex<()>> {
        self.subject_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
