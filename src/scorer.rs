//! Relevance scoring
//!
//! A [`Scorer`] is a pure function of (profile, behavior history, candidate,
//! now). It performs no I/O, so the generator can call it for every
//! candidate while holding nothing but borrowed data.
//!
//! ## Baseline policy
//!
//! - **Attribute overlap**: for each key carried by both the profile and the
//!   candidate, add `key_weight` on an exact match or
//!   `key_weight * partial_factor` when the values merely intersect.
//! - **Behavior affinity**: for each event whose target shares a value with
//!   the candidate, add `affinity_scale * weight * 0.5^(age_days / half_life)`.
//! - **Dismissal**: a candidate the subject dismissed under the current
//!   attribute set is excluded (`None`).
//! - The sum is clipped to `[0, 100]`.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::candidates::CandidateRef;
use crate::config::ScoringConfig;
use crate::db::models::{BehaviorEvent, BehaviorType, FeatureProfile, TargetId, TargetType};
use crate::features::{Attributes, ValueMatch};

/// Upper bound of a score
pub const MAX_SCORE: f64 = 100.0;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// A subject's events plus the attributes of the targets they reference
#[derive(Debug, Clone, Default)]
pub struct BehaviorHistory {
    events: Vec<BehaviorEvent>,
    target_attributes: HashMap<(TargetType, TargetId), Attributes>,
}

impl BehaviorHistory {
    /// Build a history, resolving target attributes from `candidates`
    ///
    /// Events against targets that are no longer in the pool keep counting
    /// toward their own target but cannot lend affinity to similar ones.
    pub fn new(events: Vec<BehaviorEvent>, candidates: &[CandidateRef]) -> Self {
        let target_attributes = candidates
            .iter()
            .map(|c| ((c.target_type, c.id), c.static_attributes.clone()))
            .collect();

        Self {
            events,
            target_attributes,
        }
    }

    pub fn events(&self) -> &[BehaviorEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether the subject dismissed this candidate while holding `fingerprint`
    ///
    /// Dismissals recorded without a fingerprint always count.
    pub fn is_dismissed(&self, candidate: &CandidateRef, fingerprint: &str) -> bool {
        self.events.iter().any(|e| {
            e.behavior_type == BehaviorType::Dismiss
                && e.target_id == candidate.id
                && e.target_type == candidate.target_type
                && e.profile_fingerprint.as_deref().map_or(true, |fp| fp == fingerprint)
        })
    }

    fn relates_to(&self, event: &BehaviorEvent, candidate: &CandidateRef) -> bool {
        if event.target_type != candidate.target_type {
            return false;
        }
        if event.target_id == candidate.id {
            return true;
        }
        self.target_attributes
            .get(&(event.target_type, event.target_id))
            .map(|attrs| shares_any_value(attrs, &candidate.static_attributes))
            .unwrap_or(false)
    }
}

fn shares_any_value(left: &Attributes, right: &Attributes) -> bool {
    left.iter().any(|(key, value)| {
        right
            .get(key)
            .map(|other| value.shares_value(other))
            .unwrap_or(false)
    })
}

/// Scores one candidate for one subject
pub trait Scorer: Send + Sync {
    /// Relevance in `[0, 100]`, or `None` when the candidate is excluded
    fn score(
        &self,
        profile: &FeatureProfile,
        history: &BehaviorHistory,
        candidate: &CandidateRef,
        now: DateTime<Utc>,
    ) -> Option<f64>;
}

/// Deterministic attribute-overlap plus decayed-affinity scorer
#[derive(Debug, Clone, Default)]
pub struct BaselineScorer {
    config: ScoringConfig,
}

impl BaselineScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Attribute overlap component
    pub fn overlap(&self, profile: &Attributes, candidate: &Attributes) -> f64 {
        profile
            .iter()
            .filter_map(|(key, value)| candidate.get(key).map(|other| value.compare(other)))
            .map(|m| match m {
                ValueMatch::Exact => self.config.key_weight,
                ValueMatch::Partial => self.config.key_weight * self.config.partial_factor,
                ValueMatch::Disjoint => 0.0,
            })
            .sum()
    }

    /// Behavior affinity component
    pub fn affinity(&self, history: &BehaviorHistory, candidate: &CandidateRef, now: DateTime<Utc>) -> f64 {
        history
            .events()
            .iter()
            .filter(|e| history.relates_to(e, candidate))
            .map(|e| self.config.affinity_scale * e.weight * self.decay(e.occurred_at, now))
            .sum()
    }

    fn decay(&self, occurred_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_days = ((now - occurred_at).num_milliseconds() as f64 / MILLIS_PER_DAY).max(0.0);
        0.5_f64.powf(age_days / self.config.half_life_days)
    }
}

impl Scorer for BaselineScorer {
    fn score(
        &self,
        profile: &FeatureProfile,
        history: &BehaviorHistory,
        candidate: &CandidateRef,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if history.is_dismissed(candidate, &profile.fingerprint()) {
            return None;
        }

        let raw = self.overlap(&profile.attributes, &candidate.static_attributes)
            + self.affinity(history, candidate, now);

        Some(if raw.is_finite() { raw.clamp(0.0, MAX_SCORE) } else { 0.0 })
    }
}

/// A candidate that survived scoring
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub target_id: TargetId,
    pub target_type: TargetType,
    pub score: f64,
}

/// Ordering of the ranked set: higher score first, then lower id
///
/// Scores are compared with `f64::total_cmp`, so the order is total and
/// identical across runs.
pub fn rank_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.target_id.cmp(&b.target_id))
}

/// Sort, drop everything at or below `min_relevance` and cap the length
pub fn rank_candidates(
    mut scored: Vec<ScoredCandidate>,
    min_relevance: f64,
    max_results: usize,
) -> Vec<ScoredCandidate> {
    scored.retain(|c| c.score > min_relevance);
    scored.sort_by(rank_order);
    scored.truncate(max_results);
    scored
}
