//! Campus Recommender - job and talent recommendations for a school-enterprise platform
//!
//! Produces ranked job recommendations for students and ranked talent
//! recommendations for organizations from recorded behavior and explicit
//! feature profiles, with idempotent regeneration and a status lifecycle
//! per recommendation.
//!
//! ## Architecture
//!
//! - **Behavior Store**: append-only interaction log (`db::behavior_events`)
//! - **Feature Profile Store**: merge-patched attribute maps (`db::feature_profiles`)
//! - **Candidate Pool**: external, read through [`CandidatePoolProvider`]
//! - **Scorer**: pure relevance function ([`Scorer`], [`BaselineScorer`])
//! - **Generator**: per-subject transactional upsert ([`RecommendationGenerator`])
//! - **Lifecycle**: paging and status transitions ([`LifecycleService`])
//!
//! ## Data Layout
//!
//! ```text
//! ~/.local/share/campus-recommender/
//! ├── recommendations.db     # SQLite (WAL)
//! └── config.toml            # Configuration
//! ```

pub mod cache;
pub mod candidates;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod features;
pub mod scorer;
pub mod services;

// Re-exports
pub use cache::{InMemoryCache, NoopCache, RecommendationCache};
pub use candidates::{
    CandidatePoolProvider, CandidateRef, FileCandidatePool, OrganizationScope, PoolSnapshot,
    StaticCandidatePool,
};
pub use config::Config;
pub use db::{
    BehaviorEvent, BehaviorType, Clock, FeatureProfile, FixedClock, Recommendation,
    RecommendationStatus, RecommendDb, SubjectType, SystemClock, TargetType,
};
pub use directory::{
    OrganizationDirectory, PrincipalDirectory, StaticOrganizationDirectory, Subject, UserDirectory,
};
pub use error::RecommendError;
pub use features::{AttributePatch, Attributes, FeatureKey, FeatureValue};
pub use scorer::{BaselineScorer, BehaviorHistory, Scorer};
pub use services::{
    BehaviorService, GenerationReport, LifecycleService, ProfileService, RecommendationGenerator,
    RecommendationPage, RecordBehaviorInput, RefreshScheduler, Services,
};
