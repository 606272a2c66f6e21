//! Service layer for campus-recommender
//!
//! Services encapsulate business logic between callers and repositories.
//! Each service wraps database operations with:
//! - Input validation
//! - Transaction boundaries
//! - Cache invalidation
//! - Event emission for audit and refresh triggers
//!
//! ## Architecture
//!
//! ```text
//! Callers (CLI, embedding application)
//!     ↓
//! Service Layer (behavior, profile, generator, lifecycle)
//!     ↓                       ↘
//! Repository Layer (db/*.rs)   Collaborator ports (candidate pool, directories)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod behavior_service;
pub mod profile_service;
pub mod generator;
pub mod lifecycle_service;
pub mod refresh;

// Re-exports
pub use events::{spawn_logging_listener, EventBus, EventListener, RecommendationEvent};
pub use behavior_service::{BehaviorService, RecordBehaviorInput};
pub use profile_service::ProfileService;
pub use generator::{GenerationReport, GeneratorParts, RecommendationGenerator};
pub use lifecycle_service::{LifecycleService, RecommendationPage};
pub use refresh::{spawn_refresh_scheduler, RefreshScheduler, RefreshSummary};

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{InMemoryCache, NoopCache, RecommendationCache};
use crate::candidates::CandidatePoolProvider;
use crate::config::Config;
use crate::db::models::{Clock, SystemClock};
use crate::db::RecommendDb;
use crate::directory::{
    OrganizationDirectory, PrincipalDirectory, StaticOrganizationDirectory, Subject, UserDirectory,
};
use crate::error::RecommendError;
use crate::scorer::{BaselineScorer, Scorer};

/// Service container for dependency injection
///
/// Holds all services over one shared database and event bus.
pub struct Services {
    pub behavior: Arc<BehaviorService>,
    pub profiles: Arc<ProfileService>,
    pub generator: Arc<RecommendationGenerator>,
    pub recommendations: Arc<LifecycleService>,
    pub events: Arc<EventBus>,
    db: Arc<RecommendDb>,
    users: Arc<dyn UserDirectory>,
    refresh_interval: Duration,
}

impl Services {
    /// Start building services over a database and candidate pool
    pub fn builder(db: Arc<RecommendDb>, pool: Arc<dyn CandidatePoolProvider>) -> ServicesBuilder {
        ServicesBuilder {
            db,
            pool,
            config: Config::default(),
            organizations: None,
            users: None,
            scorer: None,
            cache: None,
            clock: None,
        }
    }

    /// Create services with defaults for every optional collaborator
    pub fn new(db: Arc<RecommendDb>, pool: Arc<dyn CandidatePoolProvider>, config: &Config) -> Self {
        Self::builder(db, pool).config(config.clone()).build()
    }

    /// Resolve a caller principal to a subject
    pub async fn resolve_subject(&self, principal: &str) -> Result<Subject, RecommendError> {
        self.users.resolve_subject(principal).await
    }

    /// Scheduler regenerating subjects touched by behavior or profile changes
    ///
    /// Watches both this process's event bus and the shared database.
    pub fn refresh_scheduler(&self) -> Arc<RefreshScheduler> {
        Arc::new(
            RefreshScheduler::new(self.generator.clone(), self.events.clone(), self.refresh_interval)
                .with_change_feed(self.db.clone()),
        )
    }
}

/// Builder for [`Services`]
pub struct ServicesBuilder {
    db: Arc<RecommendDb>,
    pool: Arc<dyn CandidatePoolProvider>,
    config: Config,
    organizations: Option<Arc<dyn OrganizationDirectory>>,
    users: Option<Arc<dyn UserDirectory>>,
    scorer: Option<Arc<dyn Scorer>>,
    cache: Option<Arc<dyn RecommendationCache>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ServicesBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn organizations(mut self, organizations: Arc<dyn OrganizationDirectory>) -> Self {
        self.organizations = Some(organizations);
        self
    }

    pub fn users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn RecommendationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Services {
        let config = self.config;
        let events = Arc::new(EventBus::new());

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(BaselineScorer::new(config.scoring.clone())));
        let cache: Arc<dyn RecommendationCache> = match self.cache {
            Some(cache) => cache,
            None if config.store.cache_enabled => Arc::new(InMemoryCache::new(Duration::from_secs(
                config.store.cache_ttl_secs,
            ))),
            None => Arc::new(NoopCache),
        };
        let organizations = self
            .organizations
            .unwrap_or_else(|| Arc::new(StaticOrganizationDirectory::new()));
        let users = self.users.unwrap_or_else(|| Arc::new(PrincipalDirectory));

        let generator = RecommendationGenerator::new(
            GeneratorParts {
                db: self.db.clone(),
                events: events.clone(),
                pool: self.pool,
                organizations,
                scorer,
                cache: cache.clone(),
                clock: clock.clone(),
            },
            config.generation.clone(),
        );

        Services {
            behavior: Arc::new(BehaviorService::new(self.db.clone(), events.clone(), clock.clone())),
            profiles: Arc::new(ProfileService::new(self.db.clone(), events.clone(), clock.clone())),
            generator: Arc::new(generator),
            recommendations: Arc::new(LifecycleService::new(
                self.db.clone(),
                events.clone(),
                cache,
                clock,
                config.store.clone(),
            )),
            events,
            db: self.db,
            users,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
        }
    }
}
