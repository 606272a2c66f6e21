//! Integration tests for recommendation generation
//!
//! Every test runs against an in-memory database, an in-memory candidate
//! pool and a fixed clock, so scores and ranks are reproducible.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use campus_recommender::candidates::{JobListing, StudentListing};
use campus_recommender::{
    AttributePatch, Attributes, CandidatePoolProvider, CandidateRef, Config, FeatureValue,
    FixedClock, OrganizationScope, PoolSnapshot, RecommendDb, RecommendError,
    RecommendationStatus, RecordBehaviorInput, Services, StaticCandidatePool,
    StaticOrganizationDirectory, SubjectType, TargetType,
};

const STUDENT: i64 = 1;

fn list(values: &[&str]) -> FeatureValue {
    FeatureValue::List(values.iter().map(|s| s.to_string()).collect())
}

fn job(id: i64, organization_id: i64, skills: &[&str]) -> JobListing {
    let mut attributes = Attributes::new();
    attributes.insert("skills".into(), list(skills));
    JobListing {
        id,
        organization_id,
        status: "open".into(),
        attributes,
    }
}

fn skills_patch(skills: &[&str]) -> AttributePatch {
    let mut patch = AttributePatch::new();
    patch.insert("skills".into(), Some(list(skills)));
    patch
}

/// Pool that can be switched off to simulate an unavailable collaborator
struct SwitchablePool {
    inner: StaticCandidatePool,
    down: AtomicBool,
}

#[async_trait]
impl CandidatePoolProvider for SwitchablePool {
    async fn list_active_candidates(
        &self,
        subject_type: SubjectType,
        scope: Option<&OrganizationScope>,
    ) -> Result<Vec<CandidateRef>, RecommendError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RecommendError::CandidateSourceUnavailable("jobs service down".into()));
        }
        self.inner.list_active_candidates(subject_type, scope).await
    }
}

struct Harness {
    services: Services,
    pool: Arc<SwitchablePool>,
    clock: Arc<FixedClock>,
}

fn harness(jobs: Vec<JobListing>) -> Harness {
    harness_with(PoolSnapshot {
        jobs,
        ..Default::default()
    })
}

fn harness_with(snapshot: PoolSnapshot) -> Harness {
    let db = Arc::new(RecommendDb::open_in_memory().unwrap());
    let pool = Arc::new(SwitchablePool {
        inner: StaticCandidatePool::new(snapshot.clone()),
        down: AtomicBool::new(false),
    });
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 9, 1, 9, 0, 0).unwrap()));
    let services = Services::builder(db, pool.clone())
        .config(Config::default())
        .organizations(Arc::new(StaticOrganizationDirectory::from_scopes(
            snapshot.organizations,
        )))
        .clock(clock.clone())
        .build();

    Harness {
        services,
        pool,
        clock,
    }
}

fn record(services: &Services, actor_id: i64, target_id: i64, kind: &str) {
    services
        .behavior
        .record_behavior(RecordBehaviorInput {
            actor_id,
            target_id,
            target_type: TargetType::Job,
            behavior_type: kind.into(),
            weight: None,
        })
        .unwrap();
}

fn visible_targets(services: &Services, subject_id: i64, subject_type: SubjectType) -> Vec<i64> {
    services
        .recommendations
        .list_recommendations(subject_id, subject_type, 1, 100)
        .unwrap()
        .items
        .into_iter()
        .map(|r| r.target_id)
        .collect()
}

/// A single matching job is recommended, the unrelated one is not
#[tokio::test]
async fn test_profile_match_produces_single_recommendation() {
    let h = harness(vec![job(1, 50, &["java", "go"]), job(2, 50, &["python"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["java"]))
        .unwrap();

    let produced = h
        .services
        .generator
        .generate_recommendations(STUDENT, SubjectType::Student, None)
        .await
        .unwrap();
    assert_eq!(produced, 1);

    let page = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].target_id, 1);
    assert_eq!(page.items[0].rank, 1);
    assert!(page.items[0].score > 0.0);
    assert_eq!(page.items[0].status, RecommendationStatus::Pending);
}

/// Regenerating with unchanged inputs changes nothing
#[tokio::test]
async fn test_regeneration_is_idempotent() {
    let h = harness(vec![
        job(1, 50, &["rust"]),
        job(2, 50, &["rust", "sql"]),
        job(3, 51, &["sql"]),
    ]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();
    record(&h.services, STUDENT, 3, "favorite");

    let first = h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(first.created, 3);
    let before = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap();

    let second = h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(second.produced(), 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.retired, 0);

    let after = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap();
    let key = |p: &campus_recommender::RecommendationPage| {
        p.items
            .iter()
            .map(|r| (r.id, r.target_id, r.rank, r.score))
            .collect::<Vec<_>>()
    };
    assert_eq!(key(&before), key(&after));
}

/// Ranks follow scores; equal scores fall back to the lower target id
#[tokio::test]
async fn test_rank_follows_score_then_target_id() {
    let h = harness(vec![
        job(4, 50, &["sql"]),
        job(2, 50, &["rust", "sql"]),
        job(3, 50, &["rust"]),
        job(9, 50, &["sql"]),
    ]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();

    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    let items = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap()
        .items;

    // Exact match first, then three partial matches ordered by id
    let order: Vec<_> = items.iter().map(|r| r.target_id).collect();
    assert_eq!(order, vec![2, 3, 4, 9]);
    for pair in items.windows(2) {
        assert!(pair[0].rank < pair[1].rank);
        assert!(pair[0].score >= pair[1].score);
    }
}

/// A dismissed job never comes back under the same profile
#[tokio::test]
async fn test_dismissed_target_stays_excluded() {
    // The dismissal also weighs down similar jobs, so 8 needs a strong match
    let h = harness(vec![job(7, 50, &["rust", "sql"]), job(8, 50, &["sql", "rust"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();

    record(&h.services, STUDENT, 7, "dismiss");

    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(visible_targets(&h.services, STUDENT, SubjectType::Student), vec![8]);

    // Still excluded after time passes and more signals arrive
    h.clock.advance(Duration::days(30));
    record(&h.services, STUDENT, 8, "apply");
    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert!(!visible_targets(&h.services, STUDENT, SubjectType::Student).contains(&7));
}

/// A dismissal lapses once the subject's profile changes
#[tokio::test]
async fn test_dismissal_lapses_after_profile_change() {
    let h = harness(vec![job(7, 50, &["rust", "sql"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust"]))
        .unwrap();
    record(&h.services, STUDENT, 7, "dismiss");

    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert!(visible_targets(&h.services, STUDENT, SubjectType::Student).is_empty());

    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();
    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(visible_targets(&h.services, STUDENT, SubjectType::Student), vec![7]);
}

/// A dismissal made through the lifecycle is a terminal decision and
/// survives profile changes, unlike a recorded DISMISS behavior
#[tokio::test]
async fn test_lifecycle_dismissal_outlives_profile_change() {
    let h = harness(vec![job(7, 50, &["rust", "sql"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();
    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();

    let rec = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 1)
        .unwrap()
        .items
        .remove(0);
    h.services
        .recommendations
        .set_recommendation_status(rec.id, STUDENT, SubjectType::Student, RecommendationStatus::Dismissed)
        .unwrap();

    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust"]))
        .unwrap();
    let report = h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(report.decided, 1);
    assert_eq!(report.created, 0);

    let items = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap()
        .items;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, rec.id);
    assert_eq!(items[0].status, RecommendationStatus::Dismissed);
}

/// Decided rows keep the rank of their own batch, so a page may show the
/// same rank twice; ranks stay unique within each batch
#[tokio::test]
async fn test_decided_rows_keep_rank_of_their_batch() {
    let h = harness(vec![job(1, 50, &["rust", "sql"]), job(2, 50, &["rust"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();
    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();

    let top = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 1)
        .unwrap()
        .items
        .remove(0);
    assert_eq!((top.target_id, top.rank), (1, 1));
    h.services
        .recommendations
        .set_recommendation_status(top.id, STUDENT, SubjectType::Student, RecommendationStatus::Applied)
        .unwrap();

    let report = h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(report.reranked, 1);

    let items = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap()
        .items;
    let rows: Vec<_> = items.iter().map(|r| (r.target_id, r.rank, r.status)).collect();
    assert_eq!(
        rows,
        vec![(1, 1, RecommendationStatus::Applied), (2, 1, RecommendationStatus::Pending)]
    );
    assert_ne!(items[0].batch_id, items[1].batch_id);

    let mut per_batch = HashSet::new();
    for r in &items {
        assert!(per_batch.insert((r.batch_id.clone(), r.rank)));
    }
}

/// Recommendations whose job closed are retired; the rest close ranks
#[tokio::test]
async fn test_closed_job_is_retired_on_next_run() {
    let h = harness(vec![job(1, 50, &["rust", "sql"]), job(2, 50, &["rust"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();
    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(visible_targets(&h.services, STUDENT, SubjectType::Student), vec![1, 2]);

    h.pool.inner.close_job(1).await;
    let report = h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(report.retired, 1);
    assert_eq!(report.reranked, 1);

    let items = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap()
        .items;
    assert_eq!(items.len(), 1);
    assert_eq!((items[0].target_id, items[0].rank), (2, 1));
}

/// Applied recommendations survive regeneration untouched
#[tokio::test]
async fn test_terminal_recommendations_are_not_regenerated() {
    let h = harness(vec![job(1, 50, &["rust"]), job(2, 50, &["rust", "sql"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust", "sql"]))
        .unwrap();
    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();

    let top = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 1)
        .unwrap()
        .items
        .remove(0);
    assert_eq!(top.target_id, 2);
    h.services
        .recommendations
        .set_recommendation_status(top.id, STUDENT, SubjectType::Student, RecommendationStatus::Applied)
        .unwrap();

    // Even after the job closes, the applied row is kept as it was
    h.pool.inner.close_job(2).await;
    let report = h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    assert_eq!(report.retired, 0);

    let applied = h.services.recommendations.get(top.id).unwrap();
    assert_eq!(applied.status, RecommendationStatus::Applied);
    assert_eq!(applied.score, top.score);
    assert_eq!(applied.batch_id, top.batch_id);
}

/// A failing pool leaves the previous recommendation set in place
#[tokio::test]
async fn test_failed_run_keeps_previous_set() {
    let h = harness(vec![job(1, 50, &["rust"]), job(2, 50, &["rust"])]);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust"]))
        .unwrap();
    h.services.generator.generate(STUDENT, SubjectType::Student, None).await.unwrap();
    let before = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap();

    h.pool.down.store(true, Ordering::SeqCst);
    let err = h
        .services
        .generator
        .generate(STUDENT, SubjectType::Student, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RecommendError::CandidateSourceUnavailable(_)));
    assert!(err.is_retryable());

    let after = h
        .services
        .recommendations
        .list_recommendations(STUDENT, SubjectType::Student, 1, 20)
        .unwrap();
    assert_eq!(before.items, after.items);
}

/// Concurrent runs for one subject serialize without duplicate targets
#[tokio::test]
async fn test_concurrent_generation_has_no_duplicates() {
    let jobs = (1..=20).map(|id| job(id, 50, &["rust"])).collect();
    let h = harness(jobs);
    h.services
        .profiles
        .update_profile(STUDENT, SubjectType::Student, skills_patch(&["rust"]))
        .unwrap();

    let generator = h.services.generator.clone();
    let (a, b) = tokio::join!(
        generator.generate(STUDENT, SubjectType::Student, None),
        generator.generate(STUDENT, SubjectType::Student, None),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // One run created everything, the other found it in place
    assert_eq!(a.created + b.created, 20);
    assert_eq!(a.unchanged + b.unchanged, 20);

    let targets = visible_targets(&h.services, STUDENT, SubjectType::Student);
    let unique: HashSet<_> = targets.iter().collect();
    assert_eq!(targets.len(), 20);
    assert_eq!(unique.len(), 20);
}

/// Organizations see only students admitted by their scope
#[tokio::test]
async fn test_talent_recommendations_respect_scope() {
    let student = |id: i64, majors: &[&str], complete: bool| {
        let mut attributes = Attributes::new();
        attributes.insert("majors".into(), list(majors));
        attributes.insert("skills".into(), list(&["rust", "go"]));
        StudentListing {
            id,
            profile_complete: complete,
            attributes,
        }
    };
    let h = harness_with(PoolSnapshot {
        jobs: vec![],
        students: vec![
            student(10, &["computer science"], true),
            student(11, &["mathematics"], true),
            student(12, &["computer science"], false),
        ],
        organizations: vec![OrganizationScope {
            organization_id: 5,
            allowed_majors: vec!["computer science".into()],
            allowed_locations: vec![],
        }],
    });

    let mut patch = AttributePatch::new();
    patch.insert("majors".into(), Some(list(&["computer science"])));
    patch.insert("skills".into(), Some(list(&["rust"])));
    h.services
        .profiles
        .update_profile(5, SubjectType::Organization, patch)
        .unwrap();

    h.services.generator.generate(5, SubjectType::Organization, None).await.unwrap();
    let items = h
        .services
        .recommendations
        .list_recommendations(5, SubjectType::Organization, 1, 20)
        .unwrap()
        .items;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].target_id, 10);
    assert_eq!(items[0].target_type, TargetType::Student);

    // A student with the same id sees nothing of it
    assert!(visible_targets(&h.services, 5, SubjectType::Student).is_empty());
}

/// Batch regeneration reports each subject separately
#[tokio::test]
async fn test_generate_many_isolates_failures() {
    let h = harness(vec![job(1, 50, &["rust"])]);
    for id in [1, 2] {
        h.services
            .profiles
            .update_profile(id, SubjectType::Student, skills_patch(&["rust"]))
            .unwrap();
    }

    let subjects = vec![
        campus_recommender::Subject::student(1),
        campus_recommender::Subject::student(2),
    ];
    let results = h.services.generator.generate_many(subjects.clone()).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(results[0].0, subjects[0]);

    h.pool.down.store(true, Ordering::SeqCst);
    let results = h.services.generator.generate_many(subjects).await;
    assert!(results.iter().all(|(_, r)| r.is_err()));
    assert_eq!(visible_targets(&h.services, 2, SubjectType::Student), vec![1]);
}
