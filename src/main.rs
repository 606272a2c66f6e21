//! Campus Recommender CLI
//!
//! ## Usage
//!
//! ```bash
//! # Record that student 42 viewed job 7
//! campus-recommender record student:42 7 view
//!
//! # Edit a profile (merge-patch; null removes a key)
//! campus-recommender profile set student:42 '{"skills": ["rust", "sql"], "location": null}'
//!
//! # Regenerate and page through recommendations
//! campus-recommender --pool pool.json generate student:42
//! campus-recommender list student:42 --page 1 --size 20
//!
//! # Act on a recommendation
//! campus-recommender status student:42 15 applied
//!
//! # Regenerate subjects as their behavior and profiles change
//! campus-recommender --pool pool.json watch
//! ```
//!
//! Every command prints JSON on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use campus_recommender::candidates::FileCandidatePool;
use campus_recommender::services::{spawn_logging_listener, spawn_refresh_scheduler};
use campus_recommender::{
    AttributePatch, Config, PrincipalDirectory, RecommendDb, RecommendationStatus,
    RecordBehaviorInput, Services, StaticOrganizationDirectory, Subject,
};

#[derive(Parser, Debug)]
#[command(name = "campus-recommender")]
#[command(about = "Job and talent recommendations from behavior and feature profiles")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "CAMPUS_RECOMMENDER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (database and default config)
    #[arg(long, env = "CAMPUS_RECOMMENDER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Candidate pool JSON file (defaults to <data-dir>/pool.json)
    #[arg(long, env = "CAMPUS_RECOMMENDER_POOL")]
    pool: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a behavior event
    Record {
        /// Acting subject, e.g. student:42 or org:7
        principal: String,
        target_id: i64,
        /// view, apply, favorite or dismiss
        kind: String,
        #[arg(long)]
        weight: Option<f64>,
    },
    /// Read or edit a feature profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Regenerate recommendations for one or more subjects
    Generate {
        #[arg(required = true)]
        principals: Vec<String>,
    },
    /// Page through visible recommendations
    List {
        principal: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
        /// Only recommendations in this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Change the status of a recommendation
    Status {
        principal: String,
        recommendation_id: i64,
        /// viewed, applied, contacted or dismissed
        status: String,
    },
    /// Behavior statistics of a subject
    Stats { principal: String },
    /// Behavior history of a subject, newest first
    History {
        principal: String,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Regenerate subjects whenever their inputs change (until Ctrl+C)
    Watch,
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    Show { principal: String },
    /// Apply a JSON merge-patch
    Set { principal: String, patch: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutcome {
    recommendation_id: i64,
    status: RecommendationStatus,
    changed: bool,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn resolve(services: &Services, principal: &str) -> anyhow::Result<Subject> {
    services
        .resolve_subject(principal)
        .await
        .with_context(|| format!("cannot resolve principal '{}'", principal))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("campus_recommender=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    config.validate()?;

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let pool_path = args.pool.unwrap_or_else(|| config.data_dir.join("pool.json"));
    let pool = Arc::new(FileCandidatePool::new(&pool_path));
    let organizations = match pool.load().await {
        Ok(snapshot) => StaticOrganizationDirectory::from_scopes(snapshot.organizations),
        Err(e) => {
            warn!(path = %pool_path.display(), error = %e, "No organization scopes loaded");
            StaticOrganizationDirectory::new()
        }
    };

    let db = Arc::new(RecommendDb::open(&config.database_path())?);
    let services = Services::builder(db.clone(), pool)
        .config(config.clone())
        .organizations(Arc::new(organizations))
        .users(Arc::new(PrincipalDirectory))
        .build();

    match args.command {
        Command::Record {
            principal,
            target_id,
            kind,
            weight,
        } => {
            let subject = resolve(&services, &principal).await?;
            let event = services.behavior.record_behavior(RecordBehaviorInput {
                actor_id: subject.subject_id,
                target_id,
                target_type: subject.subject_type.target_type(),
                behavior_type: kind,
                weight,
            })?;
            print_json(&event)?;
        }

        Command::Profile { action } => match action {
            ProfileAction::Show { principal } => {
                let subject = resolve(&services, &principal).await?;
                let profile = services.profiles.get_profile(subject.subject_id, subject.subject_type)?;
                print_json(&profile)?;
            }
            ProfileAction::Set { principal, patch } => {
                let subject = resolve(&services, &principal).await?;
                let patch: AttributePatch =
                    serde_json::from_str(&patch).context("profile patch must be a JSON object")?;
                let profile = services
                    .profiles
                    .update_profile(subject.subject_id, subject.subject_type, patch)?;
                print_json(&profile)?;
            }
        },

        Command::Generate { principals } => {
            let mut subjects = Vec::with_capacity(principals.len());
            for principal in &principals {
                subjects.push(resolve(&services, principal).await?);
            }

            let mut reports = Vec::with_capacity(subjects.len());
            let mut failures = 0;
            for (subject, result) in services.generator.generate_many(subjects).await {
                match result {
                    Ok(report) => reports.push(serde_json::to_value(report)?),
                    Err(e) => {
                        failures += 1;
                        reports.push(serde_json::json!({
                            "subject": subject.to_string(),
                            "error": e.to_string(),
                            "retryable": e.is_retryable(),
                        }));
                    }
                }
            }
            print_json(&reports)?;
            if failures > 0 {
                anyhow::bail!("{} of {} generation runs failed", failures, principals.len());
            }
        }

        Command::List {
            principal,
            page,
            size,
            status,
        } => {
            let subject = resolve(&services, &principal).await?;
            let result = match status {
                Some(status) => services.recommendations.list_by_status(
                    subject.subject_id,
                    subject.subject_type,
                    status.parse()?,
                    page,
                    size,
                )?,
                None => services.recommendations.list_recommendations(
                    subject.subject_id,
                    subject.subject_type,
                    page,
                    size,
                )?,
            };
            print_json(&result)?;
        }

        Command::Status {
            principal,
            recommendation_id,
            status,
        } => {
            let subject = resolve(&services, &principal).await?;
            let status: RecommendationStatus = status.parse()?;
            let changed = services.recommendations.set_recommendation_status(
                recommendation_id,
                subject.subject_id,
                subject.subject_type,
                status,
            )?;
            print_json(&StatusOutcome {
                recommendation_id,
                status,
                changed,
            })?;
        }

        Command::Stats { principal } => {
            let subject = resolve(&services, &principal).await?;
            let stats = services.behavior.get_behavior_statistics(subject.subject_id, subject.subject_type)?;
            print_json(&stats)?;
        }

        Command::History {
            principal,
            limit,
            offset,
        } => {
            let subject = resolve(&services, &principal).await?;
            let events = services.behavior.history(
                subject.subject_id,
                Some(subject.subject_type.target_type()),
                limit,
                offset,
            )?;
            print_json(&events)?;
        }

        Command::Watch => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let logger = spawn_logging_listener(services.events.clone());
            let scheduler = spawn_refresh_scheduler(services.refresh_scheduler(), shutdown_rx);

            info!(
                pool = %pool_path.display(),
                interval_secs = config.refresh_interval_secs,
                "Watching for behavior and profile changes"
            );

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");

            let _ = shutdown_tx.send(true);
            scheduler.await?;
            logger.abort();

            print_json(&db.stats()?)?;
        }
    }

    Ok(())
}
