//! CLI command implementations.

pub mod jobs;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use memoflow_config::{WorkerConfig, load_worker_config};
use memoflow_db::{PgJobStore, PgKnowledgeStore, create_pool, run_migrations};
use memoflow_providers::{FsPayloadStorage, HttpAnalysisProvider, HttpTranscriptionProvider};
use memoflow_scheduler::{BatchScheduler, Collaborators, build_scheduler};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "memoflow.kdl";

/// Configuration plus a database connection, shared by every command.
pub struct Env {
    pub config: WorkerConfig,
    pub pool: PgPool,
    pub store: Arc<PgJobStore>,
}

impl Env {
    pub async fn load(config_path: Option<&Path>, database_url: Option<String>) -> Result<Self> {
        let config = load_config(config_path)?;
        let url = database_url
            .or_else(|| config.database.url.clone())
            .context("No database URL: set DATABASE_URL or `database url=...` in the config")?;

        info!("Connecting to database...");
        let pool = create_pool(&url, config.database.max_connections)
            .await
            .context("Failed to connect to database")?;
        info!("Database connected");

        let store = Arc::new(PgJobStore::new(pool.clone()));
        Ok(Self {
            config,
            pool,
            store,
        })
    }

    pub fn collaborators(&self) -> Result<Collaborators> {
        let providers = &self.config.providers;
        let transcription = providers
            .transcription
            .as_ref()
            .context("providers.transcription is not configured")?;
        let analysis = providers
            .analysis
            .as_ref()
            .context("providers.analysis is not configured")?;

        Ok(Collaborators {
            storage: Arc::new(FsPayloadStorage::new(self.config.storage.root.clone())),
            transcriber: Arc::new(
                HttpTranscriptionProvider::from_settings(transcription, providers)
                    .context("Invalid transcription provider")?,
            ),
            analyzer: Arc::new(
                HttpAnalysisProvider::from_settings(analysis, providers)
                    .context("Invalid analysis provider")?,
            ),
            knowledge: Arc::new(PgKnowledgeStore::new(self.pool.clone())),
        })
    }

    pub fn scheduler(&self) -> Result<Arc<BatchScheduler>> {
        Ok(build_scheduler(
            &self.config,
            self.store.clone(),
            self.collaborators()?,
        ))
    }
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    match path {
        Some(path) => load_worker_config(path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_worker_config(&default)
                    .with_context(|| format!("Failed to load config file: {}", DEFAULT_CONFIG_PATH))
            } else {
                warn!("No {} found, using default configuration", DEFAULT_CONFIG_PATH);
                Ok(WorkerConfig::default())
            }
        }
    }
}

pub(crate) fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn migrate(env: &Env) -> Result<()> {
    run_migrations(&env.pool)
        .await
        .context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    let config = load_worker_config(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    println!("Configuration is valid");
    println!(
        "  lock ttl: {}s (grace {}s)",
        config.lock.ttl.as_secs(),
        config.lock.grace.as_secs()
    );
    println!(
        "  batch size: {}, max job attempts: {}",
        config.scheduler.batch_size, config.scheduler.max_job_attempts
    );
    for stage in ["transcription", "analysis"] {
        let retry = config.retry_for(stage);
        println!(
            "  {} retries: {} attempts, base {}ms",
            stage,
            retry.max_attempts,
            retry.base_delay.as_millis()
        );
    }
    Ok(())
}
