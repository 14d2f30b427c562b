use crate::checkpoint::CheckpointStore;
use crate::extract::{DbExtractor, LogExtractor};
use crate::forward::{Envelope, FileSink, Forwarder};
use crate::health::HealthAggregator;
use crate::model::Domain;
use crate::scheduler::Scheduler;
use agent_core::{Config, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub struct App {
    config: Config,
    checkpoints: Arc<CheckpointStore>,
    logs: Arc<LogExtractor>,
    db: Arc<DbExtractor>,
    health: Arc<HealthAggregator>,
}

impl App {
    #[instrument(skip(config, pool))]
    pub fn new(config: Config, pool: PgPool) -> Result<Self> {
        info!("Initializing application");

        let checkpoints = Arc::new(CheckpointStore::new(&config.checkpoint)?);
        let sink: Arc<dyn Forwarder> = Arc::new(FileSink::new(&config.agent));
        let envelope = Envelope::new(&config.agent);

        let logs = Arc::new(LogExtractor::new(
            config.logs.sources.clone(),
            Arc::clone(&checkpoints),
            Arc::clone(&sink),
            envelope.clone(),
        ));

        let db = Arc::new(DbExtractor::new(
            pool,
            config.database.max_rows,
            config.database.short_horizon.clone(),
            config.database.long_horizon.clone(),
            Arc::clone(&checkpoints),
            Arc::clone(&sink),
            envelope.clone(),
        ));

        let health = Arc::new(HealthAggregator::new(
            &config.health,
            &config.agent,
            Arc::clone(&sink),
            envelope,
        )?);

        Ok(Self {
            config,
            checkpoints,
            logs,
            db,
            health,
        })
    }

    /// Runs all scheduled cadences until shutdown.
    pub async fn run_scheduler(&self) -> Result<()> {
        let scheduler = Scheduler::new(
            Arc::clone(&self.logs),
            Arc::clone(&self.db),
            Arc::clone(&self.health),
            Duration::from_secs(self.config.logs.interval_secs),
            Duration::from_secs(self.config.database.short_horizon.interval_secs),
            Duration::from_secs(self.config.database.long_horizon.interval_secs),
            Duration::from_secs(self.config.health.interval_secs),
        );
        scheduler.run().await
    }

    /// On-demand literal query.
    pub async fn query(&self, sql: &str, forward: bool) -> Result<Vec<String>> {
        self.db.run_query(sql, forward).await
    }

    /// On-demand keyword extraction of one explicit file.
    pub async fn extract_log(
        &self,
        path: &str,
        search: &[String],
        exclude: &[String],
    ) -> Result<usize> {
        self.logs.run_once(path, search, exclude).await
    }

    /// On-demand health snapshot, optionally forwarded.
    pub async fn health_snapshot(&self, forward: bool) -> Result<String> {
        self.health.snapshot(forward).await
    }

    /// Rewinds one domain's checkpoint to its default epoch.
    pub async fn reset_checkpoint(&self, domain: Domain) -> Result<()> {
        self.checkpoints.reset(domain).await
    }
}
