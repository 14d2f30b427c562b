use crate::extract::db::Horizon;
use crate::extract::{DbExtractor, LogExtractor};
use crate::health::HealthAggregator;
use agent_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Drives the four independent cadences: log extraction, short- and
/// long-horizon database polling, and the health snapshot. Each tick runs
/// its job in its own task so an overrunning job never blocks a sibling
/// cadence, and every failure is absorbed at the job boundary.
pub struct Scheduler {
    logs: Arc<LogExtractor>,
    db: Arc<DbExtractor>,
    health: Arc<HealthAggregator>,
    log_every: Duration,
    short_every: Duration,
    long_every: Duration,
    health_every: Duration,
}

impl Scheduler {
    pub fn new(
        logs: Arc<LogExtractor>,
        db: Arc<DbExtractor>,
        health: Arc<HealthAggregator>,
        log_every: Duration,
        short_every: Duration,
        long_every: Duration,
        health_every: Duration,
    ) -> Self {
        Self {
            logs,
            db,
            health,
            log_every,
            short_every,
            long_every,
            health_every,
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            log_secs = self.log_every.as_secs(),
            short_secs = self.short_every.as_secs(),
            long_secs = self.long_every.as_secs(),
            health_secs = self.health_every.as_secs(),
            "Starting scheduler"
        );

        // Create shutdown channel
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        // Setup signal handler
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown signal received");
                    let _ = shutdown_tx.send(()).await;
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        });

        let mut log_tick = interval(self.log_every);
        let mut short_tick = interval(self.short_every);
        let mut long_tick = interval(self.long_every);
        let mut health_tick = interval(self.health_every);
        for tick in [&mut log_tick, &mut short_tick, &mut long_tick, &mut health_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down scheduler");
                    break;
                }

                _ = log_tick.tick() => {
                    let logs = Arc::clone(&self.logs);
                    tokio::spawn(async move {
                        if let Err(e) = logs.run_scheduled().await {
                            error!(job = "logs", error = %e, "Scheduled job failed");
                        }
                    });
                }

                _ = short_tick.tick() => {
                    let db = Arc::clone(&self.db);
                    tokio::spawn(async move {
                        if let Err(e) = db.run_scheduled(Horizon::Short).await {
                            error!(job = "db_short", error = %e, "Scheduled job failed");
                        }
                    });
                }

                _ = long_tick.tick() => {
                    let db = Arc::clone(&self.db);
                    tokio::spawn(async move {
                        if let Err(e) = db.run_scheduled(Horizon::Long).await {
                            error!(job = "db_long", error = %e, "Scheduled job failed");
                        }
                    });
                }

                _ = health_tick.tick() => {
                    let health = Arc::clone(&self.health);
                    tokio::spawn(async move {
                        if let Err(e) = health.snapshot(true).await {
                            error!(job = "health", error = %e, "Scheduled job failed");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}
