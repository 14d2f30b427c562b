mod app;
mod checkpoint;
mod extract;
mod filter;
mod forward;
mod health;
mod model;
mod scheduler;

use agent_core::{telemetry, Config};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "agent")]
#[clap(about = "Checkpointed telemetry forwarding agent", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all scheduled extraction cadences
    Run,

    /// Execute one SQL query and print the rows
    Query {
        /// Literal SQL to execute
        sql: String,

        /// Also forward the result batch to the sink
        #[clap(long)]
        forward: bool,
    },

    /// Scan one log file by keyword and forward the matches
    ExtractLog {
        /// Path of the file to scan
        #[clap(long)]
        path: String,

        /// Keywords a record must contain (comma separated)
        #[clap(long, value_delimiter = ',', required = true)]
        search: Vec<String>,

        /// Keywords that veto a record (comma separated)
        #[clap(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },

    /// Probe the configured endpoints and print the merged report
    Health {
        /// Also forward the wrapped report to the sink
        #[clap(long)]
        forward: bool,
    },

    /// Rewind one domain's checkpoint to its default epoch
    ResetCheckpoint {
        /// Extraction domain
        #[clap(value_parser = ["log", "db"])]
        domain: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Initialize telemetry
    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();

    // Create database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(
            config.database.connect_timeout_secs,
        ))
        .idle_timeout(std::time::Duration::from_secs(
            config.database.idle_timeout_secs,
        ))
        .connect_lazy(&config.database.url)?;

    let app = app::App::new(config, pool)?;

    match cli.command {
        Commands::Run => {
            info!("Starting scheduled extraction");
            app.run_scheduler().await?;
        }

        Commands::Query { sql, forward } => {
            let rows = app.query(&sql, forward).await?;
            for row in &rows {
                println!("{row}");
            }
            info!(rows = rows.len(), "Query complete");
        }

        Commands::ExtractLog {
            path,
            search,
            exclude,
        } => {
            let forwarded = app.extract_log(&path, &search, &exclude).await?;
            info!(path = %path, forwarded, "Extraction complete");
        }

        Commands::Health { forward } => {
            let report = app.health_snapshot(forward).await?;
            println!("{report}");
        }

        Commands::ResetCheckpoint { domain } => {
            let domain = match domain.as_str() {
                "db" => model::Domain::Db,
                _ => model::Domain::Log,
            };
            app.reset_checkpoint(domain).await?;
            info!(domain = %domain, "Checkpoint reset");
        }
    }

    telemetry::shutdown();
    Ok(())
}
