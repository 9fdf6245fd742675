//! memoflow worker and operator CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use memoflow_core::{JobId, OwnerId};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "memoflow")]
#[command(about = "Exactly-once processing of recorded audio", long_about = None)]
struct Cli {
    /// Worker configuration file
    #[arg(long, env = "MEMOFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding the configuration file
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker loop until interrupted
    Worker {
        /// Worker identifier used in logs
        #[arg(long)]
        id: Option<String>,
    },
    /// Process a single job
    Process {
        /// Job ID
        job_id: JobId,
        /// Only process the job if it belongs to this owner
        #[arg(long)]
        owner: Option<OwnerId>,
        /// Re-run a completed job
        #[arg(long)]
        force: bool,
    },
    /// Process one batch of eligible jobs
    Batch {
        /// Maximum number of jobs (defaults to the configured batch size)
        #[arg(long)]
        size: Option<usize>,
    },
    /// Queue a recording for processing
    Enqueue {
        /// Owner ID
        owner: OwnerId,
        /// Payload reference, relative to the storage root
        payload: String,
        /// Scheduling priority, higher first
        #[arg(long, default_value = "0")]
        priority: i32,
        /// Expected recording length in seconds
        #[arg(long)]
        duration: Option<i32>,
    },
    /// Clear abandoned job locks
    Cleanup,
    /// Show circuit breaker state, success rate and stuck jobs
    Health,
    /// Apply database migrations
    Migrate,
    /// Validate a worker configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "memoflow.kdl")]
        path: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli {
        config,
        database_url,
        log_format,
        command,
    } = Cli::parse();
    init_tracing(log_format);

    let connect = || commands::Env::load(config.as_deref(), database_url.clone());

    match command {
        Commands::Worker { id } => {
            commands::worker::run(&connect().await?, id).await?;
        }
        Commands::Process {
            job_id,
            owner,
            force,
        } => {
            commands::jobs::process(&connect().await?, job_id, owner, force).await?;
        }
        Commands::Batch { size } => {
            commands::jobs::batch(&connect().await?, size).await?;
        }
        Commands::Enqueue {
            owner,
            payload,
            priority,
            duration,
        } => {
            commands::jobs::enqueue(&connect().await?, owner, payload, priority, duration).await?;
        }
        Commands::Cleanup => {
            commands::jobs::cleanup(&connect().await?).await?;
        }
        Commands::Health => {
            commands::jobs::health(&connect().await?).await?;
        }
        Commands::Migrate => {
            commands::migrate(&connect().await?).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
