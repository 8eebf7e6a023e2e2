use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use codex_backup::application::*;
use codex_backup::backup::StoreKind;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "codex-backup")]
#[command(about = "Backup and disaster recovery orchestration for Codex data stores")]
#[command(version)]
struct Cli {
    /// TOML configuration file; CODEX_BACKUP__* variables override it
    #[arg(long, global = true, env = "CODEX_BACKUP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a full backup of every enabled store
    Full,
    /// Create an incremental backup on top of the latest full backup
    Incremental,
    /// Restore from a backup (its whole chain for an incremental)
    Restore {
        backup_id: String,
        /// Restrict to these stores (repeatable)
        #[arg(long = "store")]
        stores: Vec<StoreKind>,
    },
    /// Recover to the newest recovery point at or before an RFC 3339 instant
    Pitr { target: DateTime<Utc> },
    /// Verify checksums and sandbox-restore a backup
    Verify { backup_id: String },
    /// List catalogued backups
    List {
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Show catalog statistics
    Stats {
        /// Print Prometheus metrics instead
        #[arg(long)]
        metrics: bool,
    },
    /// Remove backups past their retention date
    Purge,
    /// Run the backup system health check
    Health,
    /// Run the scheduler and health monitor until interrupted
    Run,
    /// Print a sample configuration
    InitConfig {
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("CODEX_BACKUP_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr so command output on stdout stays parseable
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    if let Commands::InitConfig { output } = &cli.command {
        return write_sample_config(output.as_deref());
    }

    // Initialize application
    let app = Application::new(cli.config.as_deref()).await?;
    app.initialize().await?;

    // Route commands to appropriate handlers
    let backups = BackupCommandHandler::new(app.container.clone());
    match cli.command {
        Commands::Full => backups.full_backup().await,
        Commands::Incremental => backups.incremental_backup().await,
        Commands::Restore { backup_id, stores } => backups.restore(&backup_id, &stores).await,
        Commands::Pitr { target } => backups.point_in_time_recovery(target).await,
        Commands::Verify { backup_id } => backups.verify(&backup_id).await,
        Commands::List { since } => backups.list_backups(since).await,
        Commands::Stats { metrics } => backups.statistics(metrics).await,
        Commands::Purge => backups.purge().await,
        Commands::Health => {
            let handler = HealthCommandHandler::new(app.container.clone());
            handler.run_health_check().await
        }
        Commands::Run => {
            let handler = ServiceCommandHandler::new(app.lifecycle.clone());
            handler.run().await
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}
