use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use ttsync_db::{PgStore, SyncStore};
use ttsync_etl::EtlConfig;

#[derive(Debug, Parser)]
#[command(name = "ttsync-cli")]
#[command(about = "Terminal transaction sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass from the object store into Postgres.
    Run {
        /// Also save the first parsed file, untransformed, to the samples
        /// directory for inspection.
        #[arg(long)]
        sample: bool,
    },
    /// Ensure destination tables and indexes exist, then exit.
    Migrate,
    /// Show the most recent sync runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { sample: false }) {
        Commands::Run { sample } => {
            let summary = ttsync_etl::run_etl_once_from_env(sample).await?;
            println!(
                "sync complete: run_id={} processed={}/{} rows={} failures={}",
                summary.run_id,
                summary.files_processed,
                summary.files_listed,
                summary.rows_loaded,
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("  skipped {}: {}", failure.key, failure.reason);
            }
        }
        Commands::Migrate => {
            let config = EtlConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.ensure_schema().await?;
            println!("destination schema ensured");
        }
        Commands::Runs { limit } => {
            let config = EtlConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            for run in store.recent_runs(limit).await? {
                println!(
                    "{}  {}  files={}  synced_through={}",
                    run.created_at,
                    run.status.as_str(),
                    run.files_processed,
                    run.last_sync_time
                );
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
