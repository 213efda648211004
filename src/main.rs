use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{BackendKind, TollgateConfig};
use tollgate::ratelimit::{MemoryStorage, RedisStorage, Storage};

/// Inspect and drive token bucket rate limits.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file; `TOLLGATE__*` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take tokens for a key
    Take {
        key: String,
        /// Number of consecutive takes
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Show the limit and remaining tokens of a key
    Get { key: String },
    /// Replace the bucket of a key
    Set {
        key: String,
        tokens: u64,
        interval_ms: u64,
    },
    /// Add tokens to the bucket of a key
    Burst { key: String, tokens: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = TollgateConfig::load(cli.config.as_deref())?;
    info!(backend = ?config.backend, "Configuration loaded");

    let storage: Arc<dyn Storage> = match config.backend {
        BackendKind::Memory => Arc::new(MemoryStorage::new(&config.limits, &config.memory)),
        BackendKind::Redis => Arc::new(RedisStorage::new(&config.limits, &config.redis)?),
    };

    let outcome = run(storage.as_ref(), cli.command).await;
    storage.close().await?;
    outcome
}

async fn run(storage: &dyn Storage, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Take { key, count } => {
            for _ in 0..count {
                let result = storage.take(&key).await?;
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Command::Get { key } => {
            let quota = storage.get(&key).await?;
            println!("{}", serde_json::to_string(&quota)?);
        }
        Command::Set {
            key,
            tokens,
            interval_ms,
        } => {
            storage
                .set(&key, tokens, Duration::from_millis(interval_ms))
                .await?;
        }
        Command::Burst { key, tokens } => {
            storage.burst(&key, tokens).await?;
        }
    }
    Ok(())
}

/// Log to stderr so command output on stdout stays machine readable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
