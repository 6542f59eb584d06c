use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aegis_ratelimit::config::{BackendKind, StorageConfig, DEFAULT_LIMIT_NAME};
use aegis_ratelimit::{AegisConfig, BucketStore};

/// Inspect and maintain rate limit state.
#[derive(Debug, Parser)]
#[command(name = "aegis-ratelimit", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Try to consume tokens for a key; exits 1 if denied
    Attempt {
        key: String,
        /// Named limit from the configuration
        #[arg(short, long, default_value = DEFAULT_LIMIT_NAME)]
        limit: String,
        /// Tokens to consume
        #[arg(short, long, default_value_t = 1)]
        tokens: u32,
    },
    /// Show the tokens remaining for a key
    Remaining {
        key: String,
        #[arg(short, long, default_value = DEFAULT_LIMIT_NAME)]
        limit: String,
    },
    /// Show seconds until the next refill for a key
    ResetAt {
        key: String,
        #[arg(short, long, default_value = DEFAULT_LIMIT_NAME)]
        limit: String,
    },
    /// Forget the state for a key
    Reset {
        key: String,
        #[arg(short, long, default_value = DEFAULT_LIMIT_NAME)]
        limit: String,
    },
    /// Remove expired entries from the store
    Gc,
    /// Remove every entry from the store
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Open the configured store. State must outlive the process, so only the
/// file backend is usable here.
fn open_store(storage: &StorageConfig) -> anyhow::Result<Arc<dyn BucketStore>> {
    if storage.backend == BackendKind::Memory {
        bail!("The memory backend keeps no state between invocations; use the file backend");
    }
    storage
        .build_store()
        .context("Failed to open rate limit store")
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    let config = AegisConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let store = open_store(&config.storage)?;

    match cli.command {
        Command::Attempt { key, limit, tokens } => {
            let limiter = config.limiter(&limit, store)?;
            if limiter.attempt(&key, tokens)? {
                println!("allowed");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("denied");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Remaining { key, limit } => {
            let limiter = config.limiter(&limit, store)?;
            println!("{}", limiter.remaining(&key)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::ResetAt { key, limit } => {
            let limiter = config.limiter(&limit, store)?;
            println!("{}", limiter.reset_at(&key)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset { key, limit } => {
            let limiter = config.limiter(&limit, store)?;
            limiter.reset(&key)?;
            info!(key = %key, limit = %limit, "Reset rate limit");
            Ok(ExitCode::SUCCESS)
        }
        Command::Gc => {
            let removed = store.gc()?;
            println!("{}", removed);
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear the store without --yes");
            }
            store.clear()?;
            info!("Cleared rate limit store");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_store_rejects_memory_backend() {
        let storage = StorageConfig {
            backend: BackendKind::Memory,
            ..StorageConfig::default()
        };

        let err = open_store(&storage).err().unwrap();
        assert!(err.to_string().contains("memory backend"));
    }

    #[test]
    fn test_open_store_opens_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            directory: dir.path().join("state"),
            ..StorageConfig::default()
        };

        let store = open_store(&storage).unwrap();
        assert_eq!(store.gc().unwrap(), 0);
        assert!(dir.path().join("state").is_dir());
    }

    #[test]
    fn test_parse_log_format() {
        let cli = Cli::try_parse_from(["aegis-ratelimit", "--log-format", "json", "gc"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);

        let cli = Cli::try_parse_from(["aegis-ratelimit", "gc"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
    }
}
