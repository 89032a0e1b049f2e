//! # vulnsync CLI
//!
//! ## Usage
//!
//! ```bash
//! vulnsync --config ./config/vulnsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vulnsync init` | Create the SQLite database and run schema migrations |
//! | `vulnsync update [feed]` | Run one update attempt per configured feed |
//! | `vulnsync run` | Run scheduled updates for every feed until Ctrl-C |
//! | `vulnsync history <updater>` | List update operations, newest first |
//! | `vulnsync match <records.json>` | Correlate installed packages with stored vulnerabilities |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use vulnsync::config::{self, Config};
use vulnsync::controller::{Controller, ControllerOpts, UpdateOutcome};
use vulnsync::locker::SqliteLocker;
use vulnsync::sqlite_store::SqliteVulnStore;
use vulnsync::{db, feed, migrate};
use vulnsync_core::models::IndexRecord;
use vulnsync_core::updater::Updater;
use vulnsync_core::{MatchEngine, MatcherRegistry, VulnerabilityStore};

/// vulnsync: scheduled vulnerability feed ingestion and package matching.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "vulnsync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vulnsync.toml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run one update attempt for each configured feed, or for one feed.
    Update {
        /// Feed name as configured under `[feeds.<name>]`.
        feed: Option<String>,
    },

    /// Run the scheduled update loop for every feed until interrupted.
    Run,

    /// Show update operations recorded for an updater, newest first.
    History {
        updater: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Correlate a JSON array of index records against the store.
    Match {
        records: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Update { feed } => run_update(&cfg, feed.as_deref()).await?,
        Commands::Run => run_scheduled(&cfg).await?,
        Commands::History { updater, limit } => run_history(&cfg, &updater, limit).await?,
        Commands::Match { records } => run_match(&cfg, &records).await?,
    }

    Ok(())
}

fn setup_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("vulnsync=debug,vulnsync_core=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(cfg: &Config) -> Result<SqliteVulnStore> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(SqliteVulnStore::new(pool))
}

fn controllers(
    cfg: &Config,
    store: &Arc<SqliteVulnStore>,
    only: Option<&str>,
) -> Result<Vec<Arc<Controller>>> {
    let updaters = feed::updater_set(cfg)?;
    if let Some(name) = only {
        if updaters.get(name).is_none() {
            bail!(
                "Unknown feed: '{}'. Configured: {}",
                name,
                updaters.names().join(", ")
            );
        }
    }

    let locker = Arc::new(SqliteLocker::new(store.pool().clone(), cfg.updater.lock_ttl()));
    let mut out = Vec::new();
    for updater in updaters.updaters() {
        if only.is_some_and(|name| name != updater.name()) {
            continue;
        }
        out.push(Arc::new(Controller::new(ControllerOpts {
            name: updater.name().to_string(),
            updater: updater.clone(),
            store: store.clone(),
            locker: locker.clone(),
            interval: cfg.updater.interval(),
            update_on_start: cfg.updater.update_on_start,
        })));
    }
    Ok(out)
}

async fn run_update(cfg: &Config, only: Option<&str>) -> Result<()> {
    let store = Arc::new(open_store(cfg).await?);
    let controllers = controllers(cfg, &store, only)?;
    if controllers.is_empty() {
        println!("No feeds configured.");
        return Ok(());
    }

    let mut failed = 0usize;
    for controller in &controllers {
        match controller.update().await {
            Ok(UpdateOutcome::Updated {
                operation_id,
                count,
            }) => println!(
                "{}: stored {} vulnerabilities (operation {})",
                controller.name(),
                count,
                operation_id
            ),
            Ok(UpdateOutcome::Unchanged) => println!("{}: unchanged", controller.name()),
            Ok(UpdateOutcome::Locked) => {
                println!("{}: skipped, update in progress elsewhere", controller.name())
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", controller.name(), e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} feeds failed to update", failed, controllers.len());
    }
    Ok(())
}

async fn run_scheduled(cfg: &Config) -> Result<()> {
    let store = Arc::new(open_store(cfg).await?);
    let controllers = controllers(cfg, &store, None)?;
    if controllers.is_empty() {
        bail!("No feeds configured.");
    }

    let cancel = CancellationToken::new();
    let mut handles = Vec::with_capacity(controllers.len());
    for controller in controllers {
        handles.push(controller.start(cancel.child_token())?);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down; waiting for in-flight updates");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "controller task failed");
        }
    }
    Ok(())
}

async fn run_history(cfg: &Config, updater: &str, limit: usize) -> Result<()> {
    let store = open_store(cfg).await?;
    let operations = store
        .get_update_operations(&[updater.to_string()])
        .await?
        .remove(updater)
        .unwrap_or_default();

    if operations.is_empty() {
        println!("No update operations recorded for '{}'.", updater);
        return Ok(());
    }

    let current = store.vulnerability_count(updater).await?;
    println!(
        "{}: {} operations, {} vulnerabilities in current generation",
        updater,
        operations.len(),
        current
    );
    println!();
    println!("{:<38} {:<22} FINGERPRINT", "OPERATION", "DATE");
    for op in operations.iter().take(limit) {
        println!(
            "{:<38} {:<22} {}",
            op.id,
            op.date.format("%Y-%m-%d %H:%M:%S"),
            op.fingerprint
        );
    }
    Ok(())
}

async fn run_match(cfg: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read records file: {}", path.display()))?;
    let records: Vec<IndexRecord> =
        serde_json::from_str(&content).with_context(|| "Failed to parse records file")?;

    let registry = MatcherRegistry::from_names(&cfg.matchers.enabled)?;
    let store: Arc<dyn VulnerabilityStore> = Arc::new(open_store(cfg).await?);
    let engine = MatchEngine::new(store, Arc::new(registry));

    let results = engine.match_records(&records).await?;
    let output: BTreeMap<String, Vec<String>> = results
        .into_iter()
        .map(|(id, vulns)| (id, vulns.into_iter().map(|v| v.name).collect()))
        .collect();
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
