//! notify-digest - scheduled inbox and feed digests
//!
//! Fetches new items from mailboxes and feeds, summarizes each with an LLM,
//! and delivers a single composite report by SMS or email. Items are
//! remembered only after a report containing them was delivered.
//!
//! Exit codes:
//!   0 - Report delivered, nothing new, skipped by the scheduler, or another
//!       run holds the lock
//!   1 - Configuration error, state store failure, every channel failed, or
//!       the run deadline passed before anything was summarized

mod cli;
mod config;
mod dedup;
mod error;
mod models;
mod notify;
mod pipeline;
mod report;
mod scheduler;
mod sources;
mod state;
mod summarizer;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::Args;
use config::Config;
use pipeline::{Pipeline, RunOptions, RunOutcome};
use state::RunLock;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Secrets usually live in .env next to the config
    dotenvy::dotenv().ok();

    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.init_config {
        return handle_init_config(&args);
    }

    init_logging(&args);

    info!("notify-digest v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: write a default config file.
fn handle_init_config(args: &Args) -> Result<()> {
    let path = args.config_path();

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(&path, Config::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✅ Created {} with default settings.", path.display());
    println!("   Add your sources, then export the secrets named by the *_env keys.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// One invocation. Returns the process exit code.
async fn run(args: Args) -> Result<i32> {
    let config_path = args.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load(&config_path, &args)?;

    if let Some(ref source) = args.reset_source {
        if !config.sources.iter().any(|s| &s.name == source) {
            anyhow::bail!("--reset-source names unknown source '{}'", source);
        }
    }

    let lock = RunLock::try_acquire(
        &config.general.lock_path,
        Duration::from_secs(config.general.lock_stale_after_seconds),
    )
    .with_context(|| {
        format!(
            "Failed to create lock file {}",
            config.general.lock_path.display()
        )
    })?;

    let Some(lock) = lock else {
        info!(
            "Another run holds {}; skipping",
            config.general.lock_path.display()
        );
        return Ok(0);
    };
    debug!("Holding run lock {}", lock.path().display());

    let mut pipeline = Pipeline::from_config(&config)?;
    let options = RunOptions {
        reset_source: args.reset_source,
        dry_run: args.dry_run,
    };

    let outcome = pipeline.run(Utc::now(), &options).await?;
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Skipped {
            elapsed_minutes,
            target_gap_minutes,
        } => {
            println!(
                "⏭️  Skipped: {}m since last run, waiting for {}m",
                elapsed_minutes, target_gap_minutes
            );
        }
        RunOutcome::NothingNew { failed_sources } => {
            println!("✅ Nothing new.");
            if *failed_sources > 0 {
                println!("   {} source(s) could not be fetched.", failed_sources);
            }
        }
        RunOutcome::Abandoned { pending } => {
            eprintln!(
                "\n❌ Run deadline reached before any summary; {} item(s) left for the next run.",
                pending
            );
        }
        RunOutcome::Committed {
            channel,
            delivered,
            deferred,
        } => {
            println!("✅ Delivered {} item(s) via {}.", delivered, channel);
            if *deferred > 0 {
                println!("   {} item(s) left for the next run.", deferred);
            }
        }
        RunOutcome::DryRun { items } => {
            println!("\n🔍 Dry run: {} unseen item(s)\n", items.len());
            for item in items {
                println!(
                    "   [{}] {} {}: {}",
                    item.account_label,
                    item.occurred_at.format("%Y-%m-%d %H:%M"),
                    item.sender_display(),
                    item.subject
                );
            }
            println!("\n✅ Dry run complete. Nothing was summarized, sent or stored.");
        }
    }
}
