//! Command-line interface argument parsing.

use crate::models::Channel;
use clap::Parser;
use std::path::PathBuf;

/// notify-digest - scheduled inbox and feed digests
///
/// Polls the configured mailboxes and feeds, summarizes anything new with an
/// LLM and delivers one compact report by SMS or email. Meant to be invoked
/// by cron or a systemd timer.
///
/// Examples:
///   notify-digest
///   notify-digest --method email
///   notify-digest --reset-source personal
///   notify-digest --dry-run --verbose
///   notify-digest --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Primary delivery channel (sms, email)
    ///
    /// Overrides `delivery.primary` from the config file. Naming the
    /// configured secondary swaps the two.
    #[arg(short, long, value_name = "CHANNEL", env = "NOTIFY_METHOD")]
    pub method: Option<Channel>,

    /// Channel to try when the primary fails
    #[arg(long, value_name = "CHANNEL", conflicts_with = "no_fallback")]
    pub secondary: Option<Channel>,

    /// Do not fall back to a secondary channel
    #[arg(long)]
    pub no_fallback: bool,

    /// Forget seen items for one source before running
    #[arg(long, value_name = "SOURCE")]
    pub reset_source: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for notify-digest.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "NOTIFY_DIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: fetch and dedup, print what would be summarized, change nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default notify-digest.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Config file to load.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(crate::config::DEFAULT_CONFIG_FILE))
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let (Some(method), Some(secondary)) = (self.method, self.secondary) {
            if method == secondary {
                return Err(format!(
                    "--secondary must differ from the primary channel ({})",
                    method
                ));
            }
        }

        if let Some(ref source) = self.reset_source {
            if source.trim().is_empty() {
                return Err("--reset-source needs a source name".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
