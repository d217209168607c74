//! Configuration file handling.
//!
//! Configuration lives in `notify-digest.toml`. Secrets never appear in the
//! file: each secret field names an environment variable that is resolved
//! once by [`Config::load`], which also validates the whole configuration so
//! malformed entries are rejected before the pipeline starts.

use crate::models::Channel;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "notify-digest.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General run settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Scheduler gate settings.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Sources to poll, in report order.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Summarization backend settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Delivery settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// General run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path of the SQLite state database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Path of the run lock file.
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// A lock older than this is considered abandoned.
    #[serde(default = "default_lock_stale_after")]
    pub lock_stale_after_seconds: u64,

    /// Only items newer than this many minutes are fetched.
    #[serde(default = "default_recency_window")]
    pub recency_window_minutes: u32,

    /// Maximum items taken from one source per run.
    #[serde(default = "default_max_items_per_source")]
    pub max_items_per_source: usize,

    /// Concurrent source fetches.
    #[serde(default = "default_parallelism")]
    pub max_parallel_sources: usize,

    /// Concurrent summarization calls.
    #[serde(default = "default_parallelism")]
    pub max_parallel_summaries: usize,

    /// Deadline for one source fetch.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,

    /// Deadline for the whole run.
    #[serde(default = "default_run_deadline")]
    pub run_deadline_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            lock_path: default_lock_path(),
            lock_stale_after_seconds: default_lock_stale_after(),
            recency_window_minutes: default_recency_window(),
            max_items_per_source: default_max_items_per_source(),
            max_parallel_sources: default_parallelism(),
            max_parallel_summaries: default_parallelism(),
            fetch_timeout_seconds: default_fetch_timeout(),
            run_deadline_seconds: default_run_deadline(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("notify_state.db")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("notify_state.lock")
}

fn default_lock_stale_after() -> u64 {
    3600
}

fn default_recency_window() -> u32 {
    15
}

fn default_max_items_per_source() -> usize {
    10
}

fn default_parallelism() -> usize {
    4
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_run_deadline() -> u64 {
    600
}

/// How the scheduler gate treats invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Every invocation runs; freshness comes from the recency window.
    #[default]
    FixedWindow,
    /// Invocations are skipped until a randomly drawn gap has elapsed.
    Jitter,
}

/// Scheduler gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub mode: ScheduleMode,

    #[serde(default = "default_min_gap")]
    pub min_gap_minutes: u32,

    #[serde(default = "default_max_gap")]
    pub max_gap_minutes: u32,

    /// Fixed RNG seed, for reproducible schedules.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::default(),
            min_gap_minutes: default_min_gap(),
            max_gap_minutes: default_max_gap(),
            seed: None,
        }
    }
}

fn default_min_gap() -> u32 {
    30
}

fn default_max_gap() -> u32 {
    120
}

/// Kind of source adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// IMAP mailbox, `imaps://host[:port]`.
    Mailbox,
    /// RSS or Atom feed.
    Rss,
}

/// One polled source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source name; the seen-set is keyed by it.
    pub name: String,

    pub kind: SourceKind,

    /// `imaps://` server URL or feed URL.
    pub url: String,

    /// Label the report groups under. Defaults to the source name.
    #[serde(default)]
    pub account_label: Option<String>,

    /// Mailbox folder.
    #[serde(default = "default_folder")]
    pub folder: String,

    /// Mailbox login.
    #[serde(default)]
    pub username: Option<String>,

    /// Environment variable holding the mailbox password or token.
    #[serde(default)]
    pub credential_env: Option<String>,

    /// Accept only senders containing one of these substrings.
    #[serde(default)]
    pub from_filters: Vec<String>,

    /// Accept only subjects containing one of these keywords.
    #[serde(default)]
    pub subject_keywords: Vec<String>,

    /// Resolved from `credential_env` at load time.
    #[serde(skip)]
    pub credential: Option<String>,
}

impl SourceConfig {
    pub fn label(&self) -> &str {
        self.account_label.as_deref().unwrap_or(&self.name)
    }
}

fn default_folder() -> String {
    "INBOX".to_string()
}

/// Wire dialect of the summarization backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI-compatible `/chat/completions`.
    #[default]
    OpenAi,
    /// Ollama `/api/chat`.
    Ollama,
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: Provider,

    /// Model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key. Not needed for Ollama.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens in one synopsis.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Retries after the first attempt, for transient failures.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base delay of the exponential backoff between retries.
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,

    /// Resolved from `api_key_env` at load time.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            name: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
            backoff_base_ms: default_backoff_ms(),
            api_key: None,
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    150
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

/// Delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_primary")]
    pub primary: Channel,

    #[serde(default)]
    pub secondary: Option<Channel>,

    /// Report length budget for SMS, in characters.
    #[serde(default = "default_sms_budget")]
    pub sms_budget_chars: usize,

    /// Report length budget for email, in characters.
    #[serde(default = "default_email_budget")]
    pub email_budget_chars: usize,

    #[serde(default)]
    pub sms: Option<SmsConfig>,

    #[serde(default)]
    pub email: Option<EmailConfig>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            secondary: None,
            sms_budget_chars: default_sms_budget(),
            email_budget_chars: default_email_budget(),
            sms: None,
            email: None,
        }
    }
}

impl DeliveryConfig {
    pub fn budget_for(&self, channel: Channel) -> usize {
        match channel {
            Channel::Sms => self.sms_budget_chars,
            Channel::Email => self.email_budget_chars,
        }
    }

    /// Configured channels in attempt order.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = vec![self.primary];
        if let Some(secondary) = self.secondary {
            if secondary != self.primary {
                channels.push(secondary);
            }
        }
        channels
    }
}

fn default_primary() -> Channel {
    Channel::Sms
}

fn default_sms_budget() -> usize {
    1600
}

fn default_email_budget() -> usize {
    20_000
}

/// Twilio SMS transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub account_sid: String,

    #[serde(default = "default_twilio_token_env")]
    pub auth_token_env: String,

    pub from_number: String,

    pub to_number: String,

    #[serde(default = "default_twilio_api")]
    pub api_base: String,

    #[serde(skip)]
    pub auth_token: Option<String>,
}

fn default_twilio_token_env() -> String {
    "TWILIO_AUTH_TOKEN".to_string()
}

fn default_twilio_api() -> String {
    "https://api.twilio.com".to_string()
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain connection upgraded with STARTTLS, usually port 587.
    #[default]
    StartTls,
    /// TLS from the first byte, usually port 465.
    Implicit,
}

/// SMTP email transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub tls: SmtpTls,

    /// SMTP login. Defaults to `from`.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default = "default_smtp_password_env")]
    pub password_env: String,

    pub from: String,

    pub to: String,

    #[serde(default = "default_subject")]
    pub subject: String,

    #[serde(skip)]
    pub password: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_password_env() -> String {
    "SMTP_PASSWORD".to_string()
}

fn default_subject() -> String {
    "Notification Summary".to_string()
}

impl Config {
    /// Load, apply CLI overrides, resolve secrets from the environment, and
    /// validate.
    pub fn load(path: &Path, args: &crate::cli::Args) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.merge_with_args(args);
        config.resolve_secrets(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the TOML file without resolving or validating.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Fill every secret field from its named environment variable.
    ///
    /// Secrets for channels that will not be used are left unresolved.
    pub fn resolve_secrets<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str, what: &str| -> Result<String> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => bail!("Environment variable {} ({}) is not set", key, what),
            }
        };

        for source in &mut self.sources {
            if let Some(ref key) = source.credential_env {
                source.credential = Some(require(key, &format!("credential for source '{}'", source.name))?);
            }
        }

        if self.model.provider == Provider::OpenAi {
            self.model.api_key = Some(require(&self.model.api_key_env, "summarization API key")?);
        }

        let channels = self.delivery.channels();
        if channels.contains(&Channel::Sms) {
            if let Some(ref mut sms) = self.delivery.sms {
                sms.auth_token = Some(require(&sms.auth_token_env, "Twilio auth token")?);
            }
        }
        if channels.contains(&Channel::Email) {
            if let Some(ref mut email) = self.delivery.email {
                email.password = Some(require(&email.password_env, "SMTP password")?);
            }
        }

        Ok(())
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("At least one [[sources]] entry is required");
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                bail!("Source names must not be empty");
            }
            if !names.insert(source.name.as_str()) {
                bail!("Duplicate source name '{}'", source.name);
            }
            match source.kind {
                SourceKind::Mailbox => {
                    if !source.url.starts_with("imaps://") {
                        bail!("Mailbox source '{}' URL must start with 'imaps://'", source.name);
                    }
                    if source.username.is_none() || source.credential_env.is_none() {
                        bail!(
                            "Mailbox source '{}' needs a username and credential_env",
                            source.name
                        );
                    }
                }
                SourceKind::Rss => {
                    if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
                        bail!(
                            "Source '{}' URL must start with 'http://' or 'https://'",
                            source.name
                        );
                    }
                }
            }
        }

        let general = &self.general;
        if general.max_items_per_source == 0 {
            bail!("max_items_per_source must be at least 1");
        }
        if general.max_parallel_sources == 0 || general.max_parallel_summaries == 0 {
            bail!("Parallelism limits must be at least 1");
        }
        if general.recency_window_minutes == 0 {
            bail!("recency_window_minutes must be at least 1");
        }
        if general.fetch_timeout_seconds == 0 || general.run_deadline_seconds == 0 {
            bail!("Timeouts must be at least 1 second");
        }

        if self.schedule.mode == ScheduleMode::Jitter
            && self.schedule.min_gap_minutes > self.schedule.max_gap_minutes
        {
            bail!(
                "min_gap_minutes ({}) must not exceed max_gap_minutes ({})",
                self.schedule.min_gap_minutes,
                self.schedule.max_gap_minutes
            );
        }

        if !(0.0..=2.0).contains(&self.model.temperature) {
            bail!("Temperature must be between 0.0 and 2.0");
        }
        if self.model.timeout_seconds == 0 {
            bail!("Model timeout must be at least 1 second");
        }
        if !self.model.base_url.starts_with("http://") && !self.model.base_url.starts_with("https://") {
            bail!("Model base_url must start with 'http://' or 'https://'");
        }

        let delivery = &self.delivery;
        if delivery.secondary == Some(delivery.primary) {
            bail!("Secondary channel must differ from the primary channel");
        }
        for channel in delivery.channels() {
            let configured = match channel {
                Channel::Sms => delivery.sms.is_some(),
                Channel::Email => delivery.email.is_some(),
            };
            if !configured {
                bail!("Channel {} is selected but [delivery.{}] is missing", channel, channel);
            }
            if delivery.budget_for(channel) == 0 {
                bail!("Length budget for {} must be at least 1", channel);
            }
        }

        Ok(())
    }

    /// Apply CLI overrides. CLI arguments take precedence over the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(method) = args.method {
            // Selecting the configured fallback swaps the two channels.
            if self.delivery.secondary == Some(method) {
                self.delivery.secondary = Some(self.delivery.primary);
            }
            self.delivery.primary = method;
        }
        if let Some(secondary) = args.secondary {
            self.delivery.secondary = Some(secondary);
        }
        if args.no_fallback {
            self.delivery.secondary = None;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let mut config = Config::default();
        config.sources.push(SourceConfig {
            name: "personal".to_string(),
            kind: SourceKind::Mailbox,
            url: "imaps://imap.example.com".to_string(),
            account_label: Some("me@example.com".to_string()),
            folder: default_folder(),
            username: Some("me@example.com".to_string()),
            credential_env: Some("MAILBOX_PASSWORD_PERSONAL".to_string()),
            from_filters: Vec::new(),
            subject_keywords: Vec::new(),
            credential: None,
        });
        config.delivery.sms = Some(SmsConfig {
            account_sid: "ACxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx".to_string(),
            auth_token_env: default_twilio_token_env(),
            from_number: "+15550000000".to_string(),
            to_number: "+15551111111".to_string(),
            api_base: default_twilio_api(),
            auth_token: None,
        });
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
recency_window_minutes = 20
max_items_per_source = 5

[schedule]
mode = "jitter"
min_gap_minutes = 30
max_gap_minutes = 120
seed = 42

[[sources]]
name = "work"
kind = "mailbox"
url = "imaps://imap.work.example"
account_label = "me@work.example"
username = "me@work.example"
credential_env = "WORK_PASSWORD"
from_filters = ["@linkedin.com"]

[[sources]]
name = "blog"
kind = "rss"
url = "https://blog.example.com/feed.xml"

[model]
name = "gpt-4o-mini"

[delivery]
primary = "sms"
secondary = "email"

[delivery.sms]
account_sid = "AC123"
from_number = "+15550000000"
to_number = "+15551111111"

[delivery.email]
smtp_host = "smtp.example.com"
from = "digest@example.com"
to = "me@example.com"
"#;

    fn env(key: &str) -> Option<String> {
        match key {
            "WORK_PASSWORD" => Some("hunter2 ".to_string()),
            "LLM_API_KEY" => Some("sk-test".to_string()),
            "TWILIO_AUTH_TOKEN" => Some("tw-token".to_string()),
            "SMTP_PASSWORD" => Some("smtp-pass".to_string()),
            _ => None,
        }
    }

    fn sample() -> Config {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.recency_window_minutes, 15);
        assert_eq!(config.general.max_items_per_source, 10);
        assert_eq!(config.schedule.mode, ScheduleMode::FixedWindow);
        assert_eq!(config.model.retries, 2);
        assert_eq!(config.delivery.primary, Channel::Sms);
    }

    #[test]
    fn test_parse_and_resolve() {
        let mut config = sample();
        config.resolve_secrets(env).unwrap();
        config.validate().unwrap();

        assert_eq!(config.schedule.mode, ScheduleMode::Jitter);
        assert_eq!(config.schedule.seed, Some(42));
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].credential.as_deref(), Some("hunter2"));
        assert_eq!(config.sources[0].label(), "me@work.example");
        assert_eq!(config.sources[1].label(), "blog");
        assert_eq!(config.sources[1].kind, SourceKind::Rss);
        assert_eq!(config.model.api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            config.delivery.channels(),
            vec![Channel::Sms, Channel::Email]
        );

        let email = config.delivery.email.as_ref().unwrap();
        assert_eq!(email.smtp_port, 587);
        assert_eq!(email.tls, SmtpTls::StartTls);
        assert_eq!(email.password.as_deref(), Some("smtp-pass"));
    }

    #[test]
    fn test_mailbox_needs_imaps_url() {
        let mut config = sample();
        config.sources[0].url = "https://imap.work.example".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("imaps://"));
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let mut config = sample();
        let err = config
            .resolve_secrets(|key| if key == "WORK_PASSWORD" { None } else { env(key) })
            .unwrap_err();
        assert!(err.to_string().contains("WORK_PASSWORD"));
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let mut config = sample();
        config.sources[1].name = "work".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_gaps_rejected() {
        let mut config = sample();
        config.schedule.min_gap_minutes = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_without_transport_rejected() {
        let mut config = sample();
        config.delivery.email = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[delivery.email]"));
    }

    #[test]
    fn test_no_sources_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[[sources]]"));
        assert!(toml_str.contains("[delivery.sms]"));

        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.sources[0].name, "personal");
    }

    #[test]
    fn test_cli_overrides_channels() {
        let mut args = crate::cli::tests::make_args();
        args.method = Some(Channel::Email);

        let mut config = sample();
        config.merge_with_args(&args);
        assert_eq!(
            config.delivery.channels(),
            vec![Channel::Email, Channel::Sms]
        );

        let mut config = sample();
        config.delivery.secondary = None;
        config.merge_with_args(&args);
        assert_eq!(config.delivery.channels(), vec![Channel::Email]);

        args.method = None;
        args.no_fallback = true;
        let mut config = sample();
        config.merge_with_args(&args);
        assert_eq!(config.delivery.channels(), vec![Channel::Sms]);
    }
}
