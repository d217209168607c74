//! Per-item synopses from the text-generation backend.
//!
//! Every call is bounded by a timeout and retried with exponential backoff on
//! transient errors. When the backend never answers usefully the item falls
//! back to a raw excerpt, so summarization never drops an item.

pub mod client;

pub use client::LlmClient;

use crate::config::{GeneralConfig, ModelConfig};
use crate::error::GenerationError;
use crate::models::{truncate_chars, CandidateItem, ItemSummary};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Body characters included in a prompt.
const PROMPT_BODY_CHARS: usize = 500;

/// Characters of raw excerpt used when summarization fails.
pub const FALLBACK_EXCERPT_CHARS: usize = 160;

/// Something that turns a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Timeout, retry and concurrency knobs.
#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    pub call_timeout: Duration,
    pub retries: u32,
    pub backoff_base: Duration,
    pub max_parallel: usize,
}

impl SummarizerSettings {
    pub fn from_config(general: &GeneralConfig, model: &ModelConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(model.timeout_seconds),
            retries: model.retries,
            backoff_base: Duration::from_millis(model.backoff_base_ms),
            max_parallel: general.max_parallel_summaries,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

pub struct Summarizer {
    generator: Box<dyn TextGenerator>,
    settings: SummarizerSettings,
}

impl Summarizer {
    pub fn new(generator: Box<dyn TextGenerator>, settings: SummarizerSettings) -> Self {
        Self {
            generator,
            settings,
        }
    }

    /// Summarize one item. Always yields an entry.
    pub async fn summarize(&self, item: &CandidateItem) -> ItemSummary {
        let prompt = build_prompt(item);
        let mut attempt = 0;

        loop {
            let result = tokio::time::timeout(self.settings.call_timeout, self.generator.complete(&prompt))
                .await
                .unwrap_or_else(|_| Err(GenerationError::Timeout(self.settings.call_timeout.as_secs())));

            let err = match result {
                Ok(text) => return ItemSummary::summarized(item, text),
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.settings.retries {
                warn!(
                    item = %item.id,
                    source = %item.source,
                    error = %err,
                    "Summarization failed; using raw excerpt"
                );
                return ItemSummary::fallback(item, FALLBACK_EXCERPT_CHARS);
            }

            let delay = self.settings.backoff(attempt);
            debug!(
                "Retrying summary for {} in {:?} after: {}",
                item.id, delay, err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Summarize a batch with bounded concurrency.
    ///
    /// Items still pending when `deadline` passes are left out of the result;
    /// they were never reported and will be picked up by a later run.
    pub async fn summarize_all(&self, items: &[CandidateItem], deadline: Instant) -> Vec<ItemSummary> {
        let mut summaries = Vec::with_capacity(items.len());
        let mut pending = stream::iter(items)
            .map(|item| self.summarize(item))
            .buffer_unordered(self.settings.max_parallel.max(1));

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Run deadline reached; {} item(s) left unsummarized",
                        items.len() - summaries.len()
                    );
                    break;
                }
            }
        }

        let fallbacks = summaries.iter().filter(|s| !s.ok).count();
        info!(
            "Summarized {} item(s), {} with raw excerpt",
            summaries.len(),
            fallbacks
        );
        summaries
    }
}

/// Prompt for a single item.
pub fn build_prompt(item: &CandidateItem) -> String {
    format!(
        "Summarize this notification in 2-3 short lines. Focus on who did what and any action needed.\n\n\
         From: {}\n\
         Subject: {}\n\
         Content: {}",
        item.sender,
        item.subject,
        truncate_chars(&item.body_excerpt, PROMPT_BODY_CHARS)
    )
}
