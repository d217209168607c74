//! One invocation of the digest: gate, fetch, dedup, summarize, aggregate,
//! deliver, commit.
//!
//! State is only written at the very end, after a transport accepted the
//! report. A run that fails before that point leaves the store untouched.
//!
//! Items fetched but not delivered, because the report was truncated or the
//! deadline cut summarization short, stay unseen. The commit records the
//! oldest of them as `deferred_since` and the next fetch reaches back to it.

use crate::config::{Config, GeneralConfig};
use crate::dedup;
use crate::error::RunError;
use crate::models::{CandidateItem, Channel, SeenItem, SourceFailure};
use crate::notify::Notifier;
use crate::report::AggregateReport;
use crate::scheduler::{GateDecision, RngSampler, SchedulerGate};
use crate::sources::{self, FetchPlan, Source};
use crate::state::StateStore;
use crate::summarizer::{LlmClient, Summarizer, SummarizerSettings};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-invocation directives from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Forget everything seen for this source before running.
    pub reset_source: Option<String>,
    /// Fetch and dedup only; no summaries, delivery or state writes.
    pub dry_run: bool,
}

/// How an invocation ended, short of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The jitter gate declined to run.
    Skipped {
        elapsed_minutes: i64,
        target_gap_minutes: u32,
    },
    /// No unseen items. `last_run` was still advanced.
    NothingNew { failed_sources: usize },
    /// The run deadline passed before any item was summarized.
    Abandoned { pending: usize },
    /// A report went out and its items were committed. `deferred` items
    /// were fetched but left for the next run.
    Committed {
        channel: Channel,
        delivered: usize,
        deferred: usize,
    },
    /// Unseen items found by a dry run.
    DryRun { items: Vec<CandidateItem> },
}

impl RunOutcome {
    /// Process exit code. An abandoned run is the only failing outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Abandoned { .. } => 1,
            _ => 0,
        }
    }
}

/// Everything a run needs, built once from the configuration.
pub struct Pipeline {
    general: GeneralConfig,
    store: StateStore,
    sources: Vec<Source>,
    summarizer: Summarizer,
    notifier: Notifier,
    gate: SchedulerGate,
}

impl Pipeline {
    pub fn new(
        general: GeneralConfig,
        store: StateStore,
        sources: Vec<Source>,
        summarizer: Summarizer,
        notifier: Notifier,
        gate: SchedulerGate,
    ) -> Self {
        Self {
            general,
            store,
            sources,
            summarizer,
            notifier,
            gate,
        }
    }

    /// Wire up the production store, sources, backend and transports.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = StateStore::open(&config.general.db_path).with_context(|| {
            format!(
                "Failed to open state store at {}",
                config.general.db_path.display()
            )
        })?;

        let fetch_timeout = Duration::from_secs(config.general.fetch_timeout_seconds);
        let sources = config
            .sources
            .iter()
            .map(|s| {
                Source::from_config(s, fetch_timeout)
                    .with_context(|| format!("Failed to set up source '{}'", s.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let generator = LlmClient::new(&config.model)?;
        let summarizer = Summarizer::new(
            Box::new(generator),
            SummarizerSettings::from_config(&config.general, &config.model),
        );

        let notifier = Notifier::from_config(&config.delivery)?;
        let gate = SchedulerGate::new(
            config.schedule.clone(),
            Box::new(RngSampler::for_config(config.schedule.seed)),
        );

        info!(
            "{} source(s), schedule {:?}, delivery via {:?}",
            sources.len(),
            gate.mode(),
            notifier.channels()
        );

        Ok(Self::new(
            config.general.clone(),
            store,
            sources,
            summarizer,
            notifier,
            gate,
        ))
    }

    #[allow(dead_code)] // Inspection helper
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Execute one invocation at wall-clock time `now`.
    pub async fn run(&mut self, now: DateTime<Utc>, options: &RunOptions) -> Result<RunOutcome, RunError> {
        if let Some(ref source) = options.reset_source {
            if options.dry_run {
                warn!("Dry run: not resetting seen items for '{}'", source);
            } else {
                self.store.reset_seen(source)?;
            }
        }

        let last_run = self.store.last_run()?;
        if let GateDecision::Skip {
            elapsed_minutes,
            target_gap_minutes,
        } = self.gate.check(last_run, now)
        {
            info!(
                "Skipping: {}m since last run, target gap {}m",
                elapsed_minutes, target_gap_minutes
            );
            return Ok(RunOutcome::Skipped {
                elapsed_minutes,
                target_gap_minutes,
            });
        }

        let deadline = Instant::now() + Duration::from_secs(self.general.run_deadline_seconds);
        let boundary = self
            .gate
            .fetch_boundary(last_run, now, self.general.recency_window_minutes);
        let since = match self.store.deferred_since()? {
            Some(deferred) if deferred < boundary => {
                debug!(
                    "Reaching back to {} for items left by an earlier run",
                    deferred.to_rfc3339()
                );
                deferred
            }
            _ => boundary,
        };
        let plan = FetchPlan {
            since,
            max_items_per_source: self.general.max_items_per_source,
            max_parallel: self.general.max_parallel_sources,
            per_source_timeout: Duration::from_secs(self.general.fetch_timeout_seconds),
        };

        let (candidates, failures) = self.collect(&plan, deadline).await;
        let fresh = dedup::filter_unseen(candidates, &self.store)?;

        if options.dry_run {
            info!("Dry run: {} unseen item(s)", fresh.len());
            return Ok(RunOutcome::DryRun { items: fresh });
        }

        // A failed source may still hold unseen items back to this boundary.
        let carried = if failures.is_empty() { None } else { Some(since) };

        if fresh.is_empty() {
            info!("No new items");
            self.store.commit_run(&[], now, carried)?;
            return Ok(RunOutcome::NothingNew {
                failed_sources: failures.len(),
            });
        }

        let summaries = self.summarizer.summarize_all(&fresh, deadline).await;
        if summaries.is_empty() {
            warn!("Nothing was summarized before the run deadline");
            return Ok(RunOutcome::Abandoned {
                pending: fresh.len(),
            });
        }

        let report = AggregateReport::build(summaries, failures);
        debug!(
            "Report has {} item(s), {} raw, {} failed source(s)",
            report.item_count(),
            report.fallback_count(),
            report.failures().len()
        );
        let delivery = self.notifier.deliver(&report).await?;

        let batch: Vec<SeenItem> = delivery
            .rendered
            .included
            .iter()
            .map(|(id, source)| SeenItem::new(id.as_str(), source.as_str(), now))
            .collect();

        let delivered: HashSet<(&str, &str)> = batch
            .iter()
            .map(|seen| (seen.id.as_str(), seen.source.as_str()))
            .collect();
        let left_behind = fresh
            .iter()
            .filter(|item| !delivered.contains(&(item.id.as_str(), item.source.as_str())))
            .map(|item| item.occurred_at)
            .min();
        let deferred = fresh.len() - delivered.len();
        let deferred_since = match (left_behind, carried) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        self.store.commit_run(&batch, now, deferred_since)?;

        info!(
            "Committed {} item(s) via {}; {} left for the next run",
            batch.len(),
            delivery.channel,
            deferred
        );

        Ok(RunOutcome::Committed {
            channel: delivery.channel,
            delivered: batch.len(),
            deferred,
        })
    }

    /// Fetch every source. Candidates come back in source-name order.
    async fn collect(&self, plan: &FetchPlan, deadline: Instant) -> (Vec<CandidateItem>, Vec<SourceFailure>) {
        let mut candidates = Vec::new();
        let mut failures = Vec::new();

        for (source, outcome) in sources::fetch_all(&self.sources, plan, deadline).await {
            if let Some(reason) = outcome.error {
                failures.push(SourceFailure { source, reason });
            }
            candidates.extend(outcome.items);
        }

        (candidates, failures)
    }
}
