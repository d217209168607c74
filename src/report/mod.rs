//! The composite report delivered once per run.

pub mod render;

pub use render::RenderedReport;

use crate::models::{ItemSummary, SourceFailure};
use std::collections::BTreeMap;

/// Item summaries grouped by account, plus the sources that failed.
#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    groups: BTreeMap<String, Vec<ItemSummary>>,
    failures: Vec<SourceFailure>,
}

impl AggregateReport {
    /// Group summaries by account label. Each group is ordered by
    /// `occurred_at`, ties broken by item id then source, so the result does
    /// not depend on the order summaries completed in.
    pub fn build(summaries: Vec<ItemSummary>, mut failures: Vec<SourceFailure>) -> Self {
        let mut groups: BTreeMap<String, Vec<ItemSummary>> = BTreeMap::new();
        for summary in summaries {
            groups
                .entry(summary.account_label.clone())
                .or_default()
                .push(summary);
        }

        for items in groups.values_mut() {
            items.sort_by(|a, b| {
                a.occurred_at
                    .cmp(&b.occurred_at)
                    .then_with(|| a.item_id.cmp(&b.item_id))
                    .then_with(|| a.source.cmp(&b.source))
            });
        }

        failures.sort_by(|a, b| a.source.cmp(&b.source));

        Self { groups, failures }
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<ItemSummary>> {
        &self.groups
    }

    pub fn failures(&self) -> &[SourceFailure] {
        &self.failures
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemSummary> {
        self.groups.values().flatten()
    }

    pub fn item_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn fallback_count(&self) -> usize {
        self.items().filter(|s| !s.ok).count()
    }
}
