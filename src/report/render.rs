//! Plain-text rendering bounded by a channel's length budget.

use super::AggregateReport;
use crate::models::{normalize_whitespace, truncate_chars, ItemSummary};
use std::collections::HashMap;
use tracing::debug;

/// Longest failure reason shown in the footer.
const MAX_REASON_CHARS: usize = 80;

/// Report text as sent on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    pub text: String,
    /// `(id, source)` of every item present in `text`.
    pub included: Vec<(String, String)>,
    /// Items left out to fit the budget.
    pub deferred: usize,
}

impl AggregateReport {
    /// Render within `budget` characters.
    ///
    /// While over budget the globally oldest item is dropped, skipping
    /// accounts down to their last item until no other choice is left. A
    /// single remaining item that still does not fit is cut with an ellipsis.
    pub fn render(&self, budget: usize) -> RenderedReport {
        let items: Vec<&ItemSummary> = self.items().collect();
        let mut kept = vec![true; items.len()];

        let mut drop_order: Vec<usize> = (0..items.len()).collect();
        drop_order.sort_by(|&a, &b| {
            items[a]
                .occurred_at
                .cmp(&items[b].occurred_at)
                .then_with(|| items[a].item_id.cmp(&items[b].item_id))
                .then_with(|| items[a].source.cmp(&items[b].source))
        });

        loop {
            let text = self.compose(&items, &kept);
            if text.chars().count() <= budget {
                return finish(text, &items, &kept);
            }

            match next_to_drop(&items, &kept, &drop_order) {
                Some(idx) => kept[idx] = false,
                None => {
                    debug!("Report still over {} chars; cutting text", budget);
                    return finish(truncate_chars(&text, budget), &items, &kept);
                }
            }
        }
    }

    fn compose(&self, items: &[&ItemSummary], kept: &[bool]) -> String {
        let shown = kept.iter().filter(|k| **k).count();
        let deferred = kept.len() - shown;
        let raw = items
            .iter()
            .zip(kept)
            .filter(|(item, k)| **k && !item.ok)
            .count();

        let mut out = format!(
            "{} new notification{}\n",
            shown,
            if shown == 1 { "" } else { "s" }
        );

        let mut offset = 0;
        for (label, group) in self.groups() {
            let range = offset..offset + group.len();
            offset += group.len();

            let lines: Vec<String> = range
                .filter(|&i| kept[i])
                .map(|i| item_line(items[i]))
                .collect();
            if lines.is_empty() {
                continue;
            }

            out.push_str(&format!("\n[{}]\n", label));
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }

        let mut notes = Vec::new();
        for failure in self.failures() {
            notes.push(format!(
                "! {} unavailable: {}",
                failure.source,
                truncate_chars(&failure.reason, MAX_REASON_CHARS)
            ));
        }
        if raw > 0 {
            notes.push(format!("! {} item(s) shown as raw excerpt", raw));
        }
        if deferred > 0 {
            notes.push(format!("! {} older item(s) deferred to next run", deferred));
        }
        if !notes.is_empty() {
            out.push('\n');
            out.push_str(&notes.join("\n"));
            out.push('\n');
        }

        out.trim_end().to_string()
    }
}

fn item_line(item: &ItemSummary) -> String {
    let marker = if item.ok { "" } else { "[raw] " };
    format!(
        "- {} {}: {}{}",
        item.occurred_at.format("%H:%M"),
        item.sender,
        marker,
        normalize_whitespace(&item.summary_text)
    )
}

/// Oldest kept item whose account keeps another item; failing that, the
/// oldest kept item overall. `None` once a single item is left.
fn next_to_drop(items: &[&ItemSummary], kept: &[bool], drop_order: &[usize]) -> Option<usize> {
    if kept.iter().filter(|k| **k).count() <= 1 {
        return None;
    }

    let mut per_account: HashMap<&str, usize> = HashMap::new();
    for (item, _) in items.iter().zip(kept).filter(|(_, k)| **k) {
        *per_account.entry(item.account_label.as_str()).or_default() += 1;
    }

    drop_order
        .iter()
        .copied()
        .filter(|&i| kept[i])
        .find(|&i| per_account[items[i].account_label.as_str()] > 1)
        .or_else(|| drop_order.iter().copied().find(|&i| kept[i]))
}

fn finish(text: String, items: &[&ItemSummary], kept: &[bool]) -> RenderedReport {
    let included: Vec<(String, String)> = items
        .iter()
        .zip(kept)
        .filter(|(_, k)| **k)
        .map(|(item, _)| item.key())
        .collect();
    let deferred = items.len() - included.len();

    RenderedReport {
        text,
        included,
        deferred,
    }
}
