//! Data models for the digest pipeline.
//!
//! Everything here except [`SeenItem`] is run-scoped: produced and discarded
//! within one invocation. Persistence is owned by [`crate::state`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery channel for the composite report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Sms => write!(f, "sms"),
            Channel::Email => write!(f, "email"),
        }
    }
}

/// A processed item identifier, as persisted in `seen_items`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenItem {
    pub id: String,
    pub source: String,
    pub first_seen_at: DateTime<Utc>,
}

impl SeenItem {
    pub fn new(id: impl Into<String>, source: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            first_seen_at: at,
        }
    }
}

/// An item returned by a source fetch, before dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    /// Source-local identifier (message id, feed guid).
    pub id: String,
    /// Name of the configured source that produced the item.
    pub source: String,
    /// Label the report groups by (usually the mailbox address).
    pub account_label: String,
    pub sender: String,
    pub subject: String,
    pub body_excerpt: String,
    pub occurred_at: DateTime<Utc>,
}

impl CandidateItem {
    /// The `(id, source)` pair that identifies this item in the seen-set.
    pub fn key(&self) -> (String, String) {
        (self.id.clone(), self.source.clone())
    }

    /// Sender without the `<address>` part, for compact display.
    pub fn sender_display(&self) -> &str {
        match self.sender.find('<') {
            Some(idx) if idx > 0 => self.sender[..idx].trim().trim_matches('"'),
            _ => self.sender.trim(),
        }
    }
}

/// Result of summarizing one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub item_id: String,
    pub source: String,
    pub account_label: String,
    pub sender: String,
    pub subject: String,
    pub occurred_at: DateTime<Utc>,
    pub summary_text: String,
    /// False when the backend failed and `summary_text` is a raw excerpt.
    pub ok: bool,
}

impl ItemSummary {
    /// Build a summary from a successful backend response.
    pub fn summarized(item: &CandidateItem, text: String) -> Self {
        Self::from_item(item, text, true)
    }

    /// Build the fallback entry used when summarization failed.
    pub fn fallback(item: &CandidateItem, excerpt_chars: usize) -> Self {
        let source_text = if item.body_excerpt.trim().is_empty() {
            item.subject.as_str()
        } else {
            item.body_excerpt.as_str()
        };
        Self::from_item(item, truncate_chars(source_text, excerpt_chars), false)
    }

    fn from_item(item: &CandidateItem, summary_text: String, ok: bool) -> Self {
        Self {
            item_id: item.id.clone(),
            source: item.source.clone(),
            account_label: item.account_label.clone(),
            sender: item.sender_display().to_string(),
            subject: item.subject.clone(),
            occurred_at: item.occurred_at,
            summary_text,
            ok,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.item_id.clone(), self.source.clone())
    }
}

/// A source that could not be fetched this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out = out.trim_end().to_string();
    out.push('…');
    out
}

/// Collapse runs of whitespace into single spaces.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
