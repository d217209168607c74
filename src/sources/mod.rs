//! Source fetching.
//!
//! Each configured source is polled concurrently, bounded by
//! `max_parallel_sources`. A source that errors or exceeds its deadline is
//! recorded as failed without affecting the others.

pub mod mailbox;
pub mod rss;

pub use mailbox::MailboxClient;
pub use rss::RssClient;

use crate::config::{SourceConfig, SourceKind};
use crate::error::FetchError;
use crate::models::CandidateItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound on a stored body excerpt.
pub const MAX_EXCERPT_CHARS: usize = 600;

/// Read-only access to one external source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Configured source name.
    fn name(&self) -> &str;

    /// Candidate items that occurred at or after `since`.
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError>;
}

/// Sender allow-list and subject keywords applied at fetch time.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    pub from_filters: Vec<String>,
    pub subject_keywords: Vec<String>,
}

impl SourceFilter {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            from_filters: config.from_filters.clone(),
            subject_keywords: config.subject_keywords.clone(),
        }
    }

    /// No filters accepts everything. With both kinds configured, matching
    /// either one is enough.
    pub fn matches(&self, sender: &str, subject: &str) -> bool {
        let sender = sender.to_lowercase();
        let subject = subject.to_lowercase();

        let from_match = self
            .from_filters
            .iter()
            .any(|f| sender.contains(&f.to_lowercase()));
        let subject_match = self
            .subject_keywords
            .iter()
            .any(|k| subject.contains(&k.to_lowercase()));

        match (self.from_filters.is_empty(), self.subject_keywords.is_empty()) {
            (true, true) => true,
            (false, true) => from_match,
            (true, false) => subject_match,
            (false, false) => from_match || subject_match,
        }
    }
}

/// A client together with its fetch-time filter.
pub struct Source {
    pub client: Box<dyn SourceClient>,
    pub filter: SourceFilter,
}

impl Source {
    pub fn new(client: Box<dyn SourceClient>, filter: SourceFilter) -> Self {
        Self { client, filter }
    }

    /// Build the production adapter for a configured source.
    pub fn from_config(config: &SourceConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client: Box<dyn SourceClient> = match config.kind {
            SourceKind::Mailbox => Box::new(MailboxClient::from_config(config)?),
            SourceKind::Rss => Box::new(RssClient::from_config(config, timeout)?),
        };
        Ok(Self::new(client, SourceFilter::from_config(config)))
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }
}

/// Parameters shared by every fetch of one run.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub since: DateTime<Utc>,
    pub max_items_per_source: usize,
    pub max_parallel: usize,
    pub per_source_timeout: Duration,
}

/// What one source produced this run.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub items: Vec<CandidateItem>,
    pub error: Option<String>,
}

impl FetchOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            error: Some(reason.into()),
        }
    }
}

/// Fetch every source, keyed by source name.
///
/// Sources still in flight when `deadline` passes are abandoned and reported
/// as failed.
pub async fn fetch_all(
    sources: &[Source],
    plan: &FetchPlan,
    deadline: Instant,
) -> BTreeMap<String, FetchOutcome> {
    let mut results: BTreeMap<String, FetchOutcome> = sources
        .iter()
        .map(|s| {
            (
                s.name().to_string(),
                FetchOutcome::failed("run deadline reached before fetch completed"),
            )
        })
        .collect();

    let mut pending = stream::iter(sources)
        .map(|source| async move { (source.name().to_string(), fetch_one(source, plan).await) })
        .buffer_unordered(plan.max_parallel.max(1));

    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Ok(Some((name, outcome))) => {
                results.insert(name, outcome);
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Run deadline reached during fetch; abandoning remaining sources");
                break;
            }
        }
    }

    results
}

async fn fetch_one(source: &Source, plan: &FetchPlan) -> FetchOutcome {
    let name = source.name();
    info!("Fetching source '{}' since {}", name, plan.since.to_rfc3339());

    let fetched = tokio::time::timeout(plan.per_source_timeout, source.client.fetch_since(plan.since))
        .await
        .unwrap_or_else(|_| Err(FetchError::Timeout(plan.per_source_timeout.as_secs())));

    let items = match fetched {
        Ok(items) => items,
        Err(e) => {
            error!(source = name, error = %e, "Source unavailable");
            return FetchOutcome::failed(e.to_string());
        }
    };

    let total = items.len();
    let mut items: Vec<CandidateItem> = items
        .into_iter()
        .filter(|item| item.occurred_at >= plan.since)
        .filter(|item| source.filter.matches(&item.sender, &item.subject))
        .collect();

    // Keep the newest items when over the cap.
    items.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
    if items.len() > plan.max_items_per_source {
        debug!(
            "Source '{}' capped from {} to {} items",
            name,
            items.len(),
            plan.max_items_per_source
        );
        items.truncate(plan.max_items_per_source);
    }
    items.reverse();

    info!(
        "Source '{}': {} candidate(s) of {} fetched",
        name,
        items.len(),
        total
    );

    FetchOutcome { items, error: None }
}

/// Strip markup and collapse whitespace, bounded to [`MAX_EXCERPT_CHARS`].
pub fn clean_excerpt(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    crate::models::truncate_chars(&crate::models::normalize_whitespace(&text), MAX_EXCERPT_CHARS)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 8, 9, 0, 0).unwrap()
    }

    pub(crate) fn candidate(source: &str, id: &str, minute: i64) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            source: source.to_string(),
            account_label: format!("{source}@example.com"),
            sender: "LinkedIn <notify@linkedin.com>".to_string(),
            subject: format!("Update {id}"),
            body_excerpt: format!("Body of {id}"),
            occurred_at: t0() + ChronoDuration::minutes(minute),
        }
    }

    /// Scripted source for pipeline tests.
    pub(crate) enum Behavior {
        Items(Vec<CandidateItem>),
        Fail,
        Hang,
    }

    pub(crate) struct FakeSource {
        pub name: String,
        pub behavior: Behavior,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        pub(crate) fn new(name: &str, behavior: Behavior) -> Self {
            Self {
                name: name.to_string(),
                behavior,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn boxed(name: &str, behavior: Behavior) -> Source {
            Self::counted(name, behavior).0
        }

        /// Like [`FakeSource::boxed`], also returning the fetch counter.
        pub(crate) fn counted(name: &str, behavior: Behavior) -> (Source, Arc<AtomicUsize>) {
            let fake = Self::new(name, behavior);
            let calls = fake.calls.clone();
            (Source::new(Box::new(fake), SourceFilter::default()), calls)
        }
    }

    #[async_trait]
    impl SourceClient for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch_since(&self, _since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Items(items) => Ok(items.clone()),
                Behavior::Fail => Err(FetchError::Connect {
                    url: format!("https://{}.example.com", self.name),
                    message: "connection refused".to_string(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn plan(max_items: usize) -> FetchPlan {
        FetchPlan {
            since: t0(),
            max_items_per_source: max_items,
            max_parallel: 2,
            per_source_timeout: Duration::from_millis(200),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_filter_semantics() {
        let none = SourceFilter::default();
        assert!(none.matches("anyone", "anything"));

        let from_only = SourceFilter {
            from_filters: vec!["@LinkedIn.com".to_string()],
            subject_keywords: vec![],
        };
        assert!(from_only.matches("LinkedIn <notify@linkedin.com>", "x"));
        assert!(!from_only.matches("bank@example.com", "commented on"));

        let both = SourceFilter {
            from_filters: vec!["@linkedin.com".to_string()],
            subject_keywords: vec!["commented on".to_string()],
        };
        assert!(both.matches("bank@example.com", "Jane Commented On your post"));
        assert!(both.matches("notify@linkedin.com", "weekly digest"));
        assert!(!both.matches("bank@example.com", "statement ready"));
    }

    #[test]
    fn test_clean_excerpt() {
        assert_eq!(
            clean_excerpt("<p>Hello&nbsp;<b>world</b></p>\n\n &amp; more"),
            "Hello world & more"
        );
        assert_eq!(clean_excerpt(&"x".repeat(700)).chars().count(), MAX_EXCERPT_CHARS);
    }

    #[tokio::test]
    async fn test_cap_keeps_newest_in_ascending_order() {
        let items = (0..5).map(|i| candidate("a", &format!("m{i}"), i)).collect();
        let sources = vec![FakeSource::boxed("a", Behavior::Items(items))];

        let results = fetch_all(&sources, &plan(3), far_deadline()).await;
        let ids: Vec<_> = results["a"].items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_items_before_boundary_are_dropped() {
        let items = vec![candidate("a", "old", -5), candidate("a", "new", 5)];
        let sources = vec![FakeSource::boxed("a", Behavior::Items(items))];

        let results = tokio_test::block_on(fetch_all(&sources, &plan(10), far_deadline()));
        assert_eq!(results["a"].items.len(), 1);
        assert_eq!(results["a"].items[0].id, "new");
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let sources = vec![
            FakeSource::boxed("a", Behavior::Items(vec![candidate("a", "1", 1)])),
            FakeSource::boxed("b", Behavior::Fail),
            FakeSource::boxed("c", Behavior::Hang),
            FakeSource::boxed("d", Behavior::Items(vec![candidate("d", "1", 2)])),
        ];

        let results = fetch_all(&sources, &plan(10), far_deadline()).await;
        assert_eq!(results.len(), 4);
        assert_eq!(results["a"].items.len(), 1);
        assert!(results["a"].error.is_none());
        assert!(results["b"].error.as_deref().unwrap().contains("connection refused"));
        assert!(results["c"].error.as_deref().unwrap().contains("abandoned"));
        assert_eq!(results["d"].items.len(), 1);
    }

    #[tokio::test]
    async fn test_run_deadline_abandons_pending_sources() {
        let mut slow_plan = plan(10);
        slow_plan.per_source_timeout = Duration::from_secs(3600);
        let sources = vec![
            FakeSource::boxed("fast", Behavior::Items(vec![candidate("fast", "1", 1)])),
            FakeSource::boxed("slow", Behavior::Hang),
        ];

        let deadline = Instant::now() + Duration::from_millis(100);
        let results = fetch_all(&sources, &slow_plan, deadline).await;
        assert_eq!(results["fast"].items.len(), 1);
        assert!(results["slow"].error.as_deref().unwrap().contains("deadline"));
    }
}
