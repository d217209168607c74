//! RSS/Atom feed source.

use super::{clean_excerpt, SourceClient};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::models::CandidateItem;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

pub struct RssClient {
    name: String,
    account_label: String,
    url: String,
    http: reqwest::Client,
}

impl RssClient {
    pub fn from_config(config: &SourceConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            name: config.name.clone(),
            account_label: config.label().to_string(),
            url: config.url.clone(),
            http,
        })
    }

    fn parse(&self, bytes: &[u8], now: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
        let feed = feed_rs::parser::parse(bytes).map_err(|e| FetchError::Protocol(e.to_string()))?;

        let feed_title = feed
            .title
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.url.clone());

        let items = feed
            .entries
            .into_iter()
            .filter_map(|entry| {
                let link = entry.links.first().map(|l| l.href.clone());
                let id = if entry.id.trim().is_empty() {
                    link?
                } else {
                    entry.id.clone()
                };

                let body = entry
                    .summary
                    .map(|s| s.content)
                    .or_else(|| entry.content.and_then(|c| c.body))
                    .unwrap_or_default();

                Some(CandidateItem {
                    id,
                    source: self.name.clone(),
                    account_label: self.account_label.clone(),
                    sender: feed_title.clone(),
                    subject: entry
                        .title
                        .map(|t| t.content.trim().to_string())
                        .unwrap_or_else(|| "No title".to_string()),
                    body_excerpt: clean_excerpt(&body),
                    occurred_at: entry.published.or(entry.updated).unwrap_or(now),
                })
            })
            .collect();

        Ok(items)
    }
}

#[async_trait]
impl SourceClient for RssClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_since(&self, _since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FetchError::Connect {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?;

        let items = self.parse(&bytes, Utc::now())?;
        debug!("Feed '{}' has {} entries", self.name, items.len());
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Blog</title>
    <link>https://blog.example.com</link>
    <description>Posts</description>
    <item>
      <title>Release 1.2</title>
      <link>https://blog.example.com/release-1-2</link>
      <guid>release-1-2</guid>
      <description>&lt;p&gt;Faster &lt;b&gt;builds&lt;/b&gt;&lt;/p&gt;</description>
      <pubDate>Mon, 08 Dec 2025 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Untimed note</title>
      <link>https://blog.example.com/note</link>
      <description>No date here</description>
    </item>
  </channel>
</rss>"#;

    fn source(url: String) -> SourceConfig {
        SourceConfig {
            name: "blog".to_string(),
            kind: SourceKind::Rss,
            url,
            account_label: None,
            folder: "INBOX".to_string(),
            username: None,
            credential_env: None,
            from_filters: vec![],
            subject_keywords: vec![],
            credential: None,
        }
    }

    #[test]
    fn test_parse_entries() {
        let client =
            RssClient::from_config(&source("https://blog.example.com/feed".to_string()), Duration::from_secs(5))
                .unwrap();
        let now = Utc.with_ymd_and_hms(2025, 12, 8, 12, 0, 0).unwrap();
        let items = client.parse(FEED.as_bytes(), now).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "release-1-2");
        assert_eq!(items[0].sender, "Example Blog");
        assert_eq!(items[0].account_label, "blog");
        assert_eq!(items[0].subject, "Release 1.2");
        assert_eq!(items[0].body_excerpt, "Faster builds");
        assert_eq!(
            items[0].occurred_at,
            Utc.with_ymd_and_hms(2025, 12, 8, 10, 0, 0).unwrap()
        );
        assert_eq!(items[1].occurred_at, now);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let client =
            RssClient::from_config(&source("https://blog.example.com/feed".to_string()), Duration::from_secs(5))
                .unwrap();
        let err = client.parse(b"definitely not xml", Utc::now()).unwrap_err();
        assert!(matches!(err, FetchError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_fetch_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
            .mount(&server)
            .await;

        let client = RssClient::from_config(
            &source(format!("{}/feed.xml", server.uri())),
            Duration::from_secs(5),
        )
        .unwrap();
        let items = client.fetch_since(Utc::now()).await.unwrap();
        assert_eq!(items.len(), 2);

        let missing = RssClient::from_config(
            &source(format!("{}/missing.xml", server.uri())),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(
            missing.fetch_since(Utc::now()).await,
            Err(FetchError::Status { status: 404, .. })
        ));
    }
}
