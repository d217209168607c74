//! Mailbox source over IMAP.
//!
//! The folder is opened with EXAMINE and bodies are fetched with
//! `BODY.PEEK[]`, so polling never changes a message's flags. Only unread
//! messages are searched for.

use super::{clean_excerpt, SourceClient};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::models::CandidateItem;
use anyhow::{anyhow, bail, Context, Result};
use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use mail_parser::{Message, MessageParser};
use tokio::net::TcpStream;
use tracing::debug;

/// Implicit-TLS IMAP port.
pub const IMAPS_PORT: u16 = 993;

/// Newest unread messages fetched per poll.
const MAX_MESSAGES_PER_POLL: usize = 50;

type ImapSession = Session<TlsStream<TcpStream>>;

/// One mailbox account.
pub struct MailboxClient {
    name: String,
    account_label: String,
    host: String,
    port: u16,
    folder: String,
    username: String,
    credential: String,
}

impl MailboxClient {
    /// `url` has the form `imaps://host[:port]`.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let url = reqwest::Url::parse(&config.url)
            .with_context(|| format!("Invalid mailbox URL '{}'", config.url))?;
        if url.scheme() != "imaps" {
            bail!("Mailbox URL '{}' must use the imaps:// scheme", config.url);
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Mailbox URL '{}' has no host", config.url))?
            .to_string();

        Ok(Self {
            name: config.name.clone(),
            account_label: config.label().to_string(),
            host,
            port: url.port().unwrap_or(IMAPS_PORT),
            folder: config.folder.clone(),
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("imaps://{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<ImapSession, FetchError> {
        let connect_error = |message: String| FetchError::Connect {
            url: self.endpoint(),
            message,
        };

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let tls = async_native_tls::TlsConnector::new()
            .connect(self.host.as_str(), tcp)
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        async_imap::Client::new(tls)
            .login(&self.username, &self.credential)
            .await
            .map_err(|(e, _)| {
                debug!("IMAP login for {} refused: {}", self.username, e);
                FetchError::Unauthorized {
                    url: self.endpoint(),
                }
            })
    }

    async fn read_folder(
        &self,
        session: &mut ImapSession,
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateItem>, FetchError> {
        let protocol = |e: async_imap::error::Error| FetchError::Protocol(e.to_string());

        session.examine(&self.folder).await.map_err(protocol)?;

        let mut uids: Vec<u32> = session
            .uid_search(search_query(since))
            .await
            .map_err(protocol)?
            .into_iter()
            .collect();
        if uids.is_empty() {
            debug!("Mailbox '{}': no unread messages", self.name);
            return Ok(Vec::new());
        }

        uids.sort_unstable();
        let newest = &uids[uids.len().saturating_sub(MAX_MESSAGES_PER_POLL)..];
        let uid_set = newest
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let fetches: Vec<Fetch> = session
            .uid_fetch(&uid_set, "(UID INTERNALDATE BODY.PEEK[])")
            .await
            .map_err(protocol)?
            .try_collect()
            .await
            .map_err(protocol)?;

        debug!(
            "Mailbox '{}': {} unread, fetched {}",
            self.name,
            uids.len(),
            fetches.len()
        );

        let mut items = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(raw) = fetch.body() else {
                debug!("Message {} came back without a body", fetch.message);
                continue;
            };
            let uid = fetch.uid.unwrap_or(fetch.message);
            let received = fetch.internal_date().map(|d| d.with_timezone(&Utc));
            match self.parse_message(raw, uid, received) {
                Some(item) => items.push(item),
                None => debug!("Could not parse message uid {} in '{}'", uid, self.name),
            }
        }
        Ok(items)
    }

    /// Map a raw RFC 5322 message to a candidate.
    ///
    /// Without a `Message-ID` the item is keyed by folder and UID. Without a
    /// `Date` header the server's internal date is used.
    fn parse_message(
        &self,
        raw: &[u8],
        uid: u32,
        received: Option<DateTime<Utc>>,
    ) -> Option<CandidateItem> {
        let message = MessageParser::default().parse(raw)?;

        let id = message
            .message_id()
            .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}/{}", self.folder, uid));

        let occurred_at = message
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
            .or(received)
            .unwrap_or_else(Utc::now);

        let body = message.body_text(0).unwrap_or_default();

        Some(CandidateItem {
            id,
            source: self.name.clone(),
            account_label: self.account_label.clone(),
            sender: sender_of(&message),
            subject: message.subject().unwrap_or_default().trim().to_string(),
            body_excerpt: clean_excerpt(&body),
            occurred_at,
        })
    }
}

/// `Name <address>` of the first `From` entry.
fn sender_of(message: &Message<'_>) -> String {
    let Some(addr) = message.from().and_then(|from| from.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{} <{}>", name, address),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// IMAP search for unread mail received on or after the day before `since`.
///
/// SINCE compares dates in the server's timezone, so the extra day keeps
/// messages near midnight. Exact filtering happens after the fetch.
pub fn search_query(since: DateTime<Utc>) -> String {
    let day = since - Duration::days(1);
    format!("UNSEEN SINCE {}", day.format("%d-%b-%Y"))
}

#[async_trait]
impl SourceClient for MailboxClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
        let mut session = self.connect().await?;
        let result = self.read_folder(&mut session, since).await;

        if let Err(e) = session.logout().await {
            debug!("IMAP logout from {} failed: {}", self.endpoint(), e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use chrono::TimeZone;

    fn source(url: &str) -> SourceConfig {
        SourceConfig {
            name: "work".to_string(),
            kind: SourceKind::Mailbox,
            url: url.to_string(),
            account_label: Some("me@work.example".to_string()),
            folder: "INBOX".to_string(),
            username: Some("me@work.example".to_string()),
            credential_env: None,
            from_filters: vec![],
            subject_keywords: vec![],
            credential: Some("secret".to_string()),
        }
    }

    fn client() -> MailboxClient {
        MailboxClient::from_config(&source("imaps://imap.work.example")).unwrap()
    }

    const PLAIN: &str = "Message-ID: <abc@mail.example>\r\n\
        From: Jane Doe <jane@example.com>\r\n\
        To: me@work.example\r\n\
        Subject:  Lunch? \r\n\
        Date: Mon, 8 Dec 2025 09:30:00 +0000\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Are you free\r\n\
        tomorrow?\r\n";

    #[test]
    fn test_url_parsing() {
        let c = client();
        assert_eq!(c.host, "imap.work.example");
        assert_eq!(c.port, IMAPS_PORT);

        let custom = MailboxClient::from_config(&source("imaps://127.0.0.1:1993")).unwrap();
        assert_eq!(custom.endpoint(), "imaps://127.0.0.1:1993");

        assert!(MailboxClient::from_config(&source("https://imap.work.example")).is_err());
    }

    #[test]
    fn test_search_query_reaches_back_a_day() {
        let since = Utc.with_ymd_and_hms(2025, 12, 8, 0, 10, 0).unwrap();
        assert_eq!(search_query(since), "UNSEEN SINCE 07-Dec-2025");
    }

    #[test]
    fn test_parse_plain_message() {
        let item = client().parse_message(PLAIN.as_bytes(), 7, None).unwrap();

        assert_eq!(item.id, "abc@mail.example");
        assert_eq!(item.source, "work");
        assert_eq!(item.account_label, "me@work.example");
        assert_eq!(item.sender, "Jane Doe <jane@example.com>");
        assert_eq!(item.subject, "Lunch?");
        assert_eq!(item.body_excerpt, "Are you free tomorrow?");
        assert_eq!(
            item.occurred_at,
            Utc.with_ymd_and_hms(2025, 12, 8, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_html_only_message_without_id_or_date() {
        let raw = "From: notify@linkedin.com\r\n\
            Subject: Someone commented on your post\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <html><body><p>Jane <b>commented</b>: nice</p></body></html>\r\n";
        let received = Utc.with_ymd_and_hms(2025, 12, 8, 9, 45, 0).unwrap();

        let item = client()
            .parse_message(raw.as_bytes(), 42, Some(received))
            .unwrap();
        assert_eq!(item.id, "INBOX/42");
        assert_eq!(item.sender, "notify@linkedin.com");
        assert_eq!(item.occurred_at, received);
        assert!(item.body_excerpt.contains("Jane"));
        assert!(item.body_excerpt.contains("commented"));
        assert!(!item.body_excerpt.contains('<'));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connect_error() {
        // Nothing listens on the discard port.
        let client = MailboxClient::from_config(&source("imaps://127.0.0.1:9")).unwrap();
        let err = client
            .fetch_since(Utc.with_ymd_and_hms(2025, 12, 8, 9, 0, 0).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Connect { .. }));
    }
}
