//! Email over SMTP.
//!
//! Sent as a single `text/plain` message. The SMTP session is generic over
//! lettre's [`AsyncTransport`] so tests can swap in a stub.

use super::Transport;
use crate::config::{EmailConfig, SmtpTls};
use crate::error::DeliveryError;
use crate::models::Channel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::fmt::Display;
use std::time::Duration;
use tracing::debug;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EmailTransport<M = AsyncSmtpTransport<Tokio1Executor>> {
    mailer: M,
    from: Mailbox,
    to: Mailbox,
}

impl EmailTransport {
    pub fn from_config(config: &EmailConfig) -> Result<Self> {
        let builder = match config.tls {
            SmtpTls::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            }
            SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host),
        }
        .with_context(|| format!("Invalid SMTP host '{}'", config.smtp_host))?;

        let username = config
            .username
            .clone()
            .unwrap_or_else(|| config.from.clone());
        let mailer = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                username,
                config.password.clone().unwrap_or_default(),
            ))
            .timeout(Some(SEND_TIMEOUT))
            .build();

        debug!(
            "SMTP relay {}:{} ({:?})",
            config.smtp_host, config.smtp_port, config.tls
        );
        Self::with_mailer(mailer, &config.from, &config.to)
    }
}

impl<M> EmailTransport<M> {
    pub fn with_mailer(mailer: M, from: &str, to: &str) -> Result<Self> {
        let from: Mailbox = from
            .parse()
            .with_context(|| format!("Invalid sender address '{}'", from))?;
        let to: Mailbox = to
            .parse()
            .with_context(|| format!("Invalid recipient address '{}'", to))?;
        Ok(Self { mailer, from, to })
    }

    fn compose(&self, subject: &str, body: &str) -> Result<Message, lettre::error::Error> {
        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
    }
}

#[async_trait]
impl<M> Transport for EmailTransport<M>
where
    M: AsyncTransport + Send + Sync,
    M::Error: Display,
{
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let transport_error = |message: String| DeliveryError::Transport {
            channel: Channel::Email,
            message,
        };

        let message = self
            .compose(subject, body)
            .map_err(|e| transport_error(e.to_string()))?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| transport_error(e.to_string()))?;

        debug!("Email accepted for {}", self.to);
        Ok(())
    }
}
