//! SMS through the Twilio Messages REST API.

use super::Transport;
use crate::config::SmsConfig;
use crate::error::DeliveryError;
use crate::models::Channel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TwilioTransport {
    messages_url: String,
    account_sid: String,
    auth_token: String,
    from: String,
    to: String,
    http: reqwest::Client,
}

impl TwilioTransport {
    pub fn from_config(config: &SmsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            messages_url: format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                config.api_base.trim_end_matches('/'),
                config.account_sid
            ),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone().unwrap_or_default(),
            from: config.from_number.clone(),
            to: config.to_number.clone(),
            http,
        })
    }
}

#[async_trait]
impl Transport for TwilioTransport {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, _subject: &str, body: &str) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(&self.messages_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", self.to.as_str()), ("From", self.from.as_str()), ("Body", body)])
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                channel: Channel::Sms,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Http {
                channel: Channel::Sms,
                status: status.as_u16(),
                body,
            });
        }

        debug!("SMS accepted for {}", self.to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_base: String) -> SmsConfig {
        SmsConfig {
            account_sid: "AC123".to_string(),
            auth_token_env: "TWILIO_AUTH_TOKEN".to_string(),
            from_number: "+15550000001".to_string(),
            to_number: "+15550000002".to_string(),
            api_base,
            auth_token: Some("token".to_string()),
        }
    }

    #[tokio::test]
    async fn test_posts_form_to_messages_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B15550000002"))
            .and(body_string_contains("Body=2+new+notifications"))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"sid":"SM1"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let transport = TwilioTransport::from_config(&config(server.uri())).unwrap();
        transport.send("ignored", "2 new notifications").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid To number"))
            .mount(&server)
            .await;

        let transport = TwilioTransport::from_config(&config(server.uri())).unwrap();
        match transport.send("s", "body").await {
            Err(DeliveryError::Http { status, body, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "invalid To number");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
