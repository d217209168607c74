//! Report delivery with fallback to a secondary channel.

pub mod email;
pub mod twilio;

pub use email::EmailTransport;
pub use twilio::TwilioTransport;

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, RunError};
use crate::models::Channel;
use crate::report::{AggregateReport, RenderedReport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Subject used when no email section configures one.
const DEFAULT_SUBJECT: &str = "Notification Summary";

/// Outbound message transport for one channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError>;
}

/// The report as it was actually delivered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: Channel,
    pub rendered: RenderedReport,
}

struct Route {
    transport: Box<dyn Transport>,
    budget: usize,
}

/// Ordered transports, tried until one accepts the report.
pub struct Notifier {
    routes: Vec<Route>,
    subject: String,
}

impl Notifier {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            routes: Vec::new(),
            subject: subject.into(),
        }
    }

    /// Append a transport with its length budget.
    pub fn route(mut self, transport: Box<dyn Transport>, budget: usize) -> Self {
        self.routes.push(Route { transport, budget });
        self
    }

    /// Build the primary and optional secondary transports.
    pub fn from_config(delivery: &DeliveryConfig) -> Result<Self> {
        let subject = delivery
            .email
            .as_ref()
            .map(|e| e.subject.clone())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

        let mut notifier = Self::new(subject);
        for channel in delivery.channels() {
            let transport: Box<dyn Transport> = match channel {
                Channel::Sms => {
                    let sms = delivery
                        .sms
                        .as_ref()
                        .ok_or_else(|| anyhow!("sms channel selected but [delivery.sms] is missing"))?;
                    Box::new(TwilioTransport::from_config(sms)?)
                }
                Channel::Email => {
                    let email = delivery
                        .email
                        .as_ref()
                        .ok_or_else(|| anyhow!("email channel selected but [delivery.email] is missing"))?;
                    Box::new(EmailTransport::from_config(email)?)
                }
            };
            notifier = notifier.route(transport, delivery.budget_for(channel));
        }
        Ok(notifier)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.routes.iter().map(|r| r.transport.channel()).collect()
    }

    /// Deliver the report, rendering it for each channel's budget in turn.
    ///
    /// Fails only when every configured transport refused it.
    pub async fn deliver(&self, report: &AggregateReport) -> Result<Delivery, RunError> {
        let mut attempts = Vec::new();

        for route in &self.routes {
            let channel = route.transport.channel();
            let rendered = report.render(route.budget);

            match route.transport.send(&self.subject, &rendered.text).await {
                Ok(()) => {
                    info!(
                        channel = %channel,
                        items = rendered.included.len(),
                        deferred = rendered.deferred,
                        "Report delivered"
                    );
                    return Ok(Delivery { channel, rendered });
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Delivery attempt failed");
                    attempts.push(e.to_string());
                }
            }
        }

        error!("No transport accepted the report");
        Err(RunError::DeliveryFailed { attempts })
    }
}
