//! Outbound channel collaborators.
//!
//! Transports (SMS gateways, SMTP, ...) live outside the core. The core only
//! sees a [`ChannelSender`] per automatable channel and a [`RateLimiter`]
//! consulted before every EMAIL send.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::leads::{Channel, Lead};

/// What a transport reports after accepting a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub provider_id: Option<String>,
}

/// Sends already-rendered content to one lead over one channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    async fn send(&self, lead: &Lead, content: &str) -> Result<SendOutcome, ChannelError>;
}

/// Answer from the rate limiter / warmup collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingAllowance {
    pub can_send: bool,
    pub reason: Option<String>,
}

impl SendingAllowance {
    pub fn allowed() -> Self {
        Self {
            can_send: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            can_send: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check_sending_limits(&self) -> SendingAllowance;
}

/// Always allows.
pub struct NoRateLimit;

#[async_trait]
impl RateLimiter for NoRateLimit {
    async fn check_sending_limits(&self) -> SendingAllowance {
        SendingAllowance::allowed()
    }
}

/// Caps allowed sends per UTC day. Each granted check counts as one send.
pub struct DailySendLimit {
    limit: u32,
    state: Mutex<(NaiveDate, u32)>,
}

impl DailySendLimit {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            state: Mutex::new((Utc::now().date_naive(), 0)),
        }
    }
}

#[async_trait]
impl RateLimiter for DailySendLimit {
    async fn check_sending_limits(&self) -> SendingAllowance {
        let today = Utc::now().date_naive();
        let mut state = self.state.lock().await;
        if state.0 != today {
            *state = (today, 0);
        }
        if state.1 >= self.limit {
            return SendingAllowance::denied(format!("daily limit of {} reached", self.limit));
        }
        state.1 += 1;
        SendingAllowance::allowed()
    }
}

/// Logs instead of sending. Used when no transport is wired in.
pub struct DryRunSender {
    channel: Channel,
}

impl DryRunSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSender for DryRunSender {
    fn name(&self) -> &str {
        self.channel.as_str()
    }

    async fn send(&self, lead: &Lead, content: &str) -> Result<SendOutcome, ChannelError> {
        tracing::info!(
            channel = %self.channel,
            lead_id = lead.id,
            chars = content.len(),
            "Dry run: message not sent"
        );
        Ok(SendOutcome {
            provider_id: Some(format!("dry-run-{}", Uuid::new_v4())),
        })
    }
}

/// Registry of senders keyed by channel.
#[derive(Clone, Default)]
pub struct ChannelSenders {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl ChannelSenders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a sender for `channel`.
    pub fn with_sender(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    /// Like [`get`](Self::get) but reports absence as `NotConfigured`.
    pub fn require(&self, channel: Channel) -> Result<&Arc<dyn ChannelSender>, ChannelError> {
        self.get(channel).ok_or_else(|| ChannelError::NotConfigured {
            name: channel.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn daily_limit_denies_after_cap() {
        let limiter = DailySendLimit::new(2);
        assert!(limiter.check_sending_limits().await.can_send);
        assert!(limiter.check_sending_limits().await.can_send);

        let denied = limiter.check_sending_limits().await;
        assert!(!denied.can_send);
        assert!(denied.reason.unwrap().contains("daily limit"));
    }

    #[tokio::test]
    async fn no_rate_limit_always_allows() {
        for _ in 0..100 {
            assert!(NoRateLimit.check_sending_limits().await.can_send);
        }
    }

    #[test]
    fn missing_sender_is_not_configured() {
        let senders =
            ChannelSenders::new().with_sender(Channel::Sms, Arc::new(DryRunSender::new(Channel::Sms)));
        assert!(senders.get(Channel::Sms).is_some());
        let err = senders.require(Channel::Email).err().unwrap();
        assert!(matches!(err, ChannelError::NotConfigured { ref name } if name == "EMAIL"));
    }
}
