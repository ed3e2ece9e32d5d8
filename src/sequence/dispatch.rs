//! Dispatcher: hands resolved content to the right channel collaborator.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::{ChannelSenders, RateLimiter, SendOutcome};
use crate::error::ChannelError;
use crate::leads::{Channel, Lead, Task, TaskType};

/// Normalized outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub success: bool,
    /// A human has to do this step instead of a sender.
    pub manual: bool,
    pub provider_id: Option<String>,
    pub error: Option<String>,
    /// Task to open for a manual step. Written together with the step advance.
    pub task: Option<Task>,
}

impl DispatchResult {
    pub fn sent(provider_id: Option<String>) -> Self {
        Self {
            success: true,
            manual: false,
            provider_id,
            error: None,
            task: None,
        }
    }

    pub fn manual(task: Task) -> Self {
        Self {
            success: true,
            manual: true,
            provider_id: None,
            error: None,
            task: Some(task),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            manual: false,
            provider_id: None,
            error: Some(reason.into()),
            task: None,
        }
    }
}

pub struct Dispatcher {
    senders: ChannelSenders,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl Dispatcher {
    pub fn new(senders: ChannelSenders, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            senders,
            rate_limiter,
        }
    }

    /// Send on `channel`, or hand back a task for non-automatable channels.
    /// Nothing is persisted here; the caller records the outcome.
    pub async fn send(&self, channel: Channel, lead: &Lead, content: &str) -> DispatchResult {
        if !channel.is_automatable() {
            return DispatchResult::manual(manual_task(channel, lead, content));
        }

        match self.send_direct(channel, lead, content).await {
            Ok(outcome) => DispatchResult::sent(outcome.provider_id),
            Err(ChannelError::RateLimited { .. }) => DispatchResult::failed("rate-limited"),
            Err(ChannelError::NotConfigured { .. }) => DispatchResult::failed("not configured"),
            Err(e) => DispatchResult::failed(e.to_string()),
        }
    }

    /// Send on an automatable channel, consulting the rate limiter for EMAIL.
    pub async fn send_direct(
        &self,
        channel: Channel,
        lead: &Lead,
        content: &str,
    ) -> Result<SendOutcome, ChannelError> {
        let sender = self.senders.require(channel).inspect_err(|_| {
            warn!(channel = %channel, lead_id = lead.id, "No sender configured, skipping");
        })?;

        if channel == Channel::Email {
            let allowance = self.rate_limiter.check_sending_limits().await;
            if !allowance.can_send {
                info!(
                    lead_id = lead.id,
                    reason = allowance.reason.as_deref().unwrap_or("unspecified"),
                    "Email send deferred by rate limiter"
                );
                return Err(ChannelError::RateLimited {
                    name: channel.as_str().to_string(),
                });
            }
        }

        let outcome = sender.send(lead, content).await.inspect_err(|e| {
            warn!(channel = %channel, lead_id = lead.id, error = %e, "Send failed");
        })?;
        debug!(
            channel = %channel,
            lead_id = lead.id,
            provider_id = outcome.provider_id.as_deref().unwrap_or("-"),
            "Message sent"
        );
        Ok(outcome)
    }
}

fn manual_task(channel: Channel, lead: &Lead, content: &str) -> Task {
    let task = Task::new(
        lead.id,
        TaskType::for_channel(channel),
        format!("{} {}", channel_verb(channel), lead.display_name()),
    )
    .with_description(content);
    info!(lead_id = lead.id, channel = %channel, task_id = %task.id, "Manual step needs a task");
    task
}

fn channel_verb(channel: Channel) -> &'static str {
    match channel {
        Channel::Call => "Call",
        Channel::Linkedin => "LinkedIn touch with",
        Channel::Voicemail => "Leave voicemail for",
        Channel::Sms => "Text",
        Channel::Email => "Email",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{NoRateLimit, SendingAllowance};
    use crate::leads::NewLead;
    use crate::store::{Database, LibSqlBackend};

    struct CountingSender {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl crate::channels::ChannelSender for CountingSender {
        fn name(&self) -> &str {
            "counting"
        }
        async fn send(&self, _lead: &Lead, _content: &str) -> Result<SendOutcome, ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(SendOutcome {
                provider_id: Some("msg-1".into()),
            })
        }
    }

    struct DenyAll;

    #[async_trait]
    impl RateLimiter for DenyAll {
        async fn check_sending_limits(&self) -> SendingAllowance {
            SendingAllowance::denied("warmup")
        }
    }

    async fn setup(
        limiter: Arc<dyn RateLimiter>,
    ) -> (Arc<dyn Database>, Arc<CountingSender>, Dispatcher, Lead) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = db
            .insert_lead(&NewLead {
                first_name: Some("Dana".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let sender = Arc::new(CountingSender {
            sent: AtomicUsize::new(0),
        });
        let senders = ChannelSenders::new()
            .with_sender(Channel::Email, sender.clone())
            .with_sender(Channel::Sms, sender.clone());
        let dispatcher = Dispatcher::new(senders, limiter);
        (db, sender, dispatcher, lead)
    }

    #[tokio::test]
    async fn automatable_channel_sends() {
        let (_db, sender, dispatcher, lead) = setup(Arc::new(NoRateLimit)).await;
        let result = dispatcher.send(Channel::Sms, &lead, "Hi").await;
        assert!(result.success);
        assert!(!result.manual);
        assert_eq!(result.provider_id.as_deref(), Some("msg-1"));
        assert_eq!(sender.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_email_has_no_side_effects() {
        let (db, sender, dispatcher, lead) = setup(Arc::new(DenyAll)).await;
        let result = dispatcher.send(Channel::Email, &lead, "Hi").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("rate-limited"));
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
        assert!(db.list_messages(lead.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sms_ignores_email_rate_limit() {
        let (_db, sender, dispatcher, lead) = setup(Arc::new(DenyAll)).await;
        assert!(dispatcher.send(Channel::Sms, &lead, "Hi").await.success);
        assert_eq!(sender.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_channel_returns_task_without_writing_it() {
        let (db, sender, dispatcher, lead) = setup(Arc::new(NoRateLimit)).await;
        let result = dispatcher.send(Channel::Call, &lead, "Intro call").await;
        assert!(result.success);
        assert!(result.manual);
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);

        let task = result.task.unwrap();
        assert_eq!(task.lead_id, lead.id);
        assert_eq!(task.task_type, TaskType::Call);
        assert_eq!(task.title, "Call Dana");
        assert_eq!(task.description.as_deref(), Some("Intro call"));

        // Persisting is the scheduler's job, alongside the step advance.
        assert!(db.list_open_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_sender_fails_softly() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = db.insert_lead(&NewLead::default()).await.unwrap();
        let dispatcher = Dispatcher::new(ChannelSenders::new(), Arc::new(NoRateLimit));

        let result = dispatcher.send(Channel::Email, &lead, "Hi").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("not configured"));
    }
}
