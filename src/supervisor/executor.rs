//! Action executor: runs human-approved activities.
//!
//! Execution is at-most-once per activity: the APPROVED→EXECUTED claim is a
//! compare-and-set taken before any side effect, so a second call for the
//! same id fails with `InvalidTransition` instead of sending again.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ChannelError, ExecutorError};
use crate::leads::{Channel, Lead, LeadId, Message};
use crate::llm::LanguageModelService;
use crate::sequence::{ContentResolver, Dispatcher};
use crate::store::Database;
use crate::supervisor::activity::{
    Activity, ActivityAction, ActivityStatus, ActivityType, Severity,
};

/// A human verdict on a pending activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn target(self) -> ActivityStatus {
        match self {
            Self::Approve => ActivityStatus::Approved,
            Self::Reject => ActivityStatus::Rejected,
        }
    }
}

pub struct ActionExecutor {
    db: Arc<dyn Database>,
    llm: Arc<dyn LanguageModelService>,
    content: Arc<ContentResolver>,
    dispatcher: Arc<Dispatcher>,
    re_engagement_template: String,
}

impl ActionExecutor {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LanguageModelService>,
        content: Arc<ContentResolver>,
        dispatcher: Arc<Dispatcher>,
        re_engagement_template: impl Into<String>,
    ) -> Self {
        Self {
            db,
            llm,
            content,
            dispatcher,
            re_engagement_template: re_engagement_template.into(),
        }
    }

    /// Approve or reject a pending activity. Approval executes it right away.
    pub async fn decide(&self, id: Uuid, decision: Decision) -> Result<Activity, ExecutorError> {
        let to = decision.target();
        if !self
            .db
            .transition_activity(id, ActivityStatus::Pending, to)
            .await?
        {
            return Err(self.transition_error(id, ActivityStatus::Pending).await);
        }
        info!(activity_id = %id, status = %to, "Activity decided");

        match decision {
            Decision::Approve => self.execute(id).await,
            Decision::Reject => self.load(id).await,
        }
    }

    /// Execute an APPROVED activity. The returned activity carries the final
    /// status (EXECUTED or FAILED) and the outcome note.
    pub async fn execute(&self, id: Uuid) -> Result<Activity, ExecutorError> {
        if !self
            .db
            .transition_activity(id, ActivityStatus::Approved, ActivityStatus::Executed)
            .await?
        {
            return Err(self.transition_error(id, ActivityStatus::Approved).await);
        }
        let activity = self.load(id).await?;

        match self.run_action(&activity).await {
            Ok(note) => {
                self.db
                    .finish_activity(id, ActivityStatus::Executed, &note)
                    .await?;
                info!(activity_id = %id, action = activity.action.label(), "Activity executed");
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(activity_id = %id, action = activity.action.label(), error = %reason, "Activity failed");
                self.db
                    .finish_activity(id, ActivityStatus::Failed, &reason)
                    .await?;
                let failure = Activity::new(
                    ActivityType::ActionFailed,
                    Severity::Medium,
                    format!("Action failed: {}", activity.title),
                    reason,
                    ActivityAction::None,
                );
                if let Err(e) = self.db.insert_activity(&failure).await {
                    warn!(activity_id = %id, error = %e, "Could not log failure activity");
                }
            }
        }

        self.load(id).await
    }

    async fn run_action(&self, activity: &Activity) -> Result<String, ExecutorError> {
        match &activity.action {
            ActivityAction::SendReEngagement { lead_id } => self.send_re_engagement(*lead_id).await,
            ActivityAction::None | ActivityAction::Unknown => Ok("No action to run".to_string()),
        }
    }

    async fn send_re_engagement(&self, lead_id: LeadId) -> Result<String, ExecutorError> {
        let lead = self.lead(lead_id).await?;
        if lead.status.is_terminal() {
            return Err(ExecutorError::ActionFailed {
                action: "SEND_RE_ENGAGEMENT".to_string(),
                reason: format!("lead is {}", lead.status),
            });
        }

        let template = match self
            .llm
            .personalize(&lead, &self.re_engagement_template, Channel::Email)
            .await
        {
            Ok(personalized) => personalized,
            Err(e) => {
                warn!(lead_id, error = %e, "Personalization failed, using stock template");
                self.re_engagement_template.clone()
            }
        };
        let text = self.content.fill_placeholders(&template, &lead);
        let rendered = self.content.render_for_channel(Channel::Email, &lead, &text);

        self.dispatcher
            .send_direct(Channel::Email, &lead, &rendered)
            .await
            .map_err(|e| ExecutorError::ActionFailed {
                action: "SEND_RE_ENGAGEMENT".to_string(),
                reason: match e {
                    ChannelError::RateLimited { .. } => "rate-limited".to_string(),
                    other => other.to_string(),
                },
            })?;

        self.db
            .record_direct_send(&Message::outbound(lead.id, Channel::Email, rendered, None))
            .await?;

        let completed = Activity::new(
            ActivityType::ActionCompleted,
            Severity::Low,
            format!("Re-engagement sent to {}", lead.display_name()),
            format!("Re-engagement email sent to lead {}", lead.id),
            ActivityAction::None,
        );
        self.db.insert_activity(&completed).await?;

        Ok("Re-engagement email sent".to_string())
    }

    async fn lead(&self, id: LeadId) -> Result<Lead, ExecutorError> {
        self.db
            .get_lead(id)
            .await?
            .ok_or(ExecutorError::LeadNotFound { id })
    }

    async fn load(&self, id: Uuid) -> Result<Activity, ExecutorError> {
        self.db
            .get_activity(id)
            .await?
            .ok_or(ExecutorError::ActivityNotFound { id })
    }

    async fn transition_error(&self, id: Uuid, expected: ActivityStatus) -> ExecutorError {
        match self.load(id).await {
            Ok(activity) => ExecutorError::InvalidTransition {
                id,
                status: activity.status.to_string(),
                expected: expected.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{
        ChannelSender, ChannelSenders, NoRateLimit, RateLimiter, SendOutcome, SendingAllowance,
    };
    use crate::error::LlmError;
    use crate::leads::{Direction, LeadStatus, NewLead};
    use crate::llm::{Adaptation, Classification, DisabledLanguageModel};
    use crate::store::LibSqlBackend;

    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }
        async fn send(&self, _lead: &Lead, content: &str) -> Result<SendOutcome, ChannelError> {
            self.sent.lock().unwrap().push(content.to_string());
            Ok(SendOutcome::default())
        }
    }

    struct DenyAll;

    #[async_trait]
    impl RateLimiter for DenyAll {
        async fn check_sending_limits(&self) -> SendingAllowance {
            SendingAllowance::denied("warmup")
        }
    }

    struct Personalizer;

    #[async_trait]
    impl LanguageModelService for Personalizer {
        async fn classify(&self, _text: &str) -> Result<Classification, LlmError> {
            Err(LlmError::NotConfigured)
        }
        async fn personalize(
            &self,
            lead: &Lead,
            _template: &str,
            _channel: Channel,
        ) -> Result<String, LlmError> {
            Ok(format!("Hey {}, picking things back up?", lead.display_name()))
        }
        async fn adapt(
            &self,
            template: &str,
            _lead_id: LeadId,
            _channel: Channel,
        ) -> Result<Adaptation, LlmError> {
            Ok(Adaptation {
                adapted: false,
                content: template.to_string(),
            })
        }
        async fn extract_details(
            &self,
            _text: &str,
            _context: &str,
        ) -> Result<HashMap<String, String>, LlmError> {
            Ok(HashMap::new())
        }
    }

    struct Harness {
        db: Arc<dyn Database>,
        sender: Arc<RecordingSender>,
        executor: ActionExecutor,
        lead: Lead,
    }

    async fn harness(
        llm: Arc<dyn LanguageModelService>,
        limiter: Arc<dyn RateLimiter>,
        with_email: bool,
    ) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = db
            .insert_lead(&NewLead {
                first_name: Some("Dana".into()),
                company: Some("Acme".into()),
                email: Some("dana@example.com".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });
        let mut senders = ChannelSenders::new();
        if with_email {
            senders = senders.with_sender(Channel::Email, sender.clone());
        }
        let content = Arc::new(ContentResolver::new(
            Arc::clone(&db),
            Arc::clone(&llm),
            Some("https://cal.example.com/dana".into()),
            None,
        ));
        let dispatcher = Arc::new(Dispatcher::new(senders, limiter));
        let executor = ActionExecutor::new(
            Arc::clone(&db),
            llm,
            content,
            dispatcher,
            "Hi {{firstName}}, still thinking about {{company}}? {{bookingLink}}",
        );
        Harness {
            db,
            sender,
            executor,
            lead,
        }
    }

    async fn pending_re_engagement(h: &Harness) -> Uuid {
        let activity = Activity::new(
            ActivityType::ActionRequired,
            Severity::High,
            "Stale lead",
            "No activity for 16 days",
            ActivityAction::SendReEngagement {
                lead_id: h.lead.id,
            },
        );
        h.db.insert_activity(&activity).await.unwrap();
        activity.id
    }

    #[tokio::test]
    async fn approval_sends_one_email() {
        let h = harness(Arc::new(Personalizer), Arc::new(NoRateLimit), true).await;
        let id = pending_re_engagement(&h).await;

        let done = h.executor.decide(id, Decision::Approve).await.unwrap();
        assert_eq!(done.status, ActivityStatus::Executed);
        assert!(done.decided_at.is_some());
        assert!(done.executed_at.is_some());

        let sent = h.sender.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["Hey Dana, picking things back up?".to_string()]);

        let messages = h.db.list_messages(h.lead.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, Direction::Outbound);
        assert_eq!(messages[0].channel, Channel::Email);

        let lead = h.db.get_lead(h.lead.id).await.unwrap().unwrap();
        assert!(lead.last_contacted_at.is_some());

        let completed = h
            .db
            .list_activities(None, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.activity_type == ActivityType::ActionCompleted)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn second_execution_is_rejected() {
        let h = harness(Arc::new(Personalizer), Arc::new(NoRateLimit), true).await;
        let id = pending_re_engagement(&h).await;
        h.executor.decide(id, Decision::Approve).await.unwrap();

        let again = h.executor.execute(id).await;
        assert!(matches!(again, Err(ExecutorError::InvalidTransition { .. })));
        let again = h.executor.decide(id, Decision::Approve).await;
        assert!(matches!(again, Err(ExecutorError::InvalidTransition { .. })));

        assert_eq!(h.sender.sent.lock().unwrap().len(), 1);
        assert_eq!(h.db.list_messages(h.lead.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn personalization_failure_uses_template() {
        let h = harness(Arc::new(DisabledLanguageModel), Arc::new(NoRateLimit), true).await;
        let id = pending_re_engagement(&h).await;
        h.executor.decide(id, Decision::Approve).await.unwrap();

        let sent = h.sender.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec!["Hi Dana, still thinking about Acme? https://cal.example.com/dana".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_sender_fails_activity() {
        let h = harness(Arc::new(Personalizer), Arc::new(NoRateLimit), false).await;
        let id = pending_re_engagement(&h).await;

        let done = h.executor.decide(id, Decision::Approve).await.unwrap();
        assert_eq!(done.status, ActivityStatus::Failed);
        assert!(done.result.unwrap().contains("SEND_RE_ENGAGEMENT"));
        assert!(h.db.list_messages(h.lead.id).await.unwrap().is_empty());

        let failed = h
            .db
            .list_activities(None, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.activity_type == ActivityType::ActionFailed)
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn rate_limited_re_engagement_fails() {
        let h = harness(Arc::new(Personalizer), Arc::new(DenyAll), true).await;
        let id = pending_re_engagement(&h).await;

        let done = h.executor.decide(id, Decision::Approve).await.unwrap();
        assert_eq!(done.status, ActivityStatus::Failed);
        assert!(done.result.unwrap().contains("rate-limited"));
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_does_not_execute() {
        let h = harness(Arc::new(Personalizer), Arc::new(NoRateLimit), true).await;
        let id = pending_re_engagement(&h).await;

        let rejected = h.executor.decide(id, Decision::Reject).await.unwrap();
        assert_eq!(rejected.status, ActivityStatus::Rejected);
        assert!(h.sender.sent.lock().unwrap().is_empty());

        let err = h.executor.execute(id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidTransition { ref status, .. } if status == "REJECTED"));
    }

    #[tokio::test]
    async fn unknown_action_is_noop_success() {
        let h = harness(Arc::new(Personalizer), Arc::new(NoRateLimit), true).await;
        let activity = Activity::new(
            ActivityType::ActionRequired,
            Severity::Low,
            "Mystery",
            "",
            ActivityAction::Unknown,
        );
        h.db.insert_activity(&activity).await.unwrap();

        let done = h.executor.decide(activity.id, Decision::Approve).await.unwrap();
        assert_eq!(done.status, ActivityStatus::Executed);
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn opted_out_lead_is_not_re_engaged() {
        let h = harness(Arc::new(Personalizer), Arc::new(NoRateLimit), true).await;
        let id = pending_re_engagement(&h).await;
        h.db.update_lead_status(h.lead.id, LeadStatus::OptedOut)
            .await
            .unwrap();

        let done = h.executor.decide(id, Decision::Approve).await.unwrap();
        assert_eq!(done.status, ActivityStatus::Failed);
        assert!(done.result.unwrap().contains("OPTED_OUT"));
        assert!(h.sender.sent.lock().unwrap().is_empty());
        assert!(h.db.list_messages(h.lead.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_activity_is_not_found() {
        let h = harness(Arc::new(Personalizer), Arc::new(NoRateLimit), true).await;
        let err = h
            .executor
            .decide(Uuid::new_v4(), Decision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ActivityNotFound { .. }));
    }
}
