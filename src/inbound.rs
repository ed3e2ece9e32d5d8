//! Inbound recording: replies, engagement events and completed tasks.
//!
//! Parsing webhooks or inboxes happens elsewhere; this is where the already
//! parsed signal enters the core and touches lead state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::funnel::{FunnelEvent, FunnelTracker};
use crate::leads::{
    Channel, Event, EventType, Lead, LeadId, LeadMemory, LeadStatus, Message, StageHistoryEntry,
    Task, TaskType,
};
use crate::llm::{LanguageModelService, ReplyLabel};
use crate::store::Database;

/// What recording a reply did.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyOutcome {
    pub message_id: Uuid,
    pub label: ReplyLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<StageHistoryEntry>,
    /// Set when classification failed and a human has to read the reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_task: Option<Uuid>,
}

pub struct InboundProcessor {
    db: Arc<dyn Database>,
    llm: Arc<dyn LanguageModelService>,
    funnel: Arc<FunnelTracker>,
}

impl InboundProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LanguageModelService>,
        funnel: Arc<FunnelTracker>,
    ) -> Self {
        Self { db, llm, funnel }
    }

    /// Record an inbound reply and let it move the lead.
    pub async fn record_reply(
        &self,
        lead_id: LeadId,
        channel: Channel,
        text: &str,
    ) -> Result<ReplyOutcome, DatabaseError> {
        let lead = self.lead(lead_id).await?;
        let now = Utc::now();

        let classification = match self.llm.classify(text).await {
            Ok(c) => c,
            Err(e) => {
                warn!(lead_id, error = %e, "Reply classification failed, queuing for review");
                return self.queue_for_review(&lead, channel, text).await;
            }
        };

        let message = Message::inbound(
            lead_id,
            channel,
            text,
            Some(classification.label.as_str().to_string()),
        );
        self.db.insert_message(&message).await?;
        self.db.touch_lead_activity(lead_id, now).await?;
        info!(
            lead_id,
            label = %classification.label,
            confidence = classification.confidence,
            "Reply recorded"
        );

        self.remember(&lead, text).await;

        if classification.label == ReplyLabel::Unsubscribe {
            self.db
                .update_lead_status(lead_id, LeadStatus::OptedOut)
                .await?;
            info!(lead_id, "Lead opted out");
        }

        let mut replied = lead;
        replied.last_activity_at = Some(now);
        let transition = match self
            .funnel
            .on_event_at(&replied, &FunnelEvent::InboundMessage { content: text }, now)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(lead_id, error = %e, "Funnel update after reply failed");
                None
            }
        };

        Ok(ReplyOutcome {
            message_id: message.id,
            label: classification.label,
            transition,
            review_task: None,
        })
    }

    async fn queue_for_review(
        &self,
        lead: &Lead,
        channel: Channel,
        text: &str,
    ) -> Result<ReplyOutcome, DatabaseError> {
        let message = Message::inbound(
            lead.id,
            channel,
            text,
            Some(ReplyLabel::ManualReview.as_str().to_string()),
        );
        self.db.insert_message(&message).await?;
        self.db.touch_lead_activity(lead.id, Utc::now()).await?;

        let task = Task::new(
            lead.id,
            TaskType::ReviewReply,
            format!("Review reply from {}", lead.display_name()),
        )
        .with_description(text);
        self.db.insert_task(&task).await?;

        Ok(ReplyOutcome {
            message_id: message.id,
            label: ReplyLabel::ManualReview,
            transition: None,
            review_task: Some(task.id),
        })
    }

    /// Pull memory fields out of the reply. Failures only cost us the memory.
    async fn remember(&self, lead: &Lead, text: &str) {
        let context = match &lead.memory.summary {
            Some(summary) => format!("Lead: {}. So far: {summary}", lead.display_name()),
            None => format!("Lead: {}", lead.display_name()),
        };
        let details = match self.llm.extract_details(text, &context).await {
            Ok(details) => details,
            Err(e) => {
                warn!(lead_id = lead.id, error = %e, "Detail extraction failed");
                return;
            }
        };

        let memory = memory_from_details(&details);
        if memory.is_empty() {
            return;
        }
        if let Err(e) = self.db.update_lead_memory(lead.id, &memory).await {
            warn!(lead_id = lead.id, error = %e, "Could not store lead memory");
        }
    }

    /// Record an engagement signal.
    pub async fn record_event(
        &self,
        lead_id: LeadId,
        event_type: EventType,
        metadata: serde_json::Value,
    ) -> Result<Event, DatabaseError> {
        self.lead(lead_id).await?;
        let event = Event::new(lead_id, event_type, metadata);
        self.db.insert_event(&event).await?;

        match event_type {
            EventType::EmailOpen | EventType::LinkClick => {
                self.db.touch_lead_activity(lead_id, event.created_at).await?;
            }
            EventType::EmailBounce => {
                self.db
                    .update_lead_status(lead_id, LeadStatus::InvalidEmail)
                    .await?;
            }
            EventType::MeetingDetected => {
                self.db
                    .update_lead_status(lead_id, LeadStatus::MeetingBooked)
                    .await?;
            }
        }
        info!(lead_id, event = event_type.as_str(), "Event recorded");
        Ok(event)
    }

    /// Close a task; a lead waiting on it resumes its sequence.
    pub async fn complete_task(&self, id: Uuid) -> Result<Task, DatabaseError> {
        let task = self
            .db
            .complete_task(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "open task".to_string(),
                id: id.to_string(),
            })?;
        info!(task_id = %id, lead_id = task.lead_id, "Task completed");
        Ok(task)
    }

    async fn lead(&self, id: LeadId) -> Result<Lead, DatabaseError> {
        self.db
            .get_lead(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "lead".to_string(),
                id: id.to_string(),
            })
    }
}

fn memory_from_details(details: &HashMap<String, String>) -> LeadMemory {
    let field = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| details.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(str::to_string)
    };
    LeadMemory {
        summary: field(&["summary"]),
        last_objection: field(&["objection", "last_objection"]),
        buying_signals: field(&["buying_signals", "buyingSignals"]),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;
    use crate::funnel::FunnelStateMachine;
    use crate::leads::{Direction, FunnelStage, NewLead, TaskStatus};
    use crate::llm::{Adaptation, Classification, DisabledLanguageModel};
    use crate::store::{DispatchRecord, LibSqlBackend};

    struct ScriptedModel {
        label: ReplyLabel,
    }

    #[async_trait]
    impl LanguageModelService for ScriptedModel {
        async fn classify(&self, _text: &str) -> Result<Classification, LlmError> {
            Ok(Classification {
                label: self.label,
                confidence: 0.9,
                summary: String::new(),
            })
        }
        async fn personalize(
            &self,
            _lead: &Lead,
            template: &str,
            _channel: Channel,
        ) -> Result<String, LlmError> {
            Ok(template.to_string())
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
            Ok(HashMap::from([
                ("summary".to_string(), "Wants a quote for two sites".to_string()),
                ("objection".to_string(), "  ".to_string()),
                ("buying_signals".to_string(), "asked about pricing".to_string()),
            ]))
        }
    }

    async fn setup(llm: Arc<dyn LanguageModelService>) -> (Arc<dyn Database>, InboundProcessor, Lead) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = db
            .insert_lead(&NewLead {
                first_name: Some("Dana".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let funnel = Arc::new(FunnelTracker::new(
            Arc::clone(&db),
            FunnelStateMachine::default(),
        ));
        let processor = InboundProcessor::new(Arc::clone(&db), llm, funnel);
        (db, processor, lead)
    }

    #[tokio::test]
    async fn interested_reply_updates_lead() {
        let (db, processor, lead) = setup(Arc::new(ScriptedModel {
            label: ReplyLabel::Interested,
        }))
        .await;

        let outcome = processor
            .record_reply(lead.id, Channel::Sms, "Yes, I'm interested. What's the pricing?")
            .await
            .unwrap();
        assert_eq!(outcome.label, ReplyLabel::Interested);
        assert_eq!(
            outcome.transition.map(|t| t.to_stage),
            Some(FunnelStage::Qualified)
        );

        let messages = db.list_messages(lead.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, Direction::Inbound);
        assert_eq!(messages[0].classification.as_deref(), Some("INTERESTED"));

        let stored = db.get_lead(lead.id).await.unwrap().unwrap();
        assert!(stored.last_activity_at.is_some());
        assert_eq!(
            stored.memory.summary.as_deref(),
            Some("Wants a quote for two sites")
        );
        assert!(stored.memory.last_objection.is_none());
        assert_eq!(
            stored.memory.buying_signals.as_deref(),
            Some("asked about pricing")
        );
        assert!(db.has_classified_message(lead.id, "INTERESTED").await.unwrap());
    }

    #[tokio::test]
    async fn negative_reply_loses_lead() {
        let (db, processor, lead) = setup(Arc::new(ScriptedModel {
            label: ReplyLabel::NotInterested,
        }))
        .await;

        processor
            .record_reply(lead.id, Channel::Sms, "not interested, please stop")
            .await
            .unwrap();
        let history = db.list_stage_history(lead.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_stage, FunnelStage::Lost);
        assert_eq!(history[0].confidence, 85);
    }

    #[tokio::test]
    async fn unsubscribe_opts_out() {
        let (db, processor, lead) = setup(Arc::new(ScriptedModel {
            label: ReplyLabel::Unsubscribe,
        }))
        .await;

        processor
            .record_reply(lead.id, Channel::Email, "Unsubscribe")
            .await
            .unwrap();
        assert_eq!(
            db.get_lead(lead.id).await.unwrap().unwrap().status,
            LeadStatus::OptedOut
        );
    }

    #[tokio::test]
    async fn classification_failure_goes_to_review() {
        let (db, processor, lead) = setup(Arc::new(DisabledLanguageModel)).await;

        let outcome = processor
            .record_reply(lead.id, Channel::Sms, "Yes, I'm interested!")
            .await
            .unwrap();
        assert_eq!(outcome.label, ReplyLabel::ManualReview);
        assert!(outcome.transition.is_none());

        let stored = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.funnel_stage, FunnelStage::Lead);

        let tasks = db.list_open_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::ReviewReply);
        assert_eq!(Some(tasks[0].id), outcome.review_task);
        assert!(db.has_classified_message(lead.id, "MANUAL_REVIEW").await.unwrap());
    }

    #[tokio::test]
    async fn reply_for_unknown_lead_is_not_found() {
        let (_db, processor, _lead) = setup(Arc::new(DisabledLanguageModel)).await;
        let err = processor
            .record_reply(9999, Channel::Sms, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn events_update_lead_state() {
        let (db, processor, lead) = setup(Arc::new(DisabledLanguageModel)).await;

        processor
            .record_event(lead.id, EventType::EmailOpen, serde_json::json!({}))
            .await
            .unwrap();
        let stored = db.get_lead(lead.id).await.unwrap().unwrap();
        assert!(stored.last_activity_at.is_some());
        assert!(db.has_event(lead.id, EventType::EmailOpen).await.unwrap());

        processor
            .record_event(
                lead.id,
                EventType::EmailBounce,
                serde_json::json!({"reason": "mailbox full"}),
            )
            .await
            .unwrap();
        assert_eq!(
            db.get_lead(lead.id).await.unwrap().unwrap().status,
            LeadStatus::InvalidEmail
        );

        processor
            .record_event(lead.id, EventType::MeetingDetected, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(
            db.get_lead(lead.id).await.unwrap().unwrap().status,
            LeadStatus::MeetingBooked
        );
    }

    #[tokio::test]
    async fn completing_task_resumes_lead() {
        let (db, processor, lead) = setup(Arc::new(DisabledLanguageModel)).await;
        let task = Task::new(lead.id, TaskType::Call, "Call Dana");
        db.insert_task(&task).await.unwrap();
        let record = DispatchRecord {
            lead_id: lead.id,
            expected_step: 0,
            new_step: 1,
            status: LeadStatus::ManualTaskDue,
            contacted_at: Utc::now(),
            message: None,
            task: None,
        };
        assert!(db.record_dispatch(&record).await.unwrap());

        let done = processor.complete_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(
            db.get_lead(lead.id).await.unwrap().unwrap().status,
            LeadStatus::Active
        );

        let again = processor.complete_task(task.id).await.unwrap_err();
        assert!(matches!(again, DatabaseError::NotFound { .. }));
    }
}
