//! Step gating predicates evaluated against a lead's history.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::leads::{EventType, LeadId};
use crate::llm::ReplyLabel;
use crate::sequence::model::StepCondition;
use crate::store::Database;

/// Facts about a lead that predicates look at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeadHistory {
    pub has_inbound: bool,
    pub has_email_open: bool,
    pub has_interested: bool,
}

/// A predicate keyed by its JSON name.
pub struct ConditionRule {
    pub key: &'static str,
    /// Returns whether the lead may proceed.
    pub check: fn(&Value, &LeadHistory, &StepCondition) -> bool,
}

fn previous_step_replied(value: &Value, history: &LeadHistory, cond: &StepCondition) -> bool {
    if value == &Value::Bool(false) && history.has_inbound {
        return !cond.skips_on_failure();
    }
    true
}

fn email_opened(value: &Value, history: &LeadHistory, _: &StepCondition) -> bool {
    value != &Value::Bool(true) || history.has_email_open
}

fn interested(value: &Value, history: &LeadHistory, _: &StepCondition) -> bool {
    value != &Value::Bool(true) || history.has_interested
}

/// Any value other than `false`/`null` (a step count, `true`) gates on silence.
fn no_response_after_steps(value: &Value, history: &LeadHistory, _: &StepCondition) -> bool {
    matches!(value, Value::Bool(false) | Value::Null) || !history.has_inbound
}

/// Known predicates. Keys not listed here pass through.
pub static CONDITION_RULES: &[ConditionRule] = &[
    ConditionRule {
        key: "previousStepReplied",
        check: previous_step_replied,
    },
    ConditionRule {
        key: "emailOpened",
        check: email_opened,
    },
    ConditionRule {
        key: "interested",
        check: interested,
    },
    ConditionRule {
        key: "noResponseAfterSteps",
        check: no_response_after_steps,
    },
];

/// Pure evaluation over already-loaded history. All known predicates must hold.
pub fn evaluate(condition: &StepCondition, history: &LeadHistory) -> bool {
    condition.predicates.iter().all(|(key, value)| {
        match CONDITION_RULES.iter().find(|rule| rule.key == key.as_str()) {
            Some(rule) => (rule.check)(value, history, condition),
            None => {
                debug!(key = %key, "Ignoring unknown step condition");
                true
            }
        }
    })
}

pub struct ConditionEvaluator {
    db: Arc<dyn Database>,
}

impl ConditionEvaluator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Whether the step may run for this lead. No condition always proceeds;
    /// history that cannot be loaded proceeds too.
    pub async fn evaluate(&self, condition: Option<&StepCondition>, lead_id: LeadId) -> bool {
        let Some(condition) = condition else {
            return true;
        };
        if condition.predicates.is_empty() {
            return true;
        }
        match self.load_history(lead_id).await {
            Ok(history) => evaluate(condition, &history),
            Err(e) => {
                warn!(lead_id, error = %e, "Could not load history for step condition, proceeding");
                true
            }
        }
    }

    async fn load_history(&self, lead_id: LeadId) -> Result<LeadHistory, DatabaseError> {
        Ok(LeadHistory {
            has_inbound: self.db.has_inbound_message(lead_id).await?,
            has_email_open: self.db.has_event(lead_id, EventType::EmailOpen).await?,
            has_interested: self
                .db
                .has_classified_message(lead_id, ReplyLabel::Interested.as_str())
                .await?,
        })
    }
}
