//! Activity model: supervisor output gated by a human decision.
//!
//! The structured action payload is a tagged union keyed by `action`, so
//! executors match on typed variants instead of reading loose JSON fields.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::leads::LeadId;

/// What produced an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    /// A candidate remediation waiting on approval.
    ActionRequired,
    DeliveryFailures,
    MeetingsBooked,
    SystemHealth,
    ActionCompleted,
    ActionFailed,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActionRequired => "ACTION_REQUIRED",
            Self::DeliveryFailures => "DELIVERY_FAILURES",
            Self::MeetingsBooked => "MEETINGS_BOOKED",
            Self::SystemHealth => "SYSTEM_HEALTH",
            Self::ActionCompleted => "ACTION_COMPLETED",
            Self::ActionFailed => "ACTION_FAILED",
        }
    }
}

impl FromStr for ActivityType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTION_REQUIRED" => Ok(Self::ActionRequired),
            "DELIVERY_FAILURES" => Ok(Self::DeliveryFailures),
            "MEETINGS_BOOKED" => Ok(Self::MeetingsBooked),
            "SYSTEM_HEALTH" => Ok(Self::SystemHealth),
            "ACTION_COMPLETED" => Ok(Self::ActionCompleted),
            "ACTION_FAILED" => Ok(Self::ActionFailed),
            _ => Err(format!("Unknown activity type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    /// Severity for a summary of `count` processed items.
    pub fn for_count(count: u32) -> Self {
        match count {
            0..=2 => Self::Low,
            3..=9 => Self::Medium,
            _ => Self::High,
        }
    }
}

impl FromStr for Severity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            _ => Err(format!("Unknown severity: {s}")),
        }
    }
}

/// Lifecycle of an activity.
///
/// PENDING → APPROVED | REJECTED by a human; APPROVED → EXECUTED (claimed
/// before any side effect) → FAILED if the action errors afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
        }
    }

    /// Still waiting on a decision or on execution.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "EXECUTED" => Ok(Self::Executed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Unknown activity status: {s}")),
        }
    }
}

/// Structured action payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityAction {
    /// Informational entry, nothing to execute.
    None,
    SendReEngagement {
        #[serde(rename = "leadId")]
        lead_id: LeadId,
    },
    /// Any action this build does not know. Executes as a no-op.
    #[serde(other)]
    Unknown,
}

impl ActivityAction {
    pub fn lead_id(&self) -> Option<LeadId> {
        match self {
            Self::SendReEngagement { lead_id } => Some(*lead_id),
            Self::None | Self::Unknown => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::SendReEngagement { .. } => "SEND_RE_ENGAGEMENT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// A supervisor-generated, human-gated candidate action or log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub activity_type: ActivityType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub action: ActivityAction,
    pub status: ActivityStatus,
    /// Outcome note written on execution or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl Activity {
    /// Create a pending activity.
    pub fn new(
        activity_type: ActivityType,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        action: ActivityAction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            activity_type,
            severity,
            title: title.into(),
            description: description.into(),
            action,
            status: ActivityStatus::Pending,
            result: None,
            created_at: Utc::now(),
            decided_at: None,
            executed_at: None,
        }
    }

    /// Lead this activity refers to, if any.
    pub fn lead_id(&self) -> Option<LeadId> {
        self.action.lead_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_with_action_tag() {
        let action = ActivityAction::SendReEngagement { lead_id: 42 };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "SEND_RE_ENGAGEMENT");
        assert_eq!(json["leadId"], 42);
    }

    #[test]
    fn unknown_action_parses_as_unknown() {
        let parsed: ActivityAction =
            serde_json::from_str(r#"{"action": "PAUSE_CAMPAIGN", "campaignId": 3}"#).unwrap();
        assert_eq!(parsed, ActivityAction::Unknown);
        assert_eq!(parsed.lead_id(), None);
    }

    #[test]
    fn severity_scales_with_count() {
        assert_eq!(Severity::for_count(1), Severity::Low);
        assert_eq!(Severity::for_count(4), Severity::Medium);
        assert_eq!(Severity::for_count(25), Severity::High);
    }

    #[test]
    fn unresolved_statuses() {
        assert!(ActivityStatus::Pending.is_unresolved());
        assert!(ActivityStatus::Approved.is_unresolved());
        assert!(!ActivityStatus::Executed.is_unresolved());
        assert!(!ActivityStatus::Rejected.is_unresolved());
    }

    #[test]
    fn new_activity_is_pending() {
        let activity = Activity::new(
            ActivityType::ActionRequired,
            Severity::High,
            "Stale lead",
            "No activity for 15 days",
            ActivityAction::SendReEngagement { lead_id: 9 },
        );
        assert_eq!(activity.status, ActivityStatus::Pending);
        assert_eq!(activity.lead_id(), Some(9));
    }
}
