//! Lead data model: the lead record and the append-only logs around it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Leads are keyed by a store-assigned integer id.
pub type LeadId = i64;

/// Outreach lifecycle status of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Active,
    /// A manual touchpoint (call, LinkedIn) is waiting on a human.
    ManualTaskDue,
    /// Parked for a human to look at.
    ManualIntervention,
    Completed,
    OptedOut,
    InvalidEmail,
    MeetingBooked,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 8] = [
        Self::New,
        Self::Active,
        Self::ManualTaskDue,
        Self::ManualIntervention,
        Self::Completed,
        Self::OptedOut,
        Self::InvalidEmail,
        Self::MeetingBooked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Active => "ACTIVE",
            Self::ManualTaskDue => "MANUAL_TASK_DUE",
            Self::ManualIntervention => "MANUAL_INTERVENTION",
            Self::Completed => "COMPLETED",
            Self::OptedOut => "OPTED_OUT",
            Self::InvalidEmail => "INVALID_EMAIL",
            Self::MeetingBooked => "MEETING_BOOKED",
        }
    }

    /// Logical end states. The sequence never touches these leads again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::OptedOut | Self::InvalidEmail | Self::MeetingBooked
        )
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown lead status: {s}"))
    }
}

/// Coarse sales-pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunnelStage {
    Lead,
    Contacted,
    Engaged,
    Qualified,
    Proposal,
    Negotiation,
    Won,
    Lost,
}

impl FunnelStage {
    pub const ALL: [FunnelStage; 8] = [
        Self::Lead,
        Self::Contacted,
        Self::Engaged,
        Self::Qualified,
        Self::Proposal,
        Self::Negotiation,
        Self::Won,
        Self::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "LEAD",
            Self::Contacted => "CONTACTED",
            Self::Engaged => "ENGAGED",
            Self::Qualified => "QUALIFIED",
            Self::Proposal => "PROPOSAL",
            Self::Negotiation => "NEGOTIATION",
            Self::Won => "WON",
            Self::Lost => "LOST",
        }
    }

    /// Position in the funnel. WON and LOST share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Lead => 0,
            Self::Contacted => 1,
            Self::Engaged => 2,
            Self::Qualified => 3,
            Self::Proposal => 4,
            Self::Negotiation => 5,
            Self::Won | Self::Lost => 6,
        }
    }

    pub fn precedes(&self, other: FunnelStage) -> bool {
        self.rank() < other.rank()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }
}

impl fmt::Display for FunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunnelStage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("Unknown funnel stage: {s}"))
    }
}

/// Communication medium of a step or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Sms,
    Email,
    Call,
    Linkedin,
    Voicemail,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "SMS",
            Self::Email => "EMAIL",
            Self::Call => "CALL",
            Self::Linkedin => "LINKEDIN",
            Self::Voicemail => "VOICEMAIL",
        }
    }

    /// Whether a channel collaborator can send on this channel without a human.
    pub fn is_automatable(&self) -> bool {
        matches!(self, Self::Sms | Self::Email)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SMS" => Ok(Self::Sms),
            "EMAIL" => Ok(Self::Email),
            "CALL" => Ok(Self::Call),
            "LINKEDIN" => Ok(Self::Linkedin),
            "VOICEMAIL" => Ok(Self::Voicemail),
            _ => Err(format!("Unknown channel: {s}")),
        }
    }
}

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbound => "OUTBOUND",
            Self::Inbound => "INBOUND",
        }
    }
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OUTBOUND" => Ok(Self::Outbound),
            "INBOUND" => Ok(Self::Inbound),
            _ => Err(format!("Unknown direction: {s}")),
        }
    }
}

/// Conversational memory written by the extraction path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadMemory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_objection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buying_signals: Option<String>,
}

impl LeadMemory {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.last_objection.is_none() && self.buying_signals.is_none()
    }
}

/// A prospect moving through outreach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub city: Option<String>,
    pub product_interest: Option<String>,
    pub status: LeadStatus,
    /// Cursor into the active sequence. Never decreases.
    pub step: i64,
    pub funnel_stage: FunnelStage,
    /// Freezes funnel transitions.
    pub stage_locked: bool,
    pub stage_changed_at: Option<DateTime<Utc>>,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub memory: LeadMemory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Whether the sequence scheduler should look at this lead.
    pub fn is_schedulable(&self) -> bool {
        matches!(self.status, LeadStatus::New | LeadStatus::Active)
    }

    /// Whole days since the later of the last reply or event and the last outbound contact.
    ///
    /// `None` when the lead has never been contacted nor shown activity.
    pub fn days_inactive(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_activity_at
            .max(self.last_contacted_at)
            .map(|at| now.signed_duration_since(at).num_days().max(0))
    }

    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => format!("lead #{}", self.id),
        }
    }
}

/// Fields needed to create a lead. Everything else starts at defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLead {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub product_interest: Option<String>,
}

/// An append-only message log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub lead_id: LeadId,
    pub channel: Channel,
    pub direction: Direction,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn outbound(
        lead_id: LeadId,
        channel: Channel,
        content: impl Into<String>,
        variant: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            channel,
            direction: Direction::Outbound,
            content: content.into(),
            variant,
            classification: None,
            created_at: Utc::now(),
        }
    }

    pub fn inbound(
        lead_id: LeadId,
        channel: Channel,
        content: impl Into<String>,
        classification: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            channel,
            direction: Direction::Inbound,
            content: content.into(),
            variant: None,
            classification,
            created_at: Utc::now(),
        }
    }
}

/// Side-channel engagement signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    EmailOpen,
    LinkClick,
    EmailBounce,
    MeetingDetected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailOpen => "EMAIL_OPEN",
            Self::LinkClick => "LINK_CLICK",
            Self::EmailBounce => "EMAIL_BOUNCE",
            Self::MeetingDetected => "MEETING_DETECTED",
        }
    }
}

impl FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMAIL_OPEN" => Ok(Self::EmailOpen),
            "LINK_CLICK" => Ok(Self::LinkClick),
            "EMAIL_BOUNCE" => Ok(Self::EmailBounce),
            "MEETING_DETECTED" => Ok(Self::MeetingDetected),
            _ => Err(format!("Unknown event type: {s}")),
        }
    }
}

/// An append-only engagement event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub lead_id: LeadId,
    pub event_type: EventType,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(lead_id: LeadId, event_type: EventType, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            event_type,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit record of a funnel transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub id: Uuid,
    pub lead_id: LeadId,
    pub from_stage: FunnelStage,
    pub to_stage: FunnelStage,
    pub reason: String,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
}

/// Kind of human work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Call,
    Linkedin,
    Voicemail,
    ReviewReply,
    FollowUp,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Linkedin => "LINKEDIN",
            Self::Voicemail => "VOICEMAIL",
            Self::ReviewReply => "REVIEW_REPLY",
            Self::FollowUp => "FOLLOW_UP",
        }
    }

    /// Task type for a manual sequence step.
    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Call => Self::Call,
            Channel::Linkedin => Self::Linkedin,
            Channel::Voicemail => Self::Voicemail,
            Channel::Sms | Channel::Email => Self::FollowUp,
        }
    }
}

impl FromStr for TaskType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CALL" => Ok(Self::Call),
            "LINKEDIN" => Ok(Self::Linkedin),
            "VOICEMAIL" => Ok(Self::Voicemail),
            "REVIEW_REPLY" => Ok(Self::ReviewReply),
            "FOLLOW_UP" => Ok(Self::FollowUp),
            _ => Err(format!("Unknown task type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Done => "DONE",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "DONE" => Ok(Self::Done),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// A human-actionable item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub lead_id: LeadId,
    pub task_type: TaskType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub due_date: DateTime<Utc>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create an open task due now.
    pub fn new(lead_id: LeadId, task_type: TaskType, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            lead_id,
            task_type,
            title: title.into(),
            description: None,
            due_date: now,
            status: TaskStatus::Open,
            created_at: now,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn lead() -> Lead {
        let now = Utc::now();
        Lead {
            id: 7,
            first_name: Some("Dana".into()),
            last_name: None,
            email: None,
            phone: None,
            company: None,
            city: None,
            product_interest: None,
            status: LeadStatus::New,
            step: 0,
            funnel_stage: FunnelStage::Lead,
            stage_locked: false,
            stage_changed_at: None,
            last_contacted_at: None,
            last_activity_at: None,
            memory: LeadMemory::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_parse_and_display_agree() {
        for status in LeadStatus::ALL {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), status);
        }
        assert!("REPLIED".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(LeadStatus::OptedOut.is_terminal());
        assert!(LeadStatus::MeetingBooked.is_terminal());
        assert!(!LeadStatus::ManualTaskDue.is_terminal());
        assert!(!LeadStatus::Active.is_terminal());
    }

    #[test]
    fn funnel_order() {
        assert!(FunnelStage::Lead.precedes(FunnelStage::Contacted));
        assert!(FunnelStage::Qualified.precedes(FunnelStage::Negotiation));
        assert!(!FunnelStage::Proposal.precedes(FunnelStage::Qualified));
        assert!(!FunnelStage::Qualified.precedes(FunnelStage::Qualified));
        assert!(FunnelStage::Won.is_terminal());
        assert!(!FunnelStage::Negotiation.is_terminal());
    }

    #[test]
    fn days_inactive_counts_from_latest_touch() {
        let now = Utc::now();
        let mut lead = lead();
        assert_eq!(lead.days_inactive(now), None);

        lead.last_contacted_at = Some(now - Duration::days(2));
        assert_eq!(lead.days_inactive(now), Some(2));

        // An older reply does not hide the newer outbound contact.
        lead.last_activity_at = Some(now - Duration::days(9));
        assert_eq!(lead.days_inactive(now), Some(2));

        lead.last_activity_at = Some(now - Duration::days(1));
        assert_eq!(lead.days_inactive(now), Some(1));
    }

    #[test]
    fn only_new_and_active_are_schedulable() {
        let mut lead = lead();
        assert!(lead.is_schedulable());
        lead.status = LeadStatus::ManualTaskDue;
        assert!(!lead.is_schedulable());
        lead.status = LeadStatus::Active;
        assert!(lead.is_schedulable());
    }

    #[test]
    fn manual_channels() {
        assert!(Channel::Email.is_automatable());
        assert!(!Channel::Linkedin.is_automatable());
        assert_eq!(TaskType::for_channel(Channel::Call), TaskType::Call);
    }
}
