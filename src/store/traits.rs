//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every core component (scheduler, funnel tracker, supervisor, executor)
//! depends only on this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::{
    Event, EventType, FunnelStage, Lead, LeadId, LeadMemory, LeadStatus, Message, NewLead,
    StageHistoryEntry, Task,
};
use crate::supervisor::activity::{Activity, ActivityStatus, ActivityType};

/// Outcome of a successful dispatch, written atomically.
///
/// `expected_step` is the cursor the scheduler read; the write only lands if
/// the lead still sits at that step.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub lead_id: LeadId,
    pub expected_step: i64,
    pub new_step: i64,
    pub status: LeadStatus,
    pub contacted_at: DateTime<Utc>,
    /// Outbound message to append. `None` for manual steps.
    pub message: Option<Message>,
    /// Task for a manual step. Only written if the step advance lands.
    pub task: Option<Task>,
}

/// Lead counts per status (heartbeat summary).
#[derive(Debug, Clone, Default)]
pub struct LeadCounts {
    pub by_status: Vec<(LeadStatus, i64)>,
}

impl LeadCounts {
    pub fn total(&self) -> i64 {
        self.by_status.iter().map(|(_, n)| n).sum()
    }

    pub fn get(&self, status: LeadStatus) -> i64 {
        self.by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Backend-agnostic database trait covering leads, logs, activities and tasks.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a lead with default state (NEW, step 0, LEAD stage).
    async fn insert_lead(&self, lead: &NewLead) -> Result<Lead, DatabaseError>;

    async fn get_lead(&self, id: LeadId) -> Result<Option<Lead>, DatabaseError>;

    /// Leads whose status is one of `statuses`, oldest first.
    async fn list_leads_by_status(
        &self,
        statuses: &[LeadStatus],
    ) -> Result<Vec<Lead>, DatabaseError>;

    /// Leads still worth watching: funnel stage not WON/LOST and a
    /// non-terminal status.
    async fn list_watchable_leads(&self) -> Result<Vec<Lead>, DatabaseError>;

    /// Move the step cursor without dispatching (condition skip).
    /// Returns false if the lead is no longer at `expected_step`.
    async fn advance_lead_step(
        &self,
        id: LeadId,
        expected_step: i64,
        new_step: i64,
    ) -> Result<bool, DatabaseError>;

    /// Mark a lead COMPLETED if it still sits at `expected_step`.
    async fn complete_lead(&self, id: LeadId, expected_step: i64) -> Result<bool, DatabaseError>;

    /// Apply a dispatch outcome: status, step, last contact and the outbound
    /// message or manual task, in one transaction. Returns false on a step mismatch, in
    /// which case nothing is written.
    async fn record_dispatch(&self, record: &DispatchRecord) -> Result<bool, DatabaseError>;

    /// Append an outbound message sent outside the sequence and bump
    /// `last_contacted_at`, in one transaction.
    async fn record_direct_send(&self, message: &Message) -> Result<(), DatabaseError>;

    /// Change funnel stage if the lead is still at `expected_from`, and append
    /// the history entry, in one transaction.
    async fn update_lead_stage(
        &self,
        entry: &StageHistoryEntry,
        expected_from: FunnelStage,
    ) -> Result<bool, DatabaseError>;

    async fn update_lead_status(
        &self,
        id: LeadId,
        status: LeadStatus,
    ) -> Result<(), DatabaseError>;

    async fn set_stage_locked(&self, id: LeadId, locked: bool) -> Result<(), DatabaseError>;

    async fn touch_lead_activity(
        &self,
        id: LeadId,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Merge non-empty memory fields into the lead.
    async fn update_lead_memory(
        &self,
        id: LeadId,
        memory: &LeadMemory,
    ) -> Result<(), DatabaseError>;

    async fn count_leads_by_status(&self) -> Result<LeadCounts, DatabaseError>;

    // ── Messages & events ───────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError>;

    /// Messages for a lead, oldest first.
    async fn list_messages(&self, lead_id: LeadId) -> Result<Vec<Message>, DatabaseError>;

    async fn has_inbound_message(&self, lead_id: LeadId) -> Result<bool, DatabaseError>;

    async fn has_classified_message(
        &self,
        lead_id: LeadId,
        classification: &str,
    ) -> Result<bool, DatabaseError>;

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError>;

    async fn has_event(
        &self,
        lead_id: LeadId,
        event_type: EventType,
    ) -> Result<bool, DatabaseError>;

    // ── A/B assignments ─────────────────────────────────────────────

    async fn get_variant_assignment(
        &self,
        step_id: i64,
        lead_id: LeadId,
    ) -> Result<Option<String>, DatabaseError>;

    /// Store `variant` unless an assignment already exists; returns the
    /// variant that is stored afterwards (first writer wins).
    async fn assign_variant(
        &self,
        step_id: i64,
        lead_id: LeadId,
        variant: &str,
    ) -> Result<String, DatabaseError>;

    // ── Stage history ───────────────────────────────────────────────

    /// History for a lead, oldest first.
    async fn list_stage_history(
        &self,
        lead_id: LeadId,
    ) -> Result<Vec<StageHistoryEntry>, DatabaseError>;

    // ── Activities ──────────────────────────────────────────────────

    async fn insert_activity(&self, activity: &Activity) -> Result<(), DatabaseError>;

    async fn get_activity(&self, id: Uuid) -> Result<Option<Activity>, DatabaseError>;

    /// Activities, newest first, optionally filtered by status.
    async fn list_activities(
        &self,
        status: Option<ActivityStatus>,
        limit: usize,
    ) -> Result<Vec<Activity>, DatabaseError>;

    /// Whether an unresolved activity of `activity_type` for exactly this lead
    /// was created at or after `since`.
    async fn has_open_lead_activity(
        &self,
        lead_id: LeadId,
        activity_type: ActivityType,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Whether any activity of `activity_type` was created at or after `since`.
    async fn has_activity_since(
        &self,
        activity_type: ActivityType,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Compare-and-set the status. Stamps `decided_at` for APPROVED/REJECTED
    /// and `executed_at` for EXECUTED. Returns false if the activity was not in
    /// `from`.
    async fn transition_activity(
        &self,
        id: Uuid,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool, DatabaseError>;

    /// Record the outcome note and final status.
    async fn finish_activity(
        &self,
        id: Uuid,
        status: ActivityStatus,
        result: &str,
    ) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn list_open_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Close an open task; a lead waiting in MANUAL_TASK_DUE goes back to
    /// ACTIVE. Returns the closed task, or `None` if it was not open.
    async fn complete_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;
}
