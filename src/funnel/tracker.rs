//! Applies funnel transitions to stored leads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::funnel::machine::{FunnelEvent, FunnelStateMachine, LeadWarning};
use crate::leads::{Lead, LeadId, StageHistoryEntry};
use crate::store::Database;

pub struct FunnelTracker {
    db: Arc<dyn Database>,
    machine: FunnelStateMachine,
}

impl FunnelTracker {
    pub fn new(db: Arc<dyn Database>, machine: FunnelStateMachine) -> Self {
        Self { db, machine }
    }

    pub fn machine(&self) -> &FunnelStateMachine {
        &self.machine
    }

    /// Evaluate `event` against the lead and persist the resulting transition.
    ///
    /// Returns the history entry written, or `None` when the stage did not
    /// change or another writer moved the lead first.
    pub async fn on_event(
        &self,
        lead: &Lead,
        event: &FunnelEvent<'_>,
    ) -> Result<Option<StageHistoryEntry>, DatabaseError> {
        self.on_event_at(lead, event, Utc::now()).await
    }

    pub async fn on_event_at(
        &self,
        lead: &Lead,
        event: &FunnelEvent<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<StageHistoryEntry>, DatabaseError> {
        let Some(transition) = self.machine.apply(lead, event, now) else {
            return Ok(None);
        };

        let entry = StageHistoryEntry {
            id: Uuid::new_v4(),
            lead_id: lead.id,
            from_stage: transition.from,
            to_stage: transition.to,
            reason: transition.reason,
            confidence: transition.confidence,
            created_at: now,
        };

        if !self.db.update_lead_stage(&entry, transition.from).await? {
            debug!(
                lead_id = lead.id,
                event = event.kind(),
                "Stage changed concurrently or lead locked, transition dropped"
            );
            return Ok(None);
        }

        info!(
            lead_id = lead.id,
            from = %entry.from_stage,
            to = %entry.to_stage,
            confidence = entry.confidence,
            event = event.kind(),
            "Funnel stage changed"
        );
        Ok(Some(entry))
    }

    pub fn warning(&self, lead: &Lead, now: DateTime<Utc>) -> Option<LeadWarning> {
        self.machine.lead_warning(lead, now)
    }

    /// Freeze or unfreeze automatic transitions for a lead.
    pub async fn set_locked(&self, lead_id: LeadId, locked: bool) -> Result<(), DatabaseError> {
        self.db.set_stage_locked(lead_id, locked).await?;
        info!(lead_id, locked, "Funnel stage lock updated");
        Ok(())
    }
}
