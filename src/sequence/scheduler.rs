//! Sequence scheduler: one pass over every lead still walking the sequence.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, DatabaseError};
use crate::funnel::{FunnelEvent, FunnelTracker};
use crate::leads::{Lead, LeadId, LeadStatus, Message};
use crate::sequence::condition::ConditionEvaluator;
use crate::sequence::content::ContentResolver;
use crate::sequence::dispatch::Dispatcher;
use crate::sequence::model::{SequenceDefinition, Step};
use crate::sequence::variant::VariantAssignor;
use crate::store::{Database, DispatchRecord};

/// What happened to one lead during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadOutcome {
    Dispatched,
    /// A task was opened for a manual step.
    ManualTask,
    /// Condition did not hold; the step was consumed without sending.
    ConditionSkipped,
    Completed,
    NotDue,
    /// Nothing to do (no matching step and not past the end).
    Idle,
    /// Another writer moved the lead first.
    Stale,
    /// Dispatch failed; the same step is retried next pass.
    Failed(String),
}

/// Tally for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub leads: usize,
    pub dispatched: usize,
    pub manual_tasks: usize,
    pub condition_skipped: usize,
    pub completed: usize,
    pub not_due: usize,
    pub failed: usize,
    pub errors: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: &LeadOutcome) {
        match outcome {
            LeadOutcome::Dispatched => self.dispatched += 1,
            LeadOutcome::ManualTask => self.manual_tasks += 1,
            LeadOutcome::ConditionSkipped => self.condition_skipped += 1,
            LeadOutcome::Completed => self.completed += 1,
            LeadOutcome::NotDue => self.not_due += 1,
            LeadOutcome::Failed(_) => self.failed += 1,
            LeadOutcome::Idle | LeadOutcome::Stale => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed(PassSummary),
    /// A previous pass was still running.
    Skipped,
}

pub struct SequenceScheduler {
    db: Arc<dyn Database>,
    sequence: Arc<SequenceDefinition>,
    conditions: ConditionEvaluator,
    variants: VariantAssignor,
    content: Arc<ContentResolver>,
    dispatcher: Arc<Dispatcher>,
    funnel: Arc<FunnelTracker>,
    max_concurrent_leads: usize,
    run_lock: Mutex<()>,
}

impl SequenceScheduler {
    pub fn new(
        db: Arc<dyn Database>,
        sequence: Arc<SequenceDefinition>,
        content: Arc<ContentResolver>,
        dispatcher: Arc<Dispatcher>,
        funnel: Arc<FunnelTracker>,
        max_concurrent_leads: usize,
    ) -> Self {
        Self {
            conditions: ConditionEvaluator::new(Arc::clone(&db)),
            variants: VariantAssignor::new(Arc::clone(&db)),
            db,
            sequence,
            content,
            dispatcher,
            funnel,
            max_concurrent_leads: max_concurrent_leads.max(1),
            run_lock: Mutex::new(()),
        }
    }

    /// Run one pass unless another is in flight.
    pub async fn run_pass(&self) -> PassOutcome {
        self.run_pass_at(Utc::now()).await
    }

    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> PassOutcome {
        let Ok(_guard) = self.run_lock.try_lock() else {
            info!("Scheduler pass already running, skipping");
            return PassOutcome::Skipped;
        };

        let leads = match self
            .db
            .list_leads_by_status(&[LeadStatus::New, LeadStatus::Active])
            .await
        {
            Ok(leads) => leads,
            Err(e) => {
                error!(error = %e, "Failed to load leads for scheduler pass");
                return PassOutcome::Completed(PassSummary {
                    errors: 1,
                    ..Default::default()
                });
            }
        };

        let mut summary = PassSummary {
            leads: leads.len(),
            ..Default::default()
        };

        let results: Vec<(LeadId, Result<LeadOutcome, DatabaseError>)> =
            futures::stream::iter(leads)
                .map(|lead| async move { (lead.id, self.process_lead(&lead, now).await) })
                .buffer_unordered(self.max_concurrent_leads)
                .collect()
                .await;

        for (lead_id, result) in results {
            match result {
                Ok(outcome) => {
                    debug!(lead_id, ?outcome, "Lead processed");
                    summary.record(&outcome);
                }
                Err(e) => {
                    error!(lead_id, error = %e, "Lead processing failed");
                    summary.errors += 1;
                }
            }
        }

        info!(
            leads = summary.leads,
            dispatched = summary.dispatched,
            manual = summary.manual_tasks,
            skipped = summary.condition_skipped,
            completed = summary.completed,
            failed = summary.failed,
            errors = summary.errors,
            "Scheduler pass complete"
        );
        PassOutcome::Completed(summary)
    }

    async fn process_lead(
        &self,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> Result<LeadOutcome, DatabaseError> {
        let next = lead.step + 1;

        let Some(step) = self.sequence.step(next) else {
            if lead.step > 0 && next > self.sequence.len() as i64 {
                return Ok(if self.db.complete_lead(lead.id, lead.step).await? {
                    info!(lead_id = lead.id, "Sequence completed");
                    LeadOutcome::Completed
                } else {
                    LeadOutcome::Stale
                });
            }
            return Ok(LeadOutcome::Idle);
        };

        if !self.conditions.evaluate(step.condition.as_ref(), lead.id).await {
            return Ok(if self.db.advance_lead_step(lead.id, lead.step, next).await? {
                info!(lead_id = lead.id, step = step.id, "Step condition not met, step skipped");
                LeadOutcome::ConditionSkipped
            } else {
                LeadOutcome::Stale
            });
        }

        if !self.is_due(lead, step, now) {
            return Ok(LeadOutcome::NotDue);
        }

        let selected = self.variants.select(step, lead.id).await?;
        let text = self.content.resolve(step, lead, &selected.content).await;
        let rendered = self.content.render_for_channel(step.channel, lead, &text);

        let result = self.dispatcher.send(step.channel, lead, &rendered).await;
        if !result.success {
            let reason = result.error.unwrap_or_else(|| "unknown".to_string());
            warn!(lead_id = lead.id, step = step.id, reason = %reason, "Dispatch failed, will retry next pass");
            return Ok(LeadOutcome::Failed(reason));
        }
        let manual = result.manual;

        let record = DispatchRecord {
            lead_id: lead.id,
            expected_step: lead.step,
            new_step: next,
            status: if manual {
                LeadStatus::ManualTaskDue
            } else {
                LeadStatus::Active
            },
            contacted_at: now,
            message: (!manual).then(|| {
                Message::outbound(lead.id, step.channel, rendered.as_str(), selected.variant.clone())
            }),
            task: result.task,
        };

        if !self.db.record_dispatch(&record).await? {
            warn!(
                lead_id = lead.id,
                step = step.id,
                "Lead moved during dispatch, outcome not recorded"
            );
            return Ok(LeadOutcome::Stale);
        }

        if manual {
            return Ok(LeadOutcome::ManualTask);
        }

        // The stored lead was just contacted; evaluate the funnel against that.
        let mut contacted = lead.clone();
        contacted.step = next;
        contacted.status = LeadStatus::Active;
        contacted.last_contacted_at = Some(now);
        if let Err(e) = self
            .funnel
            .on_event_at(&contacted, &FunnelEvent::OutboundMessage { content: &text }, now)
            .await
        {
            warn!(lead_id = lead.id, error = %e, "Funnel update after dispatch failed");
        }

        Ok(LeadOutcome::Dispatched)
    }

    fn is_due(&self, lead: &Lead, step: &Step, now: DateTime<Utc>) -> bool {
        if lead.status == LeadStatus::New && self.sequence.is_first(step) {
            return true;
        }
        lead.last_contacted_at
            .is_some_and(|at| now.signed_duration_since(at).num_days() >= step.delay_days)
    }
}

/// Parse a cron expression (with seconds field) for the pass ticker.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "OUTREACH_SCHEDULER_CRON".to_string(),
        message: format!("invalid cron: {e}"),
    })
}

/// Spawn the background task that runs a pass at every cron fire time.
pub fn spawn_cron_ticker(
    scheduler: Arc<SequenceScheduler>,
    schedule: cron::Schedule,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sequence scheduler ticker started");
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Cron schedule has no upcoming fire time, ticker stopping");
                return;
            };
            let wait = next
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or_default();
            tokio::time::sleep(wait).await;
            scheduler.run_pass().await;
        }
    })
}
