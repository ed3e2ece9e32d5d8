//! Supervisor: the periodic cycle that watches the pipeline and proposes
//! human-gated actions.
//!
//! Each cycle runs, in order: stale-lead scan, delivery-failure scan, booking
//! scan and the heartbeat. A failing scan is logged and the rest still run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::OutreachConfig;
use crate::error::Error;
use crate::funnel::{FunnelEvent, FunnelTracker, LeadWarning, WarningLevel};
use crate::leads::Lead;
use crate::monitors::{BookingMonitor, DeliveryFailureMonitor};
use crate::store::Database;
use crate::supervisor::activity::{Activity, ActivityAction, ActivityType, Severity};

/// Timing knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub interval: Duration,
    pub stale_dedup_window: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_dedup_window: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_dedup_window: Duration::from_secs(24 * 3600),
            heartbeat_interval: Duration::from_secs(24 * 3600),
            heartbeat_dedup_window: Duration::from_secs(12 * 3600),
        }
    }
}

impl From<&OutreachConfig> for SupervisorSettings {
    fn from(config: &OutreachConfig) -> Self {
        Self {
            interval: config.supervisor_interval,
            stale_dedup_window: config.stale_dedup_window,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_dedup_window: config.heartbeat_dedup_window,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub leads_scanned: usize,
    pub stale_activities: usize,
    pub stage_changes: usize,
    pub failures_processed: u32,
    pub bookings_processed: u32,
    pub heartbeat: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The previous cycle was still running.
    Skipped,
}

pub struct Supervisor {
    db: Arc<dyn Database>,
    funnel: Arc<FunnelTracker>,
    failures: Arc<dyn DeliveryFailureMonitor>,
    bookings: Arc<dyn BookingMonitor>,
    settings: SupervisorSettings,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    run_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(
        db: Arc<dyn Database>,
        funnel: Arc<FunnelTracker>,
        failures: Arc<dyn DeliveryFailureMonitor>,
        bookings: Arc<dyn BookingMonitor>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            db,
            funnel,
            failures,
            bookings,
            settings,
            last_heartbeat: Mutex::new(None),
            run_lock: Mutex::new(()),
        }
    }

    /// Start the periodic cycle. The first cycle runs immediately.
    pub fn start(self: Arc<Self>) -> SupervisorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.settings.interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Supervisor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            info!("Supervisor stopped");
        });

        SupervisorHandle { stop_tx, join }
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        let Ok(_guard) = self.run_lock.try_lock() else {
            debug!("Supervisor cycle already running, skipping");
            return CycleOutcome::Skipped;
        };

        let mut report = CycleReport::default();

        if let Err(e) = self.scan_stale_leads(now, &mut report).await {
            error!(error = %e, "Stale-lead scan failed");
            report.errors.push(format!("stale scan: {e}"));
        }
        match self.scan_delivery_failures().await {
            Ok(processed) => report.failures_processed = processed,
            Err(e) => {
                error!(error = %e, "Delivery-failure scan failed");
                report.errors.push(format!("failure scan: {e}"));
            }
        }
        match self.scan_bookings().await {
            Ok(processed) => report.bookings_processed = processed,
            Err(e) => {
                error!(error = %e, "Booking scan failed");
                report.errors.push(format!("booking scan: {e}"));
            }
        }
        match self.heartbeat(now).await {
            Ok(logged) => report.heartbeat = logged,
            Err(e) => {
                error!(error = %e, "Heartbeat failed");
                report.errors.push(format!("heartbeat: {e}"));
            }
        }

        debug!(
            leads = report.leads_scanned,
            stale = report.stale_activities,
            moved = report.stage_changes,
            errors = report.errors.len(),
            "Supervisor cycle complete"
        );
        CycleOutcome::Completed(report)
    }

    async fn scan_stale_leads(
        &self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), Error> {
        let leads = self.db.list_watchable_leads().await?;
        report.leads_scanned = leads.len();
        let since = now - window(self.settings.stale_dedup_window);

        for lead in &leads {
            // Computed before the inactivity transition so a lead moved to
            // LOST this cycle still gets its CRITICAL activity.
            let warning = self.funnel.warning(lead, now);

            match self
                .funnel
                .on_event_at(lead, &FunnelEvent::InactivityCheck, now)
                .await
            {
                Ok(Some(_)) => report.stage_changes += 1,
                Ok(None) => {}
                Err(e) => warn!(lead_id = lead.id, error = %e, "Inactivity transition failed"),
            }

            let Some(warning) = warning else {
                continue;
            };
            match self.raise_stale_activity(lead, &warning, since).await {
                Ok(true) => report.stale_activities += 1,
                Ok(false) => {}
                Err(e) => warn!(lead_id = lead.id, error = %e, "Could not raise stale-lead activity"),
            }
        }
        Ok(())
    }

    async fn raise_stale_activity(
        &self,
        lead: &Lead,
        warning: &LeadWarning,
        since: DateTime<Utc>,
    ) -> Result<bool, Error> {
        if self
            .db
            .has_open_lead_activity(lead.id, ActivityType::ActionRequired, since)
            .await?
        {
            debug!(lead_id = lead.id, "Stale-lead activity already open");
            return Ok(false);
        }

        let severity = match warning.level {
            WarningLevel::Critical => Severity::High,
            WarningLevel::Warning => Severity::Medium,
        };
        let activity = Activity::new(
            ActivityType::ActionRequired,
            severity,
            format!("Re-engage {}", lead.display_name()),
            warning.message.clone(),
            ActivityAction::SendReEngagement { lead_id: lead.id },
        );
        self.db.insert_activity(&activity).await?;
        info!(
            lead_id = lead.id,
            level = %warning.level,
            days = warning.days_inactive,
            "Stale-lead activity raised"
        );
        Ok(true)
    }

    async fn scan_delivery_failures(&self) -> Result<u32, Error> {
        let summary = self.failures.scan().await?;
        if summary.processed > 0 {
            let activity = Activity::new(
                ActivityType::DeliveryFailures,
                Severity::for_count(summary.processed),
                format!("{} delivery failures processed", summary.processed),
                format!(
                    "Found {} failed deliveries, processed {}",
                    summary.found, summary.processed
                ),
                ActivityAction::None,
            );
            self.db.insert_activity(&activity).await?;
            info!(found = summary.found, processed = summary.processed, "Delivery failures logged");
        }
        Ok(summary.processed)
    }

    async fn scan_bookings(&self) -> Result<u32, Error> {
        let processed = self.bookings.scan().await?;
        if processed > 0 {
            let activity = Activity::new(
                ActivityType::MeetingsBooked,
                Severity::for_count(processed),
                format!("{processed} meetings booked"),
                format!("Booking monitor processed {processed} new meetings"),
                ActivityAction::None,
            );
            self.db.insert_activity(&activity).await?;
            info!(processed, "Meeting bookings logged");
        }
        Ok(processed)
    }

    /// Log a LOW system-health activity at most once per heartbeat interval,
    /// skipping if one already exists inside the dedup window.
    async fn heartbeat(&self, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut last = self.last_heartbeat.lock().await;
        if let Some(at) = *last {
            if now - at < window(self.settings.heartbeat_interval) {
                return Ok(false);
            }
        }

        let since = now - window(self.settings.heartbeat_dedup_window);
        if self
            .db
            .has_activity_since(ActivityType::SystemHealth, since)
            .await?
        {
            *last = Some(now);
            return Ok(false);
        }

        let counts = self.db.count_leads_by_status().await?;
        let breakdown = counts
            .by_status
            .iter()
            .map(|(status, n)| format!("{status}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let activity = Activity::new(
            ActivityType::SystemHealth,
            Severity::Low,
            "Daily health check",
            format!("{} leads tracked ({breakdown})", counts.total()),
            ActivityAction::None,
        );
        self.db.insert_activity(&activity).await?;
        *last = Some(now);
        info!(leads = counts.total(), "Heartbeat logged");
        Ok(true)
    }
}

fn window(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Handle to a running supervisor.
pub struct SupervisorHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the loop. An in-flight cycle finishes first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Supervisor task ended abnormally");
        }
    }
}
