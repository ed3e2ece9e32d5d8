//! Wiring: builds every service from config, a store and the external
//! collaborators.

use std::sync::Arc;

use axum::Router;

use crate::api::{ApiState, api_routes};
use crate::channels::{ChannelSenders, DailySendLimit, DryRunSender, NoRateLimit, RateLimiter};
use crate::config::OutreachConfig;
use crate::funnel::{FunnelStateMachine, FunnelTracker, SentimentRules, Thresholds};
use crate::inbound::InboundProcessor;
use crate::leads::Channel;
use crate::llm::{DisabledLanguageModel, LanguageModelService};
use crate::monitors::{BookingMonitor, DeliveryFailureMonitor, IdleMonitor};
use crate::sequence::{ContentResolver, Dispatcher, SequenceDefinition, SequenceScheduler};
use crate::store::Database;
use crate::supervisor::{ActionExecutor, Supervisor, SupervisorSettings};

/// External collaborators the core consumes.
pub struct Collaborators {
    pub llm: Arc<dyn LanguageModelService>,
    pub senders: ChannelSenders,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub failures: Arc<dyn DeliveryFailureMonitor>,
    pub bookings: Arc<dyn BookingMonitor>,
}

impl Collaborators {
    /// Defaults for a build without transports or a model provider: dry-run
    /// senders when `dry_run` is set, the configured daily EMAIL cap, idle
    /// monitors and no language model.
    pub fn from_config(config: &OutreachConfig) -> Self {
        let mut senders = ChannelSenders::new();
        if config.dry_run {
            senders = senders
                .with_sender(Channel::Sms, Arc::new(DryRunSender::new(Channel::Sms)))
                .with_sender(Channel::Email, Arc::new(DryRunSender::new(Channel::Email)));
        }
        let rate_limiter: Arc<dyn RateLimiter> = match config.email_daily_limit {
            Some(limit) => Arc::new(DailySendLimit::new(limit)),
            None => Arc::new(NoRateLimit),
        };
        Self {
            llm: Arc::new(DisabledLanguageModel),
            senders,
            rate_limiter,
            failures: Arc::new(IdleMonitor),
            bookings: Arc::new(IdleMonitor),
        }
    }
}

/// All core services, sharing one store.
pub struct Outreach {
    pub db: Arc<dyn Database>,
    pub funnel: Arc<FunnelTracker>,
    pub scheduler: Arc<SequenceScheduler>,
    pub supervisor: Arc<Supervisor>,
    pub executor: Arc<ActionExecutor>,
    pub inbound: Arc<InboundProcessor>,
}

impl Outreach {
    pub fn new(
        config: &OutreachConfig,
        db: Arc<dyn Database>,
        sequence: SequenceDefinition,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            llm,
            senders,
            rate_limiter,
            failures,
            bookings,
        } = collaborators;

        let machine = FunnelStateMachine::new(
            SentimentRules::default_rules(),
            Thresholds {
                warning_days: config.stale_warning_days,
                critical_days: config.stale_critical_days,
                lost_days: config.inactivity_lost_days,
            },
        );
        let funnel = Arc::new(FunnelTracker::new(Arc::clone(&db), machine));

        let content = Arc::new(ContentResolver::new(
            Arc::clone(&db),
            Arc::clone(&llm),
            config.booking_link.clone(),
            config.tracking_base_url.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(senders, rate_limiter));

        let scheduler = Arc::new(SequenceScheduler::new(
            Arc::clone(&db),
            Arc::new(sequence),
            Arc::clone(&content),
            Arc::clone(&dispatcher),
            Arc::clone(&funnel),
            config.max_concurrent_leads,
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&db),
            Arc::clone(&funnel),
            failures,
            bookings,
            SupervisorSettings::from(config),
        ));
        let executor = Arc::new(ActionExecutor::new(
            Arc::clone(&db),
            Arc::clone(&llm),
            content,
            dispatcher,
            config.re_engagement_template.clone(),
        ));
        let inbound = Arc::new(InboundProcessor::new(
            Arc::clone(&db),
            llm,
            Arc::clone(&funnel),
        ));

        Self {
            db,
            funnel,
            scheduler,
            supervisor,
            executor,
            inbound,
        }
    }

    pub fn router(&self) -> Router {
        api_routes(ApiState {
            db: Arc::clone(&self.db),
            scheduler: Arc::clone(&self.scheduler),
            supervisor: Arc::clone(&self.supervisor),
            executor: Arc::clone(&self.executor),
            inbound: Arc::clone(&self.inbound),
            funnel: Arc::clone(&self.funnel),
        })
    }
}
