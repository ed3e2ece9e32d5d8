//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default re-engagement template, filled per lead when personalization is
/// unavailable.
pub const DEFAULT_RE_ENGAGEMENT_TEMPLATE: &str = "Hi {{firstName}}, it's been a little while since we last spoke. \
Is improving things at {{company}} still on your radar? If it helps, you can grab a time here: {{bookingLink}}";

/// Outreach core configuration.
#[derive(Debug, Clone)]
pub struct OutreachConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// JSON sequence definition loaded at startup.
    pub sequence_path: PathBuf,
    /// Cron expression (with seconds) for scheduler passes.
    pub scheduler_cron: String,
    /// Fixed interval between supervisor cycles.
    pub supervisor_interval: Duration,
    /// Leads processed concurrently within one scheduler pass.
    pub max_concurrent_leads: usize,
    pub stale_warning_days: i64,
    pub stale_critical_days: i64,
    /// Days without activity before the funnel moves a lead to LOST.
    pub inactivity_lost_days: i64,
    /// Window in which a stale-lead activity for the same lead is not repeated.
    pub stale_dedup_window: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_dedup_window: Duration,
    pub booking_link: Option<String>,
    /// Base URL for click/open tracking. Rendering is skipped when unset.
    pub tracking_base_url: Option<String>,
    pub re_engagement_template: String,
    /// Log outbound messages instead of handing them to a transport.
    pub dry_run: bool,
    /// Optional cap on EMAIL sends per UTC day.
    pub email_daily_limit: Option<u32>,
    pub http_port: u16,
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/outreach.db"),
            sequence_path: PathBuf::from("./sequence.json"),
            scheduler_cron: "0 */15 * * * *".to_string(), // every 15 minutes
            supervisor_interval: Duration::from_secs(60),
            max_concurrent_leads: 4,
            stale_warning_days: 7,
            stale_critical_days: 14,
            inactivity_lost_days: 14,
            stale_dedup_window: Duration::from_secs(24 * 3600),
            heartbeat_interval: Duration::from_secs(24 * 3600),
            heartbeat_dedup_window: Duration::from_secs(12 * 3600),
            booking_link: None,
            tracking_base_url: None,
            re_engagement_template: DEFAULT_RE_ENGAGEMENT_TEMPLATE.to_string(),
            dry_run: false,
            email_daily_limit: None,
            http_port: 8080,
        }
    }
}

impl OutreachConfig {
    /// Build from `OUTREACH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup("OUTREACH_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("OUTREACH_SEQUENCE_PATH") {
            config.sequence_path = PathBuf::from(path);
        }
        if let Some(expr) = lookup("OUTREACH_SCHEDULER_CRON") {
            cron::Schedule::from_str(&expr).map_err(|e| ConfigError::InvalidValue {
                key: "OUTREACH_SCHEDULER_CRON".into(),
                message: e.to_string(),
            })?;
            config.scheduler_cron = expr;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "OUTREACH_SUPERVISOR_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "OUTREACH_SUPERVISOR_INTERVAL_SECS".into(),
                    message: "must be greater than zero".into(),
                });
            }
            config.supervisor_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "OUTREACH_MAX_CONCURRENT_LEADS")? {
            config.max_concurrent_leads = n.max(1);
        }
        if let Some(port) = parse_var::<u16>(&lookup, "OUTREACH_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(dry_run) = parse_var::<bool>(&lookup, "OUTREACH_DRY_RUN")? {
            config.dry_run = dry_run;
        }
        config.email_daily_limit = parse_var::<u32>(&lookup, "OUTREACH_EMAIL_DAILY_LIMIT")?;
        config.booking_link = lookup("OUTREACH_BOOKING_LINK").filter(|s| !s.trim().is_empty());
        config.tracking_base_url = lookup("OUTREACH_TRACKING_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());
        if let Some(template) = lookup("OUTREACH_RE_ENGAGEMENT_TEMPLATE") {
            config.re_engagement_template = template;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
    }
}
