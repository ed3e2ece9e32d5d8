//! Funnel stage state machine.
//!
//! Pure: given a lead snapshot, an event and the current time it returns the
//! transition to apply, if any. Persistence lives in the tracker.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::funnel::rules::{Sentiment, SentimentRules, mentions_proposal};
use crate::leads::{FunnelStage, Lead};

/// What happened to the lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelEvent<'a> {
    OutboundMessage { content: &'a str },
    InboundMessage { content: &'a str },
    /// Periodic check with no message attached; only the time rule applies.
    InactivityCheck,
}

impl FunnelEvent<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OutboundMessage { .. } => "OUTBOUND_MESSAGE",
            Self::InboundMessage { .. } => "INBOUND_MESSAGE",
            Self::InactivityCheck => "INACTIVITY_CHECK",
        }
    }
}

/// A stage change to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: FunnelStage,
    pub to: FunnelStage,
    pub confidence: u8,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningLevel {
    Warning,
    Critical,
}

impl fmt::Display for WarningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        })
    }
}

/// Staleness descriptor used by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadWarning {
    pub level: WarningLevel,
    pub days_inactive: i64,
    pub message: String,
}

/// Day thresholds for the time-based rules.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warning_days: i64,
    pub critical_days: i64,
    pub lost_days: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_days: 7,
            critical_days: 14,
            lost_days: 14,
        }
    }
}

pub struct FunnelStateMachine {
    sentiment: SentimentRules,
    thresholds: Thresholds,
}

impl Default for FunnelStateMachine {
    fn default() -> Self {
        Self::new(SentimentRules::default_rules(), Thresholds::default())
    }
}

impl FunnelStateMachine {
    pub fn new(sentiment: SentimentRules, thresholds: Thresholds) -> Self {
        Self {
            sentiment,
            thresholds,
        }
    }

    /// Transition for `event`, or `None` when the stage stays put.
    ///
    /// Locked leads and WON/LOST leads never move. The inactivity rule is
    /// evaluated after the event rule and overrides it.
    pub fn apply(
        &self,
        lead: &Lead,
        event: &FunnelEvent<'_>,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let current = lead.funnel_stage;
        if lead.stage_locked || current.is_terminal() {
            return None;
        }

        let mut next = self.event_rule(current, event);

        if let Some(days) = lead.days_inactive(now) {
            if days >= self.thresholds.lost_days {
                next = Some((FunnelStage::Lost, 60, format!("No activity for {days} days")));
            }
        }

        let (to, confidence, reason) = next?;
        if to == current {
            return None;
        }
        Some(Transition {
            from: current,
            to,
            confidence,
            reason,
        })
    }

    fn event_rule(
        &self,
        current: FunnelStage,
        event: &FunnelEvent<'_>,
    ) -> Option<(FunnelStage, u8, String)> {
        use FunnelStage as S;

        match *event {
            FunnelEvent::OutboundMessage { content } => {
                if current == S::Lead {
                    Some((S::Contacted, 95, "First outbound contact".into()))
                } else if mentions_proposal(content) && current.precedes(S::Proposal) {
                    Some((S::Proposal, 85, "Proposal or booking sent".into()))
                } else {
                    None
                }
            }
            FunnelEvent::InboundMessage { content } => match self.sentiment.classify(content) {
                Sentiment::Negative => Some((S::Lost, 85, "Negative reply".into())),
                Sentiment::Positive(score) if score >= 2 && current.precedes(S::Qualified) => {
                    Some((
                        S::Qualified,
                        90,
                        format!("Strong positive reply (score {score})"),
                    ))
                }
                Sentiment::Positive(_) if current.precedes(S::Engaged) => {
                    Some((S::Engaged, 80, "Positive reply".into()))
                }
                Sentiment::Positive(_)
                    if !current.precedes(S::Qualified) && current.precedes(S::Negotiation) =>
                {
                    Some((S::Negotiation, 75, "Positive reply after qualification".into()))
                }
                Sentiment::Neutral if current.precedes(S::Engaged) => {
                    Some((S::Engaged, 70, "Replied".into()))
                }
                _ => None,
            },
            FunnelEvent::InactivityCheck => None,
        }
    }

    /// WARNING at `warning_days`, CRITICAL at `critical_days`; none for
    /// WON/LOST or leads with no recorded contact.
    pub fn lead_warning(&self, lead: &Lead, now: DateTime<Utc>) -> Option<LeadWarning> {
        if lead.funnel_stage.is_terminal() {
            return None;
        }
        let days = lead.days_inactive(now)?;
        if days >= self.thresholds.critical_days {
            Some(LeadWarning {
                level: WarningLevel::Critical,
                days_inactive: days,
                message: format!("No activity for {days} days - lead at risk of being lost"),
            })
        } else if days >= self.thresholds.warning_days {
            Some(LeadWarning {
                level: WarningLevel::Warning,
                days_inactive: days,
                message: format!("No activity for {days} days - consider follow-up"),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::leads::{LeadMemory, LeadStatus};

    fn lead_at(stage: FunnelStage) -> Lead {
        let now = Utc::now();
        Lead {
            id: 1,
            first_name: Some("Dana".into()),
            last_name: None,
            email: None,
            phone: None,
            company: None,
            city: None,
            product_interest: None,
            status: LeadStatus::Active,
            step: 1,
            funnel_stage: stage,
            stage_locked: false,
            stage_changed_at: None,
            last_contacted_at: Some(now),
            last_activity_at: None,
            memory: LeadMemory::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Last touched `days` before `now`, by either side.
    fn inactive(mut lead: Lead, days: i64, now: DateTime<Utc>) -> Lead {
        let at = now - Duration::days(days);
        lead.last_contacted_at = Some(at);
        lead.last_activity_at = Some(at);
        lead
    }

    fn inbound(text: &str) -> FunnelEvent<'_> {
        FunnelEvent::InboundMessage { content: text }
    }

    #[test]
    fn first_outbound_contacts_lead() {
        let m = FunnelStateMachine::default();
        let t = m
            .apply(
                &lead_at(FunnelStage::Lead),
                &FunnelEvent::OutboundMessage { content: "Hi" },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.to, FunnelStage::Contacted);
        assert_eq!(t.confidence, 95);
    }

    #[test]
    fn outbound_proposal_moves_to_proposal() {
        let m = FunnelStateMachine::default();
        let event = FunnelEvent::OutboundMessage {
            content: "Here's the proposal and a link to book a call",
        };
        let t = m
            .apply(&lead_at(FunnelStage::Engaged), &event, Utc::now())
            .unwrap();
        assert_eq!(t.to, FunnelStage::Proposal);
        assert_eq!(t.confidence, 85);

        assert!(
            m.apply(&lead_at(FunnelStage::Negotiation), &event, Utc::now())
                .is_none()
        );
    }

    #[test]
    fn negative_reply_loses_lead() {
        let m = FunnelStateMachine::default();
        let t = m
            .apply(
                &lead_at(FunnelStage::Contacted),
                &inbound("not interested, please stop"),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.to, FunnelStage::Lost);
        assert_eq!(t.confidence, 85);
    }

    #[test]
    fn positive_reply_ladder() {
        let m = FunnelStateMachine::default();
        let now = Utc::now();

        let strong = m
            .apply(
                &lead_at(FunnelStage::Contacted),
                &inbound("Yes, interested!"),
                now,
            )
            .unwrap();
        assert_eq!((strong.to, strong.confidence), (FunnelStage::Qualified, 90));

        let mild = m
            .apply(&lead_at(FunnelStage::Contacted), &inbound("yes"), now)
            .unwrap();
        assert_eq!((mild.to, mild.confidence), (FunnelStage::Engaged, 80));

        let late = m
            .apply(&lead_at(FunnelStage::Proposal), &inbound("sounds good"), now)
            .unwrap();
        assert_eq!((late.to, late.confidence), (FunnelStage::Negotiation, 75));

        assert!(
            m.apply(&lead_at(FunnelStage::Engaged), &inbound("yes"), now)
                .is_none()
        );
    }

    #[test]
    fn neutral_reply_engages_early_leads() {
        let m = FunnelStateMachine::default();
        let t = m
            .apply(
                &lead_at(FunnelStage::Contacted),
                &inbound("Who is this?"),
                Utc::now(),
            )
            .unwrap();
        assert_eq!((t.to, t.confidence), (FunnelStage::Engaged, 70));
        assert!(
            m.apply(
                &lead_at(FunnelStage::Qualified),
                &inbound("Who is this?"),
                Utc::now()
            )
            .is_none()
        );
    }

    #[test]
    fn locked_and_terminal_never_move() {
        let m = FunnelStateMachine::default();
        let now = Utc::now();
        let mut locked = inactive(lead_at(FunnelStage::Lead), 30, now);
        locked.stage_locked = true;
        assert!(
            m.apply(&locked, &FunnelEvent::OutboundMessage { content: "Hi" }, now)
                .is_none()
        );

        for stage in [FunnelStage::Won, FunnelStage::Lost] {
            let lead = inactive(lead_at(stage), 30, now);
            assert!(m.apply(&lead, &inbound("yes interested"), now).is_none());
            assert!(m.lead_warning(&lead, now).is_none());
        }
    }

    #[test]
    fn inactivity_overrides_event_rule() {
        let m = FunnelStateMachine::default();
        let now = Utc::now();
        let lead = inactive(lead_at(FunnelStage::Qualified), 16, now);
        let t = m.apply(&lead, &FunnelEvent::InactivityCheck, now).unwrap();
        assert_eq!(t.to, FunnelStage::Lost);
        assert_eq!(t.confidence, 60);
        assert_eq!(t.reason, "No activity for 16 days");

        let t = m.apply(&lead, &inbound("yes, interested"), now).unwrap();
        assert_eq!(t.to, FunnelStage::Lost);
    }

    #[test]
    fn inactivity_check_below_threshold_is_noop() {
        let m = FunnelStateMachine::default();
        let now = Utc::now();
        let lead = inactive(lead_at(FunnelStage::Contacted), 10, now);
        assert!(m.apply(&lead, &FunnelEvent::InactivityCheck, now).is_none());
    }

    #[test]
    fn recent_contact_after_old_reply_keeps_lead_alive() {
        let m = FunnelStateMachine::default();
        let now = Utc::now();
        let mut lead = lead_at(FunnelStage::Engaged);
        lead.last_activity_at = Some(now - Duration::days(20));
        lead.last_contacted_at = Some(now);

        assert!(m.apply(&lead, &FunnelEvent::InactivityCheck, now).is_none());
        assert!(m.lead_warning(&lead, now).is_none());
    }

    #[test]
    fn warning_levels() {
        let m = FunnelStateMachine::default();
        let now = Utc::now();

        assert!(
            m.lead_warning(&inactive(lead_at(FunnelStage::Contacted), 6, now), now)
                .is_none()
        );

        let w = m
            .lead_warning(&inactive(lead_at(FunnelStage::Contacted), 10, now), now)
            .unwrap();
        assert_eq!(w.level, WarningLevel::Warning);
        assert_eq!(w.message, "No activity for 10 days - consider follow-up");

        let c = m
            .lead_warning(&inactive(lead_at(FunnelStage::Qualified), 16, now), now)
            .unwrap();
        assert_eq!(c.level, WarningLevel::Critical);
        assert_eq!(c.days_inactive, 16);
    }

    #[test]
    fn never_contacted_lead_has_no_warning() {
        let m = FunnelStateMachine::default();
        let mut lead = lead_at(FunnelStage::Lead);
        lead.last_contacted_at = None;
        assert!(m.lead_warning(&lead, Utc::now()).is_none());
    }
}
