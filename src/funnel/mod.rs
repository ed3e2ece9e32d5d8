//! Sales funnel: keyword rules, the stage state machine and the persisting
//! tracker.

pub mod machine;
pub mod rules;
pub mod tracker;

pub use machine::{FunnelEvent, FunnelStateMachine, LeadWarning, Thresholds, Transition, WarningLevel};
pub use rules::{Sentiment, SentimentRules};
pub use tracker::FunnelTracker;
