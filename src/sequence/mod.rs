//! Multi-step outreach sequences: definition, gating, A/B variants, content
//! resolution, dispatch and the periodic scheduler pass.

pub mod condition;
pub mod content;
pub mod dispatch;
pub mod model;
pub mod scheduler;
pub mod variant;

pub use condition::ConditionEvaluator;
pub use content::ContentResolver;
pub use dispatch::{DispatchResult, Dispatcher};
pub use model::{SequenceDefinition, Step, StepCondition, Variant};
pub use scheduler::{PassOutcome, PassSummary, SequenceScheduler, parse_schedule, spawn_cron_ticker};
pub use variant::{SelectedContent, VariantAssignor};
