//! Supervisor: activity model, the periodic watch cycle and the executor for
//! approved actions.

pub mod activity;
pub mod brain;
pub mod executor;

pub use activity::{Activity, ActivityAction, ActivityStatus, ActivityType, Severity};
pub use brain::{CycleOutcome, CycleReport, Supervisor, SupervisorHandle, SupervisorSettings};
pub use executor::{ActionExecutor, Decision};
