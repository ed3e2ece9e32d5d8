//! Leads and the logs that hang off them.

pub mod model;

pub use model::{
    Channel, Direction, Event, EventType, FunnelStage, Lead, LeadId, LeadMemory, LeadStatus,
    Message, NewLead, StageHistoryEntry, Task, TaskStatus, TaskType,
};
