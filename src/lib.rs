//! Outreach: multi-channel sales sequence core.

pub mod api;
pub mod app;
pub mod channels;
pub mod config;
pub mod error;
pub mod funnel;
pub mod inbound;
pub mod leads;
pub mod llm;
pub mod monitors;
pub mod sequence;
pub mod store;
pub mod supervisor;
