//! Persistence layer: libSQL-backed storage for leads, logs, activities and tasks.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, DispatchRecord, LeadCounts};
