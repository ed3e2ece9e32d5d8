//! Error types for the outreach core.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} is not configured")]
    NotConfigured { name: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Language-model collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Language model is not configured")]
    NotConfigured,

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// External monitor (bounce / booking scanner) errors.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor {name} is not configured")]
    NotConfigured { name: String },

    #[error("Monitor {name} scan failed: {reason}")]
    ScanFailed { name: String, reason: String },
}

/// Sequence definition errors.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("Failed to read sequence file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse sequence definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid sequence: {0}")]
    Invalid(String),
}

/// Activity execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Activity {id} not found")]
    ActivityNotFound { id: Uuid },

    #[error("Lead {id} not found")]
    LeadNotFound { id: i64 },

    #[error("Activity {id} is {status}, expected {expected}")]
    InvalidTransition {
        id: Uuid,
        status: String,
        expected: String,
    },

    #[error("Action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
