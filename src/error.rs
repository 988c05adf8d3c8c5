//! Error types for the warmup orchestrator.

use std::time::Duration;

/// Configuration and pre-flight validation errors.
///
/// These are fatal for `start()` and always surface synchronously.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Plan limit exceeded for {resource}: {used} of {limit} allowed")]
    PlanLimitExceeded {
        resource: String,
        used: i64,
        limit: i64,
    },

    #[error("Instance {instance_id} has no destinations (no peers, groups or external numbers)")]
    NoDestinations { instance_id: String },

    #[error("Instance {instance_id} has no content for any allowed message type")]
    NoContent { instance_id: String },
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

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the external send API. Always transient from the loop's
/// point of view: logged, backed off, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid target identifier: {0}")]
    InvalidTarget(String),

    #[error("Content does not match message type {kind}")]
    ContentMismatch { kind: String },

    #[error("Send request for instance {instance} failed: {reason}")]
    RequestFailed { instance: String, reason: String },

    #[error("Send API rejected request for instance {instance} ({status}): {body}")]
    Rejected {
        instance: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from send API for instance {instance}: {reason}")]
    InvalidResponse { instance: String, reason: String },

    #[error("Send for instance {instance} timed out after {timeout:?}")]
    Timeout { instance: String, timeout: Duration },
}

/// Scheduler lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WarmupError {
    #[error("Warmup for instance {instance_id} is already running")]
    AlreadyRunning { instance_id: String },

    #[error("Warmup for instance {instance_id} is still stopping")]
    Stopping { instance_id: String },

    #[error("Warmup for instance {instance_id} is not running")]
    NotRunning { instance_id: String },

    #[error("Instance {instance_id} is in state {from}, cannot transition to {to}")]
    InvalidTransition {
        instance_id: String,
        from: String,
        to: String,
    },

    #[error("Instance {instance_id} is at critical health risk; analyze again before restarting")]
    CriticalRisk { instance_id: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Health analysis errors. An analysis that fails writes no snapshot.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Failed to load scoring benchmark: {0}")]
    BenchmarkLoad(String),

    #[error("Invalid benchmark: {0}")]
    InvalidBenchmark(String),

    #[error("Signal collection failed for instance {instance_id}: {reason}")]
    SignalCollection { instance_id: String, reason: String },

    #[error("Failed to persist snapshot: {0}")]
    Persist(#[from] DatabaseError),
}
