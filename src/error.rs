//! Error types for plugin-runner operations.
//!
//! Errors are split by blast radius:
//! - Job-scoped: [`TransformError`] and the execution outcomes reported by the
//!   worker pool. These are settled through the retry/backoff path and never
//!   escape the orchestrator.
//! - Infrastructure-scoped: [`StoreError`], [`LockError`]. These propagate to
//!   the orchestrator state machine.
//! - Process-scoped: [`ConfigError`], [`PoolError`], [`OrchestratorError`].

use std::time::Duration;

use thiserror::Error;

/// Errors raised while instrumenting untrusted plugin source.
///
/// Always fatal for the job that carries the source: retrying a syntax
/// error cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("unterminated string literal starting at {line}:{col}")]
    UnterminatedString { line: u32, col: u32 },

    #[error("unterminated template literal starting at {line}:{col}")]
    UnterminatedTemplate { line: u32, col: u32 },

    #[error("unterminated block comment starting at {line}:{col}")]
    UnterminatedComment { line: u32, col: u32 },

    #[error("unterminated regular expression literal starting at {line}:{col}")]
    UnterminatedRegex { line: u32, col: u32 },

    #[error("unexpected character {ch:?} at {line}:{col}")]
    UnexpectedCharacter { ch: char, line: u32, col: u32 },

    #[error("mismatched delimiter at {line}:{col}: expected '{expected}', found '{found}'")]
    UnbalancedDelimiter {
        expected: char,
        found: char,
        line: u32,
        col: u32,
    },

    #[error("unclosed '{delimiter}' opened at {line}:{col}")]
    UnclosedDelimiter { delimiter: char, line: u32, col: u32 },

    #[error("malformed {construct} at {line}:{col}: {reason}")]
    MalformedConstruct {
        construct: &'static str,
        reason: String,
        line: u32,
        col: u32,
    },

    #[error("identifier '{name}' at {line}:{col} uses the reserved '__sbx' prefix")]
    ReservedIdentifier { name: String, line: u32, col: u32 },
}

/// Errors that can occur in the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or refused the operation.
    /// Transient: callers retry with backoff.
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    /// A persisted row could not be decoded into a job.
    #[error("corrupt job record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Query failed for a non-transient reason (constraint, syntax).
    #[error("job store query failed: {0}")]
    Query(String),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db) if is_transient_sqlstate(db.code().as_deref()) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// SQLSTATE classes that indicate the server, not the statement, is at fault:
/// 08 connection exception, 53 insufficient resources, 57 operator intervention,
/// 40001/40P01 serialization failure and deadlock.
fn is_transient_sqlstate(code: Option<&str>) -> bool {
    match code {
        Some(code) => {
            code.starts_with("08")
                || code.starts_with("53")
                || code.starts_with("57")
                || code == "40001"
                || code == "40P01"
        }
        None => false,
    }
}

/// Errors that can occur during schema migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration '{name}' failed: {reason}")]
    MigrationFailed { name: String, reason: String },
}

/// Errors that can occur talking to the lock backing store.
///
/// Losing the lock is not an error: `renew` returns `Ok(false)` for that.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

impl LockError {
    pub fn is_transient(&self) -> bool {
        match self {
            LockError::Unavailable(_) => true,
            LockError::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
        }
    }
}

/// Errors that can occur in the worker pool itself (not in the tasks it runs).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("execution unit for slot {slot} could not be created: {reason}")]
    UnitCreation { slot: usize, reason: String },

    #[error("pool capacity must be greater than zero")]
    ZeroCapacity,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop an orchestrator run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid orchestrator transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("orchestrator instances are single-use; build a new one to run again")]
    AlreadyStarted,

    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("plugin '{task_kind}' could not be loaded from {path}: {reason}")]
    PluginLoad {
        task_kind: String,
        path: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

/// Failure reasons attached to a job when it is settled, persisted as
/// `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    #[error("ExecutionTimeoutError: budget of {budget:?} exceeded")]
    ExecutionTimeout { budget: Duration },

    #[error("ExecutionUnitCrash: {0}")]
    ExecutionUnitCrash(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("TransformError: {0}")]
    Transform(TransformError),

    #[error("no plugin registered for task kind '{0}'")]
    UnknownTaskKind(String),
}

impl JobFailure {
    /// Returns whether the failure may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobFailure::Transform(_) | JobFailure::UnknownTaskKind(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_error_names_construct() {
        let err = TransformError::MalformedConstruct {
            construct: "for loop",
            reason: "expected '(' after 'for'".to_string(),
            line: 3,
            col: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("for loop"));
        assert!(msg.contains("3:5"));
    }

    #[test]
    fn test_store_error_transience() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::Query("syntax".into()).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_transient_sqlstates() {
        assert!(is_transient_sqlstate(Some("08006")));
        assert!(is_transient_sqlstate(Some("40P01")));
        assert!(!is_transient_sqlstate(Some("23505")));
        assert!(!is_transient_sqlstate(None));
    }

    #[test]
    fn test_job_failure_retryability() {
        let timeout = JobFailure::ExecutionTimeout {
            budget: Duration::from_millis(50),
        };
        assert!(timeout.is_retryable());
        assert!(JobFailure::ExecutionUnitCrash("oom".into()).is_retryable());
        assert!(JobFailure::Handler("boom".into()).is_retryable());
        assert!(!JobFailure::UnknownTaskKind("x".into()).is_retryable());

        let transform = JobFailure::Transform(TransformError::UnterminatedString { line: 1, col: 1 });
        assert!(!transform.is_retryable());
        assert!(transform.to_string().starts_with("TransformError"));
    }
}
