use thiserror::Error;

/// Errors that can occur within the queue and scheduler.
///
/// `Database` is a storage fault: the loops return it and the process exits.
/// The registration variants are startup contract violations.
#[derive(Debug, Error)]
pub enum JobsError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Job arguments could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted timestamp could not be parsed.
    #[error("Invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// A job handler with this name is already registered.
    #[error("Job already registered: {name}")]
    DuplicateJob { name: String },

    /// A schedule with this name is already registered.
    #[error("Schedule already registered: {name}")]
    DuplicateSchedule { name: String },

    /// A schedule fires a job that has no handler.
    #[error("Schedule {name} has no registered job")]
    ScheduleWithoutJob { name: String },

    /// The schedule interval is zero or too large to do arithmetic with.
    #[error("Invalid interval for schedule {name}: {reason}")]
    InvalidInterval { name: String, reason: String },

    /// A delay does not fit in a timestamp.
    #[error("Invalid delay: {0}")]
    InvalidDelay(String),
}

pub type Result<T> = std::result::Result<T, JobsError>;

/// Failure reported by a job handler.
///
/// Only ever logged by the runner; it never escapes the worker loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("cache error: {0}")]
    Cache(#[from] defidash_cache::CacheError),

    #[error("queue error: {0}")]
    Queue(#[from] JobsError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        JobError::Failed(msg.into())
    }
}
