use thiserror::Error;

/// Errors that can occur within the cache subsystem.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A value could not be encoded for storage or decoded into the requested type.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The TTL does not fit in a timestamp.
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
