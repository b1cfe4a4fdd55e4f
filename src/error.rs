use thiserror::Error;

/// Failures of the persistence layer. Business refusals (declines, rate
/// limits) never travel through this type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("deadline passed before the unit of work committed")]
    DeadlineExceeded,
}

impl StoreError {
    /// Whether the backend could not be reached at all, as opposed to
    /// answering with an error about the data.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Join(_) => true,
            #[cfg(feature = "store-sqlite")]
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::NotADatabase
            ),
            #[cfg(feature = "store-redis")]
            StoreError::Redis(err) => {
                err.is_io_error() || err.is_connection_dropped() || err.is_timeout()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter backend unavailable: {0}")]
    Backend(String),
}

#[cfg(feature = "store-redis")]
impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Infrastructure failure on the charge path. Logged in full, reported to
/// callers as a generic internal error.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("charge timed out after {millis}ms")]
    Timeout { millis: u64 },
    #[error("random source unavailable: {0}")]
    Entropy(String),
}
