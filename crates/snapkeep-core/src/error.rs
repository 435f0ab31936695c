use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapkeepError>;

#[derive(Debug, Error)]
pub enum SnapkeepError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid path: '{0}' does not exist")]
    InvalidPath(String),

    #[error("backend initialization failed: {0}")]
    BackendInit(String),

    #[error("backend I/O error: {0}")]
    BackendIo(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl SnapkeepError {
    /// True when the error reports an absent entity, regardless of which
    /// layer produced it.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SnapkeepError::NotFound(_) | SnapkeepError::Database(rusqlite::Error::QueryReturnedNoRows)
        )
    }
}
