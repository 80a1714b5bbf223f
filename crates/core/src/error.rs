use thiserror::Error;

/// Failures raised by the persistent store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another writer holds the database lock.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("store I/O failure: {0}")]
    Io(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded (e.g. a malformed delegation context).
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Busy and I/O failures may succeed when retried; everything else is fatal
    /// for the current task.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_) | StoreError::Io(_))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may repeat the failed operation.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
