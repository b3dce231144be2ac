use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("backend rejected request: http {status}; body={body}")]
    Rejected { status: u16, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("change feed unavailable: {0}")]
    Subscription(String),
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}
