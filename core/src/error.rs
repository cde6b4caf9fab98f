use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("timed out: {0}")]
    Timeout(String),
}
