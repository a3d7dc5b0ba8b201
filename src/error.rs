//! Error taxonomy for the reload pipeline.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered 304 for the stored validators.
    #[error("feed not modified")]
    NotModified,
    #[error("authentication required for {link}")]
    AuthRequired { link: String, realm: Option<String> },
    #[error("feed unreachable: {0}")]
    Unreachable(String),
    #[error("timed out fetching feed")]
    Timeout,
    #[error("fetch cancelled")]
    Cancelled,
    #[error("no protocol handler registered for '{0}'")]
    UnsupportedProtocol(String),
    #[error("invalid feed link '{0}'")]
    InvalidLink(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Unreachable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed feed: {0}")]
    Malformed(String),
    #[error("unsupported feed format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("commit conflict: {0}")]
    CommitConflict(String),
    #[error("store I/O failure: {0}")]
    Io(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // SQLITE_BUSY (5), SQLITE_LOCKED (6) and constraint failures (19)
            let conflict = db.is_unique_violation()
                || db.is_foreign_key_violation()
                || matches!(db.code().as_deref(), Some("5") | Some("6") | Some("19"));
            if conflict {
                return StoreError::CommitConflict(db.message().to_string());
            }
        }
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
