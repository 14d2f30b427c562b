use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("extraction error from {source_name}: {details}")]
    Extraction { source_name: String, details: String },

    #[error("query rejected by the database engine (code {code})")]
    QueryRejected { code: i32 },

    #[error("no query configured for this slot")]
    QueryNotConfigured,

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("forwarding error: {0}")]
    Forward(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures worth retrying. Classified failures such as
    /// `QueryRejected` already carry a definite answer and are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Io(_) | Error::Forward(_))
    }
}
