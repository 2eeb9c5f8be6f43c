use carelink_core::EntityKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No transport registered for entity kind '{0}'")]
    NoTransport(EntityKind),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
