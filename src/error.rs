//! Error types for the chat relay

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("Channel '{0}' is stopped")]
    ChannelStopped(String),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
