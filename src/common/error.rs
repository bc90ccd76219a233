//! Error types for shardalloc

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Routing Errors ===
    /// A routing invariant was broken. Always a bug in the caller, never bad input.
    #[error("Routing invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Coordinator Errors ===
    /// The writer task is gone, either shut down or stopped on a fatal error.
    #[error("Coordinator is shut down")]
    CoordinatorClosed,

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Fatal errors mean the routing state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvariantViolation(_) | Error::Internal(_))
    }

    /// The same error for another caller. A config loading error is
    /// carried over by message.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::InvariantViolation(msg) => Error::InvariantViolation(msg.clone()),
            Error::IndexNotFound(name) => Error::IndexNotFound(name.clone()),
            Error::ShardNotFound(id) => Error::ShardNotFound(id.clone()),
            Error::IndexAlreadyExists(name) => Error::IndexAlreadyExists(name.clone()),
            Error::InvalidConfig(msg) => Error::InvalidConfig(msg.clone()),
            Error::Config(e) => Error::InvalidConfig(e.to_string()),
            Error::CoordinatorClosed => Error::CoordinatorClosed,
            Error::Internal(msg) => Error::Internal(msg.clone()),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::CoordinatorClosed
    }
}
