//! Checker error types and utilities

use thiserror::Error;

/// Errors surfaced by the checker core
#[derive(Error, Debug)]
pub enum CheckerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot connect to the shared store: {0}")]
    StoreUnreachable(String),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Invalid notification line {0:?}")]
    Notification(String),

    #[error("Suspect subscription closed")]
    SubscriptionClosed,

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checker-specific result type
pub type Result<T> = std::result::Result<T, CheckerError>;
