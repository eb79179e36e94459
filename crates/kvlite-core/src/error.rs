//! Error types for kvlite

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Store is closed")]
    Closed,

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for CacheError {
    fn from(e: config::ConfigError) -> Self {
        CacheError::Config(e.to_string())
    }
}
