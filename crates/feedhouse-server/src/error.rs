//! Error types for the relay process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] feedhouse_storage::Error),

    #[error("Forwarding error: {0}")]
    Forward(#[from] feedhouse_forward::ForwardError),

    #[error("Aggregation error: {0}")]
    Agent(#[from] feedhouse_agent::AgentError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
