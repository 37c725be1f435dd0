//! Error types for the aggregation agent

use feedhouse_storage::EntryRef;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Lifecycle already started")]
    AlreadyStarted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] feedhouse_storage::Error),

    #[error("Container error: {0}")]
    Container(#[from] feedhouse_core::Error),

    #[error("Forward error: {0}")]
    Forward(#[from] feedhouse_forward::ForwardError),

    #[error("Staged entry {entry} unreadable: {source}")]
    UnreadableEntry {
        entry: EntryRef,
        #[source]
        source: Box<AgentError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
