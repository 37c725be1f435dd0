//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Fatal Errors
//! - `Unwritable`: A repository root cannot be created or written. The process
//!   must not start, since no durability guarantee can be honoured.
//!
//! ### Staging Errors
//! - `Io`: A write, fsync or rename failed while staging or consuming entries
//! - `EmptySubmission`: A commit was attempted with no entries
//!
//! ### Entry Errors
//! - `Core`: A staged entry or container could not be decoded
//! - `EntryNotFound`: The referenced entry no longer exists
//!
//! All storage operations return `Result<T>`, aliased to `Result<T, Error>`.

use std::path::PathBuf;
use thiserror::Error;

use crate::repository::EntryRef;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Repository root {path:?} is not writable: {source}")]
    Unwritable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Container error: {0}")]
    Core(#[from] feedhouse_core::Error),

    #[error("Progress marker error: {0}")]
    Marker(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Entry not found: {0}")]
    EntryNotFound(EntryRef),

    #[error("Cannot commit a submission with no entries")]
    EmptySubmission,
}
