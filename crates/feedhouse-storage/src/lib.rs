//! Feedhouse Storage
//!
//! Durable staging for the relay: the receiver validates submissions and writes
//! them to the repository, where the aggregator later picks them up.
//!
//! ## Architecture
//!
//! ```text
//! HTTP body ──► Receiver ──► StagingWriter ──► temp/<uuid>/
//!                 │                               │ rename (commit)
//!                 │ reject (406/400)              ▼
//!                 ▼                          data/<depth>/<bucket>/<id>/
//!              submitter                          │
//!                                                 ▼
//!                                    list_ready ─► aggregator
//!                                    mark_forwarded / quarantine
//! ```
//!
//! ## Guarantees
//!
//! - A submission is either fully visible under `data/` or absent. The rename out
//!   of `temp/` is the only commit point.
//! - Ids are strictly increasing across restarts: `open()` recovers the highest
//!   committed id by scanning the numbered directories.
//! - A scan never passes an id that has been allocated but not yet renamed.
//! - Entries are removed only through `mark_forwarded`, after delivery.

pub mod config;
pub mod error;
pub mod receiver;
pub mod repository;

pub use config::{ReceiveConfig, RepositoryConfig};
pub use error::{Error, Result};
pub use receiver::{Receipt, ReceiveError, Receiver};
pub use repository::{
    EntryRef, ReadyBatch, RepositoryId, RepositoryStore, ScratchFile, StagedEntry, StagingWriter,
};
