//! Error Types for feedhouse-core
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! - File system operations on staged entries and numbered directories
//!
//! ### Container Errors
//! - `Zip`: The archive itself could not be read or written
//! - `UnpairedMember`: A metadata member has no payload member, or the reverse
//! - `DuplicateMember`: Two members resolve to the same entry slot
//! - `EntryOutOfRange`: An entry index past the end of the container was requested
//!
//! All fallible operations return `Result<T>`, aliased to `Result<T, Error>`, so
//! I/O and zip failures convert with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Container member '{name}' has no matching {missing} member")]
    UnpairedMember { name: String, missing: &'static str },

    #[error("Duplicate container member: {0}")]
    DuplicateMember(String),

    #[error("Container entry {0} out of range")]
    EntryOutOfRange(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
