pub mod attributes;
pub mod container;
pub mod dirs;
pub mod duration_ms;
pub mod error;
pub mod headers;
pub mod status;

pub use attributes::AttributeMap;
pub use container::{ContainerEntry, ContainerReader, ContainerWriter};
pub use error::{Error, Result};
pub use status::FeedStatus;
