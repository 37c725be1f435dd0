//! Storage Configuration
//!
//! ## RepositoryConfig
//!
//! The three roots used by the relay:
//!
//! - **data_dir**: committed submissions, scanned by the aggregator (`proxyDir`)
//! - **temp_dir**: in-flight writes before the atomic rename. Must be on the same
//!   filesystem as `data_dir`.
//! - **home_dir**: process working state (failed submissions, rolling outputs)
//!
//! ## ReceiveConfig
//!
//! Controls which data types the receiver accepts and how a missing `Type` is
//! resolved:
//!
//! - **accepted_types**: types the downstream system accepts. Empty accepts anything.
//! - **default_type**: fallback when neither the submission nor `feed_types` names one
//! - **feed_types**: per-feed default type
//!
//! ## Usage
//!
//! ```ignore
//! use feedhouse_storage::{ReceiveConfig, RepositoryConfig};
//!
//! let repo = RepositoryConfig::under("/var/lib/feedhouse");
//! let receive = ReceiveConfig {
//!     feed_types: [("REF-FEED".to_string(), "Raw Reference".to_string())].into(),
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Staging root (default: ./feedhouse/data)
    #[serde(default = "default_data_dir", alias = "proxyDir", alias = "proxy_dir")]
    pub data_dir: PathBuf,

    /// Temporary root for writes before commit (default: ./feedhouse/temp)
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Working state root (default: ./feedhouse/home)
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./feedhouse/data")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./feedhouse/temp")
}

fn default_home_dir() -> PathBuf {
    PathBuf::from("./feedhouse/home")
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            temp_dir: default_temp_dir(),
            home_dir: default_home_dir(),
        }
    }
}

impl RepositoryConfig {
    /// `data`, `temp` and `home` directories under one parent.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            temp_dir: root.join("temp"),
            home_dir: root.join("home"),
        }
    }

    /// Where unreadable submissions are moved.
    pub fn failed_dir(&self) -> PathBuf {
        self.home_dir.join("failed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Types accepted downstream (default: the standard stream types)
    #[serde(default = "default_accepted_types")]
    pub accepted_types: Vec<String>,

    /// Type used when nothing else names one (default: "Raw Events")
    #[serde(default = "default_type")]
    pub default_type: String,

    /// Per-feed default type
    #[serde(default)]
    pub feed_types: HashMap<String, String>,
}

fn default_accepted_types() -> Vec<String> {
    [
        "Raw Events",
        "Raw Reference",
        "Events",
        "Reference",
        "Context",
        "Detections",
        "Records",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_type() -> String {
    "Raw Events".to_string()
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            accepted_types: default_accepted_types(),
            default_type: default_type(),
            feed_types: HashMap::new(),
        }
    }
}

impl ReceiveConfig {
    /// Default type for `feed`.
    pub fn type_for_feed(&self, feed: &str) -> &str {
        self.feed_types
            .iter()
            .find(|(f, _)| f.eq_ignore_ascii_case(feed))
            .map(|(_, t)| t.as_str())
            .unwrap_or(&self.default_type)
    }

    pub fn accepts_type(&self, data_type: &str) -> bool {
        self.accepted_types.is_empty()
            || self
                .accepted_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(data_type))
    }
}
