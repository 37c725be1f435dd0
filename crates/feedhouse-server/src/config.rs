//! Proxy Configuration
//!
//! One TOML file describes the whole process:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8090"
//! max_request_body_bytes = 1073741824
//!
//! [repository]
//! proxyDir = "/var/lib/feedhouse/data"
//! temp_dir = "/var/lib/feedhouse/temp"
//! home_dir = "/var/lib/feedhouse/home"
//!
//! [aggregator]
//! maxItemsPerAggregate = 1000
//! aggregationFrequency = 60000
//!
//! [forward]
//! forward_timeout_ms = 60000
//!
//! [[destinations]]
//! type = "file"
//! name = "local"
//! path = "/var/lib/feedhouse/out"
//!
//! [[destinations]]
//! type = "http"
//! name = "upstream"
//! url = "https://datafeed.example.com/datafeed"
//! required = false
//! rolling = { roll_size = 104857600, roll_period = "hour" }
//! ```
//!
//! Command-line flags and `FEEDHOUSE_*` environment variables override the bind
//! address and the repository roots.

use feedhouse_agent::AggregatorConfig;
use feedhouse_forward::{DestinationConfig, ForwardConfig};
use feedhouse_storage::{ReceiveConfig, RepositoryConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:8090)
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Largest accepted request body (default: 1 GiB)
    #[serde(default = "default_max_body")]
    pub max_request_body_bytes: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8090))
}

fn default_max_body() -> usize {
    1024 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_request_body_bytes: default_max_body(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub receive: ReceiveConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,

    /// Working area for rolling destinations (default: `<home_dir>/rolling`)
    #[serde(default)]
    pub roll_dir: Option<PathBuf>,
}

/// Values taken from the command line or environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<SocketAddr>,
    pub data_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
}

impl ProxyConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(bind) = overrides.bind {
            self.server.bind = bind;
        }
        if let Some(dir) = overrides.data_dir {
            self.repository.data_dir = dir;
        }
        if let Some(dir) = overrides.temp_dir {
            self.repository.temp_dir = dir;
        }
        if let Some(dir) = overrides.home_dir {
            self.repository.home_dir = dir;
        }
        self
    }

    pub fn roll_root(&self) -> PathBuf {
        self.roll_dir
            .clone()
            .unwrap_or_else(|| self.repository.home_dir.join("rolling"))
    }

    /// Reject settings the process cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() {
            return Err(ServerError::Config(
                "at least one destination must be configured".to_string(),
            ));
        }
        if self.server.max_request_body_bytes == 0 {
            return Err(ServerError::Config(
                "max_request_body_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedhouse_agent::PartitionBy;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [server]
        bind = "127.0.0.1:9000"

        [repository]
        proxyDir = "/srv/relay/data"

        [aggregator]
        maxFilesPerAggregate = 500
        maxAggregateAge = 30000
        partition_by = "feed"

        [[destinations]]
        type = "file"
        name = "local"
        path = "/srv/relay/out"

        [[destinations]]
        type = "http"
        name = "upstream"
        url = "http://upstream:8080/datafeed"
        required = false
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ProxyConfig::from_toml(SAMPLE).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.max_request_body_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.repository.data_dir, PathBuf::from("/srv/relay/data"));
        assert_eq!(config.aggregator.max_items_per_aggregate, 500);
        assert_eq!(config.aggregator.max_aggregate_age, Duration::from_secs(30));
        assert_eq!(config.aggregator.partition_by, PartitionBy::Feed);
        assert_eq!(config.destinations.len(), 2);
        assert!(!config.destinations[1].required());
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides_win() {
        let config = ProxyConfig::from_toml(SAMPLE).unwrap().apply(Overrides {
            bind: Some("0.0.0.0:7000".parse().unwrap()),
            home_dir: Some(PathBuf::from("/tmp/home")),
            ..Overrides::default()
        });

        assert_eq!(config.server.bind.port(), 7000);
        assert_eq!(config.repository.data_dir, PathBuf::from("/srv/relay/data"));
        assert_eq!(config.roll_root(), PathBuf::from("/tmp/home/rolling"));
    }

    #[test]
    fn test_no_destinations_rejected() {
        let config = ProxyConfig::from_toml("[server]\nbind = \"127.0.0.1:1\"").unwrap();
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_unknown_destination_type_rejected() {
        let text = r#"
            [[destinations]]
            type = "carrier-pigeon"
            name = "coo"
        "#;
        assert!(matches!(ProxyConfig::from_toml(text), Err(ServerError::Toml(_))));
    }
}
