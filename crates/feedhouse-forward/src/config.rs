//! Destination configuration and forwarder construction.
//!
//! ```toml
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
//! name = "central"
//! url = "https://central.example.com/datafeed"
//! required = false
//! rolling = { roll_size = 10485760, roll_period = "hour" }
//! ```

use feedhouse_core::duration_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ForwardError, Result};
use crate::file::FileDestination;
use crate::forwarder::{ForwardTarget, Forwarder};
use crate::http::{HttpDestination, HttpSettings};
use crate::rolling::{RollingConfig, RollingDestination};
use crate::traits::Destination;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationConfig {
    File {
        name: String,
        path: PathBuf,
        #[serde(default = "default_required")]
        required: bool,
        #[serde(default)]
        rolling: Option<RollingConfig>,
    },
    Http {
        name: String,
        #[serde(default = "default_required")]
        required: bool,
        #[serde(default)]
        rolling: Option<RollingConfig>,
        #[serde(flatten)]
        settings: HttpSettings,
    },
}

fn default_required() -> bool {
    true
}

impl DestinationConfig {
    pub fn name(&self) -> &str {
        match self {
            DestinationConfig::File { name, .. } | DestinationConfig::Http { name, .. } => name,
        }
    }

    pub fn required(&self) -> bool {
        match self {
            DestinationConfig::File { required, .. } | DestinationConfig::Http { required, .. } => {
                *required
            }
        }
    }

    fn rolling(&self) -> Option<&RollingConfig> {
        match self {
            DestinationConfig::File { rolling, .. } | DestinationConfig::Http { rolling, .. } => {
                rolling.as_ref()
            }
        }
    }

    /// Build the destination, wrapped in a rolling decorator when configured.
    pub async fn build(&self, roll_root: &Path) -> Result<Arc<dyn Destination>> {
        let base: Arc<dyn Destination> = match self {
            DestinationConfig::File { name, path, .. } => {
                Arc::new(FileDestination::open(name, path.clone()).await?)
            }
            DestinationConfig::Http { name, settings, .. } => {
                Arc::new(HttpDestination::new(name, settings.clone())?)
            }
        };

        match self.rolling() {
            Some(rolling) => Ok(Arc::new(
                RollingDestination::open(base, rolling.clone(), roll_root).await?,
            )),
            None => Ok(base),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Per-destination delivery timeout (default: 60s)
    #[serde(
        default = "default_forward_timeout",
        with = "duration_ms",
        rename = "forward_timeout_ms"
    )]
    pub forward_timeout: Duration,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_forward_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            forward_timeout: default_forward_timeout(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Build a forwarder for `destinations`. Rolled parts live under `roll_root`.
pub async fn build_forwarder(
    config: &ForwardConfig,
    destinations: &[DestinationConfig],
    roll_root: &Path,
) -> Result<Forwarder> {
    if destinations.is_empty() {
        return Err(ForwardError::Config(
            "at least one destination must be configured".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(destinations.len());
    for destination in destinations {
        if !seen.insert(destination.name()) {
            return Err(ForwardError::Config(format!(
                "duplicate destination name: '{}'",
                destination.name()
            )));
        }
        let built = destination.build(roll_root).await?;
        info!(
            destination = destination.name(),
            required = destination.required(),
            rolling = destination.rolling().is_some(),
            "Destination configured"
        );
        targets.push(ForwardTarget::new(
            built,
            destination.required(),
            config.circuit_breaker.clone(),
        ));
    }

    Ok(Forwarder::new(targets, config.forward_timeout))
}
