//! HTTP Destination
//!
//! POSTs each aggregate container to a remote ingestion endpoint. The body is
//! streamed from disk; every aggregate attribute is sent as a request header,
//! together with `Compression: ZIP` so the receiving end unpacks the container.
//!
//! ## Configuration
//!
//! | Key          | Description                         | Default          |
//! |--------------|-------------------------------------|------------------|
//! | `url`        | Endpoint receiving the POST         | required         |
//! | `timeout_ms` | Whole-request timeout               | `60000`          |
//! | `user_agent` | `User-Agent` header                 | `feedhouse/<v>`  |
//! | `headers`    | Extra static headers                | none             |

use async_trait::async_trait;
use feedhouse_core::{duration_ms, headers};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{ForwardError, Result};
use crate::traits::{AggregateFile, Destination};

const ERROR_BODY_LIMIT: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub url: String,

    #[serde(default = "default_timeout", with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_user_agent() -> String {
    format!("feedhouse/{}", env!("CARGO_PKG_VERSION"))
}

pub struct HttpDestination {
    name: String,
    settings: HttpSettings,
    client: reqwest::Client,
}

impl HttpDestination {
    pub fn new(name: &str, settings: HttpSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self::with_client(name, settings, client))
    }

    /// Create with an injected client (useful for testing).
    pub fn with_client(name: &str, settings: HttpSettings, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            settings,
            client,
        }
    }

    fn request_headers(&self, aggregate: &AggregateFile) -> HeaderMap {
        let mut map = HeaderMap::new();
        let pairs = aggregate
            .attributes
            .iter()
            .chain(self.settings.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        for (key, value) in pairs {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => debug!(destination = %self.name, key, "Skipping attribute not valid as a header"),
            }
        }

        map.insert(
            HeaderName::from_static("compression"),
            HeaderValue::from_static(headers::COMPRESSION_ZIP),
        );
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/zip"));
        map
    }
}

#[async_trait]
impl Destination for HttpDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, aggregate: &AggregateFile) -> Result<()> {
        let file = tokio::fs::File::open(&aggregate.path).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .client
            .post(&self.settings.url)
            .headers(self.request_headers(aggregate))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(ForwardError::Rejected {
                destination: self.name.clone(),
                reason: format!("HTTP {}: {}", status, excerpt.trim()),
            });
        }

        debug!(
            destination = %self.name,
            url = %self.settings.url,
            items = aggregate.item_count,
            bytes = length,
            "Aggregate posted"
        );
        Ok(())
    }
}
