//! Receiver
//!
//! Validates an inbound submission and stages it in the repository.
//!
//! ## Flow
//!
//! 1. Stamp receipt attributes: `ReceivedTime` (when absent), `ReceivedTimeHistory`,
//!    `GUID` (when absent), a fresh `ReceiptId`, and `RemoteAddress` from the source id.
//! 2. Pick a decoder from `Compression`:
//!    - `ZIP`: the body is a container; each entry is validated and staged
//!    - `GZIP`: a single payload, decompressed while staging
//!    - `NONE` / absent: a single raw payload
//!    - anything else: rejected with `UnknownCompression`
//! 3. Validate feed and type for each entry. A container is validated in full
//!    before any payload is written, so a rejection stages nothing.
//! 4. Commit. A failure at any point drops the staging writer, which removes every
//!    partially written file.
//!
//! ## Override Policy
//!
//! Container entries carry their own attributes. By default those win over the
//! submission's attributes; a submission sending `OverrideEmbeddedMeta: true`
//! reverses that.
//!
//! `receive` blocks and belongs on the blocking pool; `receive_bytes` hops there.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use feedhouse_core::{headers, AttributeMap, ContainerReader, FeedStatus};
use feedhouse_observability::metrics;
use flate2::read::MultiGzDecoder;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ReceiveConfig;
use crate::error::Error;
use crate::repository::{RepositoryId, RepositoryStore};

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("Feed must be specified")]
    FeedMustBeSpecified,

    #[error("Unexpected data type '{0}'")]
    UnexpectedDataType(String),

    #[error("Unknown compression '{0}'")]
    UnknownCompression(String),

    #[error("Compressed stream invalid: {0}")]
    CompressedStreamInvalid(String),

    #[error("Failed to stage submission: {0}")]
    Staging(#[from] Error),
}

impl ReceiveError {
    pub fn status(&self) -> FeedStatus {
        match self {
            ReceiveError::FeedMustBeSpecified => FeedStatus::FeedMustBeSpecified,
            ReceiveError::UnexpectedDataType(_) => FeedStatus::UnexpectedDataType,
            ReceiveError::UnknownCompression(_) => FeedStatus::UnknownCompression,
            ReceiveError::CompressedStreamInvalid(_) => FeedStatus::CompressedStreamInvalid,
            ReceiveError::Staging(_) => FeedStatus::UnknownError,
        }
    }
}

/// Acknowledgement for a staged submission.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub id: RepositoryId,
    pub receipt_id: String,
    pub entries: u32,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct Receiver {
    store: RepositoryStore,
    config: Arc<ReceiveConfig>,
}

impl Receiver {
    pub fn new(store: RepositoryStore, config: ReceiveConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &RepositoryStore {
        &self.store
    }

    /// Validate and stage a submission. Blocking.
    pub fn receive<R: Read>(
        &self,
        received_at: DateTime<Utc>,
        attributes: AttributeMap,
        source_id: &str,
        payload: R,
    ) -> Result<Receipt, ReceiveError> {
        let start = Instant::now();
        let feed = attributes
            .get_non_empty(headers::FEED)
            .unwrap_or("unknown")
            .to_string();

        let result = self.receive_inner(received_at, attributes, source_id, payload);

        let status = match &result {
            Ok(_) => FeedStatus::Ok,
            Err(e) => e.status(),
        };
        metrics::RECEIVE_REQUESTS_TOTAL
            .with_label_values(&[&feed, status.as_label()])
            .inc();
        metrics::RECEIVE_LATENCY.observe(start.elapsed().as_secs_f64());

        match &result {
            Ok(receipt) => {
                metrics::RECEIVE_BYTES_TOTAL
                    .with_label_values(&[&feed])
                    .inc_by(receipt.bytes);
                debug!(
                    feed = %feed,
                    source = %source_id,
                    id = %receipt.id,
                    entries = receipt.entries,
                    bytes = receipt.bytes,
                    "Submission staged"
                );
            }
            Err(ReceiveError::Staging(e)) => {
                warn!(feed = %feed, source = %source_id, error = %e, "Failed to stage submission");
            }
            Err(e) => {
                debug!(feed = %feed, source = %source_id, status = %e.status(), error = %e, "Submission rejected");
            }
        }
        result
    }

    /// Stage an in-memory body on the blocking pool.
    pub async fn receive_bytes(
        &self,
        received_at: DateTime<Utc>,
        attributes: AttributeMap,
        source_id: String,
        body: Bytes,
    ) -> Result<Receipt, ReceiveError> {
        let receiver = self.clone();
        tokio::task::spawn_blocking(move || {
            receiver.receive(received_at, attributes, &source_id, io::Cursor::new(body))
        })
        .await
        .map_err(|e| ReceiveError::Staging(Error::Join(e)))?
    }

    fn receive_inner<R: Read>(
        &self,
        received_at: DateTime<Utc>,
        mut attributes: AttributeMap,
        source_id: &str,
        payload: R,
    ) -> Result<Receipt, ReceiveError> {
        let receipt_id = stamp(&mut attributes, received_at, source_id);

        let compression = attributes
            .get_non_empty(headers::COMPRESSION)
            .map(|c| c.to_ascii_uppercase());
        attributes.remove(headers::COMPRESSION);

        let (id, entries, bytes) = match compression.as_deref() {
            Some(headers::COMPRESSION_ZIP) => self.receive_container(attributes, payload)?,
            Some(headers::COMPRESSION_GZIP) => {
                self.receive_single(attributes, MultiGzDecoder::new(payload))?
            }
            None | Some(headers::COMPRESSION_NONE) => self.receive_single(attributes, payload)?,
            Some(other) => return Err(ReceiveError::UnknownCompression(other.to_string())),
        };

        Ok(Receipt {
            id,
            receipt_id,
            entries,
            bytes,
        })
    }

    fn receive_single<R: Read>(
        &self,
        attributes: AttributeMap,
        payload: R,
    ) -> Result<(RepositoryId, u32, u64), ReceiveError> {
        let attributes = self.validate(attributes)?;

        let mut writer = self.store.begin()?;
        let mut tracked = TrackedReader::new(payload);
        let bytes = writer
            .add_entry(&attributes, &mut tracked)
            .map_err(|e| tracked.classify(e))?;
        let id = writer.commit()?;
        Ok((id, 1, bytes))
    }

    fn receive_container<R: Read>(
        &self,
        submission: AttributeMap,
        mut payload: R,
    ) -> Result<(RepositoryId, u32, u64), ReceiveError> {
        let override_embedded = submission
            .get(headers::OVERRIDE_EMBEDDED_META)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        // The zip index sits at the end, so spool the body before reading it.
        let mut spool = self.store.scratch_file("spool")?;
        io::copy(&mut payload, spool.file_mut()).map_err(Error::Io)?;

        let mut reader = ContainerReader::new(spool.reopen()?).map_err(invalid_stream)?;
        if reader.is_empty() {
            return Err(ReceiveError::CompressedStreamInvalid(
                "container holds no entries".to_string(),
            ));
        }

        let mut merged = Vec::with_capacity(reader.len());
        for index in 0..reader.len() {
            let mut entry = reader.read_attributes(index).map_err(invalid_stream)?;
            entry.merge_from(&submission, override_embedded);
            entry.remove(headers::COMPRESSION);
            merged.push(self.validate(entry)?);
        }

        let mut writer = self.store.begin()?;
        for (index, attributes) in merged.iter().enumerate() {
            let data = reader.data_reader(index).map_err(invalid_stream)?;
            let mut tracked = TrackedReader::new(data);
            writer
                .add_entry(attributes, &mut tracked)
                .map_err(|e| tracked.classify(e))?;
        }

        let entries = writer.entry_count();
        let bytes = writer.bytes_written();
        let id = writer.commit()?;
        Ok((id, entries, bytes))
    }

    /// Check feed and resolve type, returning the attributes to stage.
    fn validate(&self, mut attributes: AttributeMap) -> Result<AttributeMap, ReceiveError> {
        let feed = attributes
            .get_non_empty(headers::FEED)
            .ok_or(ReceiveError::FeedMustBeSpecified)?
            .to_string();

        let data_type = attributes
            .get_non_empty(headers::TYPE)
            .unwrap_or_else(|| self.config.type_for_feed(&feed))
            .to_string();
        if !self.config.accepts_type(&data_type) {
            return Err(ReceiveError::UnexpectedDataType(data_type));
        }

        attributes.insert(headers::FEED, feed);
        attributes.insert(headers::TYPE, data_type);
        Ok(attributes)
    }
}

/// Add receipt attributes, returning the receipt id.
fn stamp(attributes: &mut AttributeMap, received_at: DateTime<Utc>, source_id: &str) -> String {
    if attributes.get_non_empty(headers::RECEIVED_TIME).is_none() {
        attributes.put_date_time(headers::RECEIVED_TIME, received_at);
    }
    attributes.append_date_time(headers::RECEIVED_TIME_HISTORY, received_at);

    if attributes.get_non_empty(headers::GUID).is_none() {
        attributes.insert(headers::GUID, Uuid::new_v4().to_string());
    }
    if !source_id.is_empty() && attributes.get_non_empty(headers::REMOTE_ADDRESS).is_none() {
        attributes.insert(headers::REMOTE_ADDRESS, source_id);
    }

    let receipt_id = Uuid::new_v4().to_string();
    attributes.insert(headers::RECEIPT_ID, &receipt_id);
    receipt_id
}

fn invalid_stream(e: feedhouse_core::Error) -> ReceiveError {
    ReceiveError::CompressedStreamInvalid(e.to_string())
}

/// Remembers whether a copy failed on the read side, which means the sender's
/// stream was bad rather than the local disk.
struct TrackedReader<R> {
    inner: R,
    read_failed: bool,
}

impl<R: Read> TrackedReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            read_failed: false,
        }
    }

    fn classify(&self, e: Error) -> ReceiveError {
        if self.read_failed {
            ReceiveError::CompressedStreamInvalid(e.to_string())
        } else {
            ReceiveError::Staging(e)
        }
    }
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.read_failed = true;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::repository::EntryRef;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    async fn receiver(temp: &TempDir) -> Receiver {
        let store = RepositoryStore::open(RepositoryConfig::under(temp.path()))
            .await
            .unwrap();
        Receiver::new(store, ReceiveConfig::default())
    }

    fn attrs_of(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs.iter().copied().collect()
    }

    fn zip_of(members: &[(&str, &[u8])]) -> Vec<u8> {
        use zip::write::SimpleFileOptions;
        let mut zip = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, body) in members {
            zip.start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn staged_count(receiver: &Receiver) -> usize {
        let data = &receiver.store().config().data_dir;
        feedhouse_core::dirs::list_ids_after(data, 0, usize::MAX)
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_receive_single() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let receipt = receiver
            .receive(
                Utc::now(),
                attrs_of(&[("feed", " TEST-FEED "), ("Compression", "none")]),
                "10.0.0.1",
                &b"hello"[..],
            )
            .unwrap();

        assert_eq!(receipt.entries, 1);
        assert_eq!(receipt.bytes, 5);

        let staged = receiver
            .store()
            .read_entry(EntryRef { id: receipt.id, index: 0 })
            .unwrap();
        let attrs = &staged.attributes;
        assert_eq!(attrs.get("Feed"), Some("TEST-FEED"));
        assert_eq!(attrs.get("Type"), Some("Raw Events"));
        assert_eq!(attrs.get("RemoteAddress"), Some("10.0.0.1"));
        assert_eq!(attrs.get("ReceiptId"), Some(receipt.receipt_id.as_str()));
        assert!(attrs.get("GUID").is_some());
        assert!(attrs.get("ReceivedTime").is_some());
        assert!(attrs.get("Compression").is_none());
    }

    #[tokio::test]
    async fn test_receive_missing_feed() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let err = receiver
            .receive(Utc::now(), attrs_of(&[("Feed", "  ")]), "", &b"x"[..])
            .unwrap_err();
        assert_eq!(err.status(), FeedStatus::FeedMustBeSpecified);
        assert_eq!(staged_count(&receiver), 0);
    }

    #[tokio::test]
    async fn test_receive_unexpected_type() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let err = receiver
            .receive(
                Utc::now(),
                attrs_of(&[("Feed", "F"), ("Type", "Spreadsheet")]),
                "",
                &b"x"[..],
            )
            .unwrap_err();
        assert_eq!(err.status(), FeedStatus::UnexpectedDataType);
    }

    #[tokio::test]
    async fn test_receive_unknown_compression() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let err = receiver
            .receive(
                Utc::now(),
                attrs_of(&[("Feed", "F"), ("Compression", "BZIP9")]),
                "",
                &b"x"[..],
            )
            .unwrap_err();
        assert_eq!(err.status(), FeedStatus::UnknownCompression);
    }

    #[tokio::test]
    async fn test_receive_gzip() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let body = encoder.finish().unwrap();

        let receipt = receiver
            .receive(
                Utc::now(),
                attrs_of(&[("Feed", "F"), ("Compression", "gzip")]),
                "",
                &body[..],
            )
            .unwrap();
        assert_eq!(receipt.bytes, 18);

        let mut data = String::new();
        receiver
            .store()
            .open_entry_data(EntryRef { id: receipt.id, index: 0 })
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert_eq!(data, "compressed payload");
    }

    #[tokio::test]
    async fn test_receive_corrupt_gzip_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let err = receiver
            .receive(
                Utc::now(),
                attrs_of(&[("Feed", "F"), ("Compression", "GZIP")]),
                "",
                &b"definitely not gzip"[..],
            )
            .unwrap_err();

        assert_eq!(err.status(), FeedStatus::CompressedStreamInvalid);
        assert_eq!(staged_count(&receiver), 0);
        let temp_dir = &receiver.store().config().temp_dir;
        assert_eq!(fs::read_dir(temp_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_receive_container() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let body = zip_of(&[
            ("0.meta", b"Feed:FEED-A\nSystem:embedded\n"),
            ("0.dat", b"first"),
            ("1.meta", b"Feed:FEED-B\n"),
            ("1.dat", b"second"),
        ]);
        let receipt = receiver
            .receive(
                Utc::now(),
                attrs_of(&[("Compression", "ZIP"), ("System", "header")]),
                "",
                &body[..],
            )
            .unwrap();

        assert_eq!(receipt.entries, 2);
        let first = receiver
            .store()
            .read_entry(EntryRef { id: receipt.id, index: 0 })
            .unwrap();
        assert_eq!(first.attributes.get("Feed"), Some("FEED-A"));
        assert_eq!(first.attributes.get("System"), Some("embedded"));

        let second = receiver
            .store()
            .read_entry(EntryRef { id: receipt.id, index: 1 })
            .unwrap();
        assert_eq!(second.attributes.get("Feed"), Some("FEED-B"));
        assert_eq!(second.attributes.get("System"), Some("header"));
        assert_eq!(second.data_size, 6);
    }

    #[tokio::test]
    async fn test_receive_container_override_embedded() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let body = zip_of(&[("0.meta", b"Feed:EMBEDDED\n"), ("0.dat", b"x")]);
        let receipt = receiver
            .receive(
                Utc::now(),
                attrs_of(&[
                    ("Compression", "ZIP"),
                    ("Feed", "HEADER"),
                    ("OverrideEmbeddedMeta", "true"),
                ]),
                "",
                &body[..],
            )
            .unwrap();

        let entry = receiver
            .store()
            .read_entry(EntryRef { id: receipt.id, index: 0 })
            .unwrap();
        assert_eq!(entry.attributes.get("Feed"), Some("HEADER"));
    }

    #[tokio::test]
    async fn test_receive_container_rejects_whole_submission() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let body = zip_of(&[
            ("0.meta", b"Feed:OK\n"),
            ("0.dat", b"x"),
            ("1.meta", b"Type:Raw Events\n"),
            ("1.dat", b"y"),
        ]);
        let err = receiver
            .receive(Utc::now(), attrs_of(&[("Compression", "ZIP")]), "", &body[..])
            .unwrap_err();

        assert_eq!(err.status(), FeedStatus::FeedMustBeSpecified);
        assert_eq!(staged_count(&receiver), 0);
    }

    #[tokio::test]
    async fn test_receive_container_unpaired_member() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let body = zip_of(&[("0.meta", b"Feed:F\n")]);
        let err = receiver
            .receive(Utc::now(), attrs_of(&[("Compression", "ZIP")]), "", &body[..])
            .unwrap_err();
        assert_eq!(err.status(), FeedStatus::CompressedStreamInvalid);

        let err = receiver
            .receive(Utc::now(), attrs_of(&[("Compression", "ZIP")]), "", &b"garbage"[..])
            .unwrap_err();
        assert_eq!(err.status(), FeedStatus::CompressedStreamInvalid);

        let temp_dir = &receiver.store().config().temp_dir;
        assert_eq!(fs::read_dir(temp_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_receive_bytes_async() {
        let temp = TempDir::new().unwrap();
        let receiver = receiver(&temp).await;

        let receipt = receiver
            .receive_bytes(
                Utc::now(),
                attrs_of(&[("Feed", "F")]),
                "client".to_string(),
                Bytes::from_static(b"body"),
            )
            .await
            .unwrap();
        assert_eq!(receipt.bytes, 4);
    }
}
