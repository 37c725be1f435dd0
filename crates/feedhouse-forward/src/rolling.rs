//! Rolling Output
//!
//! Wraps another destination and batches aggregates into larger rolled outputs.
//! Every delivered aggregate is copied into a durable part file under the stream
//! for its feed and type. Rotation happens on `tick` and `close`: a stream whose
//! parts reach `roll_size` bytes, or whose schedule fired, is merged into one
//! container and handed to the inner destination.
//!
//! ```text
//! <roll_dir>/<name>/<stream>/current/part-000001.zip   aggregate as delivered
//! <roll_dir>/<name>/<stream>/current/part-000001.meta  its attributes
//! <roll_dir>/<name>/rolled-<uuid>.zip                  merged output during rotation
//! ```
//!
//! `<stream>` is `<feed>=<type>` with every byte outside `[A-Za-z0-9-]` written as
//! `_XX`.
//!
//! ## Configuration
//!
//! | Key                 | Description                                  | Default     |
//! |---------------------|----------------------------------------------|-------------|
//! | `roll_size`         | Uncompressed bytes that force a rotation     | `104857600` |
//! | `roll_frequency_ms` | Rotate this long after the first part        | none        |
//! | `roll_period`       | Rotate on the next `minute`, `hour` or `day` | none        |
//!
//! A rotation that fails leaves `current/` in place; it is retried on the next
//! tick. Streams left by a previous run are picked up on open.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use feedhouse_core::{dirs, headers, AttributeMap, ContainerReader, ContainerWriter};
use feedhouse_observability::metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ForwardError, Result};
use crate::traits::{AggregateFile, Destination};

const CURRENT_DIR: &str = "current";
const PART_PREFIX: &str = "part-";
const ROLLED_PREFIX: &str = "rolled-";
const UNPUBLISHED_SUFFIX: &str = ".tmp";

/// Calendar-aligned rotation schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollPeriod {
    #[serde(alias = "minutely")]
    Minute,
    #[serde(alias = "hourly")]
    Hour,
    #[serde(alias = "daily")]
    Day,
}

impl RollPeriod {
    fn seconds(&self) -> i64 {
        match self {
            RollPeriod::Minute => 60,
            RollPeriod::Hour => 3_600,
            RollPeriod::Day => 86_400,
        }
    }

    /// First period boundary strictly after `time` (UTC).
    pub fn next_boundary(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.seconds();
        let next = (time.timestamp().div_euclid(step) + 1) * step;
        Utc.timestamp_opt(next, 0)
            .single()
            .unwrap_or_else(|| time + chrono::Duration::seconds(step))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingConfig {
    /// Uncompressed bytes held in parts before a rotation (default: 100 MiB)
    #[serde(default = "default_roll_size")]
    pub roll_size: u64,

    /// Fixed delay between the first part and its rotation
    #[serde(default)]
    pub roll_frequency_ms: Option<u64>,

    /// Calendar-aligned rotation; ignored when `roll_frequency_ms` is set
    #[serde(default)]
    pub roll_period: Option<RollPeriod>,
}

fn default_roll_size() -> u64 {
    100 * 1024 * 1024
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            roll_size: default_roll_size(),
            roll_frequency_ms: None,
            roll_period: None,
        }
    }
}

impl RollingConfig {
    /// When a roll that started at `opened` is due, if it has a schedule at all.
    pub fn deadline(&self, opened: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(ms) = self.roll_frequency_ms {
            let delay = chrono::Duration::from_std(Duration::from_millis(ms)).ok()?;
            return Some(opened + delay);
        }
        self.roll_period.map(|period| period.next_boundary(opened))
    }
}

/// Parts of one feed and type waiting for rotation.
#[derive(Debug, Default)]
struct RollStream {
    /// Never reused, even when a part write is abandoned
    next_part: u64,
    parts: u64,
    items: u64,
    bytes: u64,
    deadline: Option<DateTime<Utc>>,
}

impl RollStream {
    fn reset(&mut self) {
        self.parts = 0;
        self.items = 0;
        self.bytes = 0;
        self.deadline = None;
    }

    fn is_due(&self, config: &RollingConfig, now: DateTime<Utc>) -> bool {
        self.parts > 0
            && (self.bytes >= config.roll_size
                || self.deadline.map_or(false, |deadline| now >= deadline))
    }
}

/// One rotation's worth of merged parts.
struct Rolled {
    path: PathBuf,
    attributes: AttributeMap,
    items: u64,
    bytes: u64,
}

pub struct RollingDestination {
    name: String,
    inner: Arc<dyn Destination>,
    config: RollingConfig,
    dir: PathBuf,
    streams: Mutex<BTreeMap<String, RollStream>>,
}

impl RollingDestination {
    /// Open the roll directory for `inner`, resuming any parts left by a previous run.
    pub async fn open(
        inner: Arc<dyn Destination>,
        config: RollingConfig,
        roll_root: impl AsRef<Path>,
    ) -> Result<Self> {
        let name = inner.name().to_string();
        let dir = roll_root.as_ref().join(&name);

        let mut streams = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || recover(&dir)).await??
        };

        let now = Utc::now();
        for (stream, state) in streams.iter_mut().filter(|(_, s)| s.parts > 0) {
            state.deadline = config.deadline(now);
            info!(
                destination = %name,
                stream = %stream,
                parts = state.parts,
                bytes = state.bytes,
                "Resuming rolling output from previous run"
            );
        }

        Ok(Self {
            name,
            inner,
            config,
            dir,
            streams: Mutex::new(streams),
        })
    }

    fn stream_dir(&self, stream: &str) -> PathBuf {
        self.dir.join(stream)
    }

    /// Parts waiting for the next rotation, across all streams.
    pub async fn pending_parts(&self) -> u64 {
        self.streams.lock().await.values().map(|s| s.parts).sum()
    }

    async fn rotate(&self, stream: &str, state: &mut RollStream) -> Result<()> {
        if state.parts == 0 {
            return Ok(());
        }

        let stream_dir = self.stream_dir(stream);
        let rolled = {
            let stream_dir = stream_dir.clone();
            let out = self.dir.join(format!("{}{}.zip", ROLLED_PREFIX, Uuid::new_v4()));
            tokio::task::spawn_blocking(move || merge_parts(&stream_dir.join(CURRENT_DIR), &out))
                .await??
        };

        let aggregate = AggregateFile {
            path: rolled.path.clone(),
            attributes: rolled.attributes,
            item_count: rolled.items,
            uncompressed_bytes: rolled.bytes,
        };

        let delivered = self.inner.deliver(&aggregate).await;
        let _ = tokio::fs::remove_file(&rolled.path).await;
        delivered?;

        tokio::fs::remove_dir_all(stream_dir.join(CURRENT_DIR)).await?;
        let _ = tokio::fs::remove_dir(&stream_dir).await;
        metrics::ROLLS_TOTAL.with_label_values(&[&self.name]).inc();
        info!(
            destination = %self.name,
            stream = %stream,
            parts = state.parts,
            items = state.items,
            bytes = rolled.bytes,
            "Rolled output delivered"
        );
        state.reset();
        Ok(())
    }

    /// Rotate every stream `select` picks, returning the first failure.
    async fn rotate_where<F>(&self, select: F) -> Result<()>
    where
        F: Fn(&RollStream) -> bool,
    {
        let mut streams = self.streams.lock().await;
        let mut first_error = None;
        for (stream, state) in streams.iter_mut() {
            if !select(state) {
                continue;
            }
            if let Err(e) = self.rotate(stream, state).await {
                warn!(destination = %self.name, stream = %stream, error = %e, "Rotation failed, will retry");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Destination for RollingDestination {
    fn name(&self) -> &str {
        &self.name
    }

    /// Returns once the aggregate is a durable part. Rotation is left to `tick`.
    async fn deliver(&self, aggregate: &AggregateFile) -> Result<()> {
        let stream = stream_name(&aggregate.attributes);
        let current = self.stream_dir(&stream).join(CURRENT_DIR);

        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream).or_default();

        let part = state.next_part;
        state.next_part += 1;
        {
            let current = current.clone();
            let aggregate = aggregate.clone();
            tokio::task::spawn_blocking(move || write_part(&current, part, &aggregate)).await??;
        }
        // No await from here on: a cancelled delivery either published the part
        // and counted it, or did neither.
        publish_part(&current, part)?;

        if state.parts == 0 {
            state.deadline = self.config.deadline(Utc::now());
        }
        state.parts += 1;
        state.items += aggregate.item_count;
        state.bytes += aggregate.uncompressed_bytes;
        debug!(destination = %self.name, part, bytes = state.bytes, "Aggregate added to roll");
        Ok(())
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        self.rotate_where(|state| state.is_due(&self.config, now)).await
    }

    async fn close(&self) -> Result<()> {
        let rotated = self.rotate_where(|state| state.parts > 0).await;
        let closed = self.inner.close().await;
        rotated.and(closed)
    }
}

/// Directory name for the stream an aggregate belongs to.
fn stream_name(attributes: &AttributeMap) -> String {
    let feed = attributes.get(headers::FEED).unwrap_or_default();
    let kind = attributes.get(headers::TYPE).unwrap_or_default();
    format!("{}={}", escape_component(feed), escape_component(kind))
}

fn escape_component(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "_{:02X}", byte);
        }
    }
    escaped
}

fn part_path(current: &Path, part: u64, extension: &str) -> PathBuf {
    current.join(format!("{}{:06}.{}", PART_PREFIX, part, extension))
}

fn unpublished_meta_path(current: &Path, part: u64) -> PathBuf {
    current.join(format!("{}{:06}.meta{}", PART_PREFIX, part, UNPUBLISHED_SUFFIX))
}

/// Write the part's payload and an unpublished meta file.
fn write_part(current: &Path, part: u64, aggregate: &AggregateFile) -> Result<()> {
    fs::create_dir_all(current)?;
    let result = write_part_files(current, part, aggregate);
    if result.is_err() {
        let _ = fs::remove_file(part_path(current, part, "zip"));
        let _ = fs::remove_file(unpublished_meta_path(current, part));
    }
    result
}

fn write_part_files(current: &Path, part: u64, aggregate: &AggregateFile) -> Result<()> {
    let data_path = part_path(current, part, "zip");
    fs::copy(&aggregate.path, &data_path)?;
    File::open(&data_path)?.sync_all()?;

    let mut attributes = aggregate.attributes.clone();
    attributes.insert(headers::ITEM_COUNT, aggregate.item_count.to_string());
    attributes.insert(headers::UNCOMPRESSED_SIZE, aggregate.uncompressed_bytes.to_string());

    let mut meta = File::create(unpublished_meta_path(current, part))?;
    attributes.write_meta(&mut meta)?;
    meta.sync_all()?;
    Ok(())
}

/// The meta file marks the part complete.
fn publish_part(current: &Path, part: u64) -> Result<()> {
    fs::rename(
        unpublished_meta_path(current, part),
        part_path(current, part, "meta"),
    )?;
    dirs::sync_dir(current)?;
    Ok(())
}

/// Complete parts in `current`, ordered by part number.
fn list_parts(current: &Path) -> io::Result<Vec<(u64, AttributeMap)>> {
    let mut parts = Vec::new();
    let entries = match fs::read_dir(current) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(parts),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let name = entry?.file_name();
        let Some(number) = name
            .to_str()
            .and_then(|n| n.strip_prefix(PART_PREFIX))
            .and_then(|n| n.strip_suffix(".meta"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        if !part_path(current, number, "zip").exists() {
            continue;
        }
        let attributes = AttributeMap::from_meta_bytes(&fs::read(current.join(&name))?);
        parts.push((number, attributes));
    }
    parts.sort_by_key(|(number, _)| *number);
    Ok(parts)
}

fn count_attribute(attributes: &AttributeMap, key: &str) -> u64 {
    attributes
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn recover(dir: &Path) -> Result<BTreeMap<String, RollStream>> {
    fs::create_dir_all(dir)?;

    let mut streams = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if entry.file_type()?.is_dir() {
            let state = recover_stream(&entry.path().join(CURRENT_DIR))?;
            streams.insert(name, state);
        } else if name.starts_with(ROLLED_PREFIX) {
            // Merged output from an interrupted rotation; the parts are still in place.
            fs::remove_file(entry.path())?;
        }
    }
    Ok(streams)
}

fn recover_stream(current: &Path) -> Result<RollStream> {
    let parts = list_parts(current)?;
    let mut highest = parts.last().map(|(number, _)| *number);

    // Payloads and meta files of parts that were never published.
    if current.is_dir() {
        for entry in fs::read_dir(current)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let number = name
                .strip_prefix(PART_PREFIX)
                .and_then(|n| n.split('.').next())
                .and_then(|n| n.parse::<u64>().ok());
            highest = highest.max(number);

            let published = number.map_or(false, |n| parts.iter().any(|(p, _)| *p == n));
            if !published {
                fs::remove_file(&path)?;
            }
        }
    }

    let mut state = RollStream {
        next_part: highest.map_or(0, |n| n + 1),
        ..RollStream::default()
    };
    for (_, attributes) in &parts {
        state.parts += 1;
        state.items += count_attribute(attributes, headers::ITEM_COUNT);
        state.bytes += count_attribute(attributes, headers::UNCOMPRESSED_SIZE);
    }
    Ok(state)
}

fn merge_parts(current: &Path, out: &Path) -> Result<Rolled> {
    let parts = list_parts(current)?;
    let result = write_merged(current, &parts, out);
    if result.is_err() {
        let _ = fs::remove_file(out);
    }
    result
}

fn write_merged(current: &Path, parts: &[(u64, AttributeMap)], path: &Path) -> Result<Rolled> {
    let mut writer = ContainerWriter::new(BufWriter::new(File::create(path)?));
    let mut common: Option<AttributeMap> = None;

    for (number, part_attributes) in parts {
        let mut reader = ContainerReader::new(File::open(part_path(current, *number, "zip"))?)?;
        for index in 0..reader.len() {
            let attributes = reader.read_attributes(index)?;
            let mut data = reader.data_reader(index)?;
            writer.add_entry_from_reader(&attributes, &mut data)?;
        }

        match common.as_mut() {
            Some(common) => common.retain_common(part_attributes),
            None => common = Some(part_attributes.clone()),
        }
    }

    let items = writer.entry_count();
    let bytes = writer.uncompressed_bytes();
    let file = writer
        .finish()?
        .into_inner()
        .map_err(|e| ForwardError::Io(e.into_error()))?;
    file.sync_all()?;

    let mut attributes = common.unwrap_or_default();
    attributes.insert(headers::ITEM_COUNT, items.to_string());
    attributes.insert(headers::UNCOMPRESSED_SIZE, bytes.to_string());

    Ok(Rolled {
        path: path.to_path_buf(),
        attributes,
        items,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::forwarder::{ForwardTarget, Forwarder};
    use feedhouse_core::{container, ContainerEntry};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Inner destination that keeps the entries of every rolled output.
    struct Collect {
        rolled: StdMutex<Vec<(AttributeMap, Vec<ContainerEntry>)>>,
        fail: AtomicBool,
        delay_ms: AtomicU64,
    }

    impl Collect {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rolled: StdMutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                delay_ms: AtomicU64::new(0),
            })
        }

        fn entry_counts(&self) -> Vec<usize> {
            self.rolled.lock().unwrap().iter().map(|(_, e)| e.len()).collect()
        }
    }

    #[async_trait]
    impl Destination for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn deliver(&self, aggregate: &AggregateFile) -> Result<()> {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ForwardError::Rejected {
                    destination: "collect".to_string(),
                    reason: "down".to_string(),
                });
            }
            let bytes = fs::read(&aggregate.path)?;
            let entries = container::decode(&bytes)?;
            self.rolled
                .lock()
                .unwrap()
                .push((aggregate.attributes.clone(), entries));
            Ok(())
        }
    }

    fn feed_attributes(feed: &str) -> AttributeMap {
        [("Feed", feed), ("Type", "Raw Events")].into_iter().collect()
    }

    fn aggregate(dir: &Path, feed: &str, payloads: &[&str]) -> AggregateFile {
        let attributes = feed_attributes(feed);
        let entries: Vec<ContainerEntry> = payloads
            .iter()
            .map(|p| ContainerEntry::new(attributes.clone(), p.as_bytes().to_vec()))
            .collect();
        let path = dir.join(format!("{}.zip", Uuid::new_v4()));
        fs::write(&path, container::encode(&entries).unwrap()).unwrap();
        AggregateFile {
            path,
            attributes,
            item_count: payloads.len() as u64,
            uncompressed_bytes: payloads.iter().map(|p| p.len() as u64).sum(),
        }
    }

    fn config(roll_size: u64) -> RollingConfig {
        RollingConfig {
            roll_size,
            ..RollingConfig::default()
        }
    }

    #[test]
    fn test_roll_period_boundaries() {
        let time = Utc.with_ymd_and_hms(2024, 3, 10, 14, 25, 30).unwrap();
        assert_eq!(
            RollPeriod::Minute.next_boundary(time),
            Utc.with_ymd_and_hms(2024, 3, 10, 14, 26, 0).unwrap()
        );
        assert_eq!(
            RollPeriod::Hour.next_boundary(time),
            Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap()
        );
        assert_eq!(
            RollPeriod::Day.next_boundary(time),
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );

        let exact = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        assert_eq!(
            RollPeriod::Hour.next_boundary(exact),
            Utc.with_ymd_and_hms(2024, 3, 10, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_roll_period_config_spellings() {
        let parsed: RollingConfig = toml::from_str(r#"roll_period = "hourly""#).unwrap();
        assert_eq!(parsed.roll_period, Some(RollPeriod::Hour));
        let parsed: RollingConfig = toml::from_str(r#"roll_period = "day""#).unwrap();
        assert_eq!(parsed.roll_period, Some(RollPeriod::Day));
        assert!(toml::from_str::<RollingConfig>(r#"roll_period = "weekly""#).is_err());
    }

    #[test]
    fn test_frequency_takes_precedence() {
        let opened = Utc.with_ymd_and_hms(2024, 3, 10, 14, 25, 30).unwrap();
        let config = RollingConfig {
            roll_size: 10,
            roll_frequency_ms: Some(5_000),
            roll_period: Some(RollPeriod::Day),
        };
        assert_eq!(
            config.deadline(opened),
            Some(opened + chrono::Duration::seconds(5))
        );
        assert_eq!(RollingConfig::default().deadline(opened), None);
    }

    #[test]
    fn test_stream_names_are_path_safe() {
        assert_eq!(stream_name(&feed_attributes("TEST-FEED")), "TEST-FEED=Raw_20Events");
        assert_eq!(stream_name(&feed_attributes("../x")), "_2E_2E_2Fx=Raw_20Events");
        assert_eq!(stream_name(&AttributeMap::new()), "=");
    }

    #[tokio::test]
    async fn test_rotates_on_tick_once_size_reached() {
        let temp = TempDir::new().unwrap();
        let inner = Collect::new();
        let rolling = RollingDestination::open(inner.clone(), config(10), temp.path().join("roll"))
            .await
            .unwrap();

        rolling.deliver(&aggregate(temp.path(), "A", &["1234"])).await.unwrap();
        rolling
            .deliver(&aggregate(temp.path(), "A", &["5678", "90"]))
            .await
            .unwrap();
        assert!(inner.rolled.lock().unwrap().is_empty());
        assert_eq!(rolling.pending_parts().await, 2);

        rolling.tick().await.unwrap();

        let rolled = inner.rolled.lock().unwrap();
        assert_eq!(rolled.len(), 1);
        let (attributes, entries) = &rolled[0];
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].data.as_ref(), b"90");
        assert_eq!(attributes.get("Feed"), Some("A"));
        assert_eq!(attributes.get(headers::ITEM_COUNT), Some("3"));
        assert!(!temp.path().join("roll/collect/A=Raw_20Events").exists());
    }

    #[tokio::test]
    async fn test_feeds_roll_separately() {
        let temp = TempDir::new().unwrap();
        let inner = Collect::new();
        let rolling = RollingDestination::open(inner.clone(), config(1_000), temp.path())
            .await
            .unwrap();

        rolling.deliver(&aggregate(temp.path(), "A", &["x"])).await.unwrap();
        rolling.deliver(&aggregate(temp.path(), "B", &["y"])).await.unwrap();
        rolling.deliver(&aggregate(temp.path(), "A", &["z"])).await.unwrap();
        rolling.close().await.unwrap();

        let rolled = inner.rolled.lock().unwrap();
        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled[0].0.get("Feed"), Some("A"));
        assert_eq!(rolled[0].0.get(headers::ITEM_COUNT), Some("2"));
        assert_eq!(rolled[1].0.get("Feed"), Some("B"));
        assert!(rolled[1].1.iter().all(|e| e.attributes.get("Feed") == Some("B")));
    }

    #[tokio::test]
    async fn test_slow_inner_destination_does_not_duplicate() {
        let temp = TempDir::new().unwrap();
        let inner = Collect::new();
        inner.delay_ms.store(300, Ordering::SeqCst);
        let rolling = RollingDestination::open(inner.clone(), config(1), temp.path().join("roll"))
            .await
            .unwrap();
        let forwarder = Forwarder::new(
            vec![ForwardTarget::new(
                Arc::new(rolling),
                true,
                CircuitBreakerConfig::default(),
            )],
            Duration::from_millis(50),
        );

        let report = forwarder.deliver(&aggregate(temp.path(), "A", &["only"])).await;
        assert!(report.is_success());

        forwarder.tick().await;
        assert_eq!(inner.entry_counts(), vec![1]);
        forwarder.tick().await;
        assert_eq!(inner.entry_counts(), vec![1]);
    }

    #[tokio::test]
    async fn test_tick_rotates_after_frequency() {
        let temp = TempDir::new().unwrap();
        let inner = Collect::new();
        let config = RollingConfig {
            roll_size: 1_000_000,
            roll_frequency_ms: Some(50),
            roll_period: None,
        };
        let rolling = RollingDestination::open(inner.clone(), config, temp.path())
            .await
            .unwrap();

        rolling.deliver(&aggregate(temp.path(), "A", &["x"])).await.unwrap();
        rolling.tick().await.unwrap();
        assert!(inner.rolled.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        rolling.tick().await.unwrap();
        assert_eq!(inner.rolled.lock().unwrap().len(), 1);
        assert_eq!(rolling.pending_parts().await, 0);
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_parts_for_retry() {
        let temp = TempDir::new().unwrap();
        let inner = Collect::new();
        inner.fail.store(true, Ordering::SeqCst);
        let rolling = RollingDestination::open(inner.clone(), config(1), temp.path())
            .await
            .unwrap();

        rolling.deliver(&aggregate(temp.path(), "A", &["abc"])).await.unwrap();
        assert_eq!(rolling.pending_parts().await, 1);
        assert!(rolling.tick().await.is_err());
        assert_eq!(rolling.pending_parts().await, 1);

        inner.fail.store(false, Ordering::SeqCst);
        rolling.tick().await.unwrap();
        assert_eq!(inner.entry_counts(), vec![1]);

        let leftovers: Vec<_> = fs::read_dir(temp.path().join("collect"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_resumes_parts_from_previous_run() {
        let temp = TempDir::new().unwrap();
        let inner = Collect::new();
        {
            let rolling = RollingDestination::open(inner.clone(), config(1_000), temp.path())
                .await
                .unwrap();
            rolling.deliver(&aggregate(temp.path(), "A", &["one"])).await.unwrap();
            rolling.deliver(&aggregate(temp.path(), "A", &["two"])).await.unwrap();
        }
        let current = temp.path().join("collect/A=Raw_20Events/current");
        // Leftovers from an interrupted rotation and an unpublished part.
        fs::write(temp.path().join("collect/rolled-stale.zip"), b"junk").unwrap();
        fs::write(current.join("part-000007.zip"), b"partial").unwrap();
        fs::write(current.join("part-000007.meta.tmp"), b"Feed:A\n").unwrap();

        let rolling = RollingDestination::open(inner.clone(), config(1_000), temp.path())
            .await
            .unwrap();
        assert_eq!(rolling.pending_parts().await, 2);
        assert!(!temp.path().join("collect/rolled-stale.zip").exists());
        assert!(!current.join("part-000007.zip").exists());
        assert!(!current.join("part-000007.meta.tmp").exists());

        rolling.deliver(&aggregate(temp.path(), "A", &["three"])).await.unwrap();
        assert!(current.join("part-000008.meta").exists());
        rolling.close().await.unwrap();

        let rolled = inner.rolled.lock().unwrap();
        let payloads: Vec<&[u8]> = rolled[0].1.iter().map(|e| e.data.as_ref()).collect();
        assert_eq!(
            payloads,
            vec![b"one".as_slice(), b"two".as_slice(), b"three".as_slice()]
        );
    }
}
