//! Aggregator - Scan, Group, Close
//!
//! One pass walks the repository for staged entries, groups them by partition
//! key into open aggregates and closes the aggregates that hit a bound. A closed
//! aggregate is written as one container and handed to the forwarder; its source
//! entries are marked forwarded only after the forwarder reports success.
//!
//! ## Pass
//!
//! ```text
//! Idle ──> Scanning ──> Grouping ──> Closing(N) ──> Idle
//!            │             │              │
//!   list_ready(cursor)  append in     write container,
//!   read meta in        arrival order forward, then
//!   parallel                          mark_forwarded
//! ```
//!
//! ## Bounds
//!
//! An aggregate closes when it holds `max_items_per_aggregate` entries, when the
//! next entry would push it past `max_uncompressed_bytes`, or when its oldest
//! entry is older than `max_aggregate_age`. An entry larger than the byte budget
//! is forwarded in an aggregate of its own.
//!
//! Open aggregates outlive the pass that opened them. Their entries are held in a
//! claim set so later scans skip them. A failed forward releases the claims and
//! rewinds the scan cursor, so the next pass rebuilds the same aggregate.

use chrono::{DateTime, Utc};
use feedhouse_core::{headers, AttributeMap, ContainerWriter};
use feedhouse_forward::{AggregateFile, Forwarder};
use feedhouse_observability::metrics;
use feedhouse_storage::{EntryRef, RepositoryId, RepositoryStore, StagedEntry};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AggregatorConfig, GroupKey};
use crate::error::{AgentError, Result};

const AGGREGATES_DIR: &str = "aggregates";

/// Summary of one aggregation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// The pass was dropped because another one was running
    pub skipped: bool,
    pub scanned: usize,
    pub aggregates_forwarded: usize,
    pub aggregates_failed: usize,
    pub entries_forwarded: usize,
    pub quarantined: usize,
    /// Aggregates left open for the next pass
    pub open_aggregates: usize,
}

/// Entry references owned by open or closing aggregates.
#[derive(Clone, Default)]
struct ClaimSet {
    inner: Arc<StdMutex<HashSet<EntryRef>>>,
}

impl ClaimSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<EntryRef>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, entry: EntryRef) {
        self.lock().insert(entry);
    }

    fn contains(&self, entry: &EntryRef) -> bool {
        self.lock().contains(entry)
    }

    fn release<'a>(&self, entries: impl IntoIterator<Item = &'a EntryRef>) {
        let mut set = self.lock();
        for entry in entries {
            set.remove(entry);
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct OpenAggregate {
    key: GroupKey,
    entries: Vec<StagedEntry>,
    bytes: u64,
    earliest: Option<DateTime<Utc>>,
}

impl OpenAggregate {
    fn new(key: GroupKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
            bytes: 0,
            earliest: None,
        }
    }

    fn would_overflow(&self, size: u64, config: &AggregatorConfig) -> bool {
        !self.entries.is_empty()
            && (self.entries.len() >= config.max_items_per_aggregate
                || self.bytes.saturating_add(size) > config.max_uncompressed_bytes)
    }

    fn is_full(&self, config: &AggregatorConfig) -> bool {
        self.entries.len() >= config.max_items_per_aggregate
            || self.bytes >= config.max_uncompressed_bytes
    }

    fn push(&mut self, staged: StagedEntry) {
        self.bytes = self.bytes.saturating_add(staged.data_size);
        self.earliest = Some(match self.earliest {
            Some(earliest) => earliest.min(staged.received_at),
            None => staged.received_at,
        });
        self.entries.push(staged);
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        self.earliest
            .and_then(|earliest| (now - earliest).to_std().ok())
            .unwrap_or_default()
    }

    fn refs(&self) -> Vec<EntryRef> {
        self.entries.iter().map(|staged| staged.entry).collect()
    }

    /// Drop every entry of submission `id`, returning the dropped references.
    fn remove_submission(&mut self, id: RepositoryId) -> Vec<EntryRef> {
        let (dropped, kept): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|staged| staged.entry.id == id);
        self.bytes = kept.iter().map(|staged| staged.data_size).sum();
        self.earliest = kept.iter().map(|staged| staged.received_at).min();
        self.entries = kept;
        dropped.into_iter().map(|staged| staged.entry).collect()
    }
}

struct PassState {
    /// Highest id already scanned; claimed entries below it live in `open`
    cursor: RepositoryId,
    open: BTreeMap<GroupKey, OpenAggregate>,
}

/// Clears the single-flight flag when a pass ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Aggregator {
    store: RepositoryStore,
    forwarder: Arc<Forwarder>,
    config: AggregatorConfig,
    running: AtomicBool,
    claimed: ClaimSet,
    /// Bounds staged files open at once
    files: Semaphore,
    state: Mutex<PassState>,
    work_dir: PathBuf,
}

impl Aggregator {
    pub fn new(store: RepositoryStore, forwarder: Arc<Forwarder>, config: AggregatorConfig) -> Self {
        let config = config.normalized();
        let work_dir = store.config().temp_dir.join(AGGREGATES_DIR);
        Self {
            files: Semaphore::new(config.max_concurrent_mapped_files),
            store,
            forwarder,
            config,
            running: AtomicBool::new(false),
            claimed: ClaimSet::default(),
            state: Mutex::new(PassState {
                cursor: RepositoryId(0),
                open: BTreeMap::new(),
            }),
            work_dir,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// Whether a pass is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Entries currently held by open aggregates.
    pub fn claimed_entries(&self) -> usize {
        self.claimed.len()
    }

    /// Run one pass. Returns a skipped report if a pass is already running.
    ///
    /// Cancellation stops scanning and closing between aggregates; an aggregate
    /// already being written and forwarded is finished first.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::AGGREGATION_PASSES_SKIPPED.inc();
            debug!("Aggregation pass already running, dropping trigger");
            return Ok(PassReport {
                skipped: true,
                ..PassReport::default()
            });
        }
        let _guard = RunningGuard(&self.running);
        let timer = metrics::AGGREGATION_PASS_DURATION.start_timer();

        let mut state = self.state.lock().await;
        let mut report = PassReport::default();
        let mut closing = Vec::new();

        self.scan(&mut state, cancel, &mut report, &mut closing).await?;

        let now = Utc::now();
        let expired: Vec<GroupKey> = state
            .open
            .iter()
            .filter(|(_, aggregate)| {
                self.config.close_on_pass_end || aggregate.age(now) >= self.config.max_aggregate_age
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(aggregate) = state.open.remove(&key) {
                closing.push(aggregate);
            }
        }

        let mut closing = closing.into_iter();
        for aggregate in closing.by_ref() {
            if cancel.is_cancelled() {
                self.claimed.release(&aggregate.refs());
                break;
            }
            self.close(aggregate, &mut state, &mut report).await;
        }
        // Left staged for the next run.
        for aggregate in closing {
            self.claimed.release(&aggregate.refs());
        }

        self.forwarder.tick().await;

        report.open_aggregates = state.open.len();
        metrics::OPEN_AGGREGATES.set(report.open_aggregates as i64);
        timer.observe_duration();

        if report.scanned > 0 || report.aggregates_forwarded > 0 || report.aggregates_failed > 0 {
            info!(
                scanned = report.scanned,
                forwarded = report.aggregates_forwarded,
                failed = report.aggregates_failed,
                entries = report.entries_forwarded,
                quarantined = report.quarantined,
                open = report.open_aggregates,
                "Aggregation pass complete"
            );
        }
        Ok(report)
    }

    async fn scan(
        &self,
        state: &mut PassState,
        cancel: &CancellationToken,
        report: &mut PassReport,
        closing: &mut Vec<OpenAggregate>,
    ) -> Result<()> {
        let claimed = self.claimed.clone();
        let batch = self
            .store
            .list_ready(state.cursor, self.config.max_file_scan, move |entry| {
                claimed.contains(entry)
            })
            .await?;
        report.scanned = batch.entries.len();

        for id in &batch.unreadable {
            self.quarantine(*id, &"submission listing failed").await;
            report.quarantined += 1;
        }

        let reads = stream::iter(batch.entries)
            .map(|entry| self.read_entry(entry))
            .buffered(self.config.proxy_threads);
        futures::pin_mut!(reads);

        let mut quarantined = HashSet::new();
        let mut interrupted = false;
        while let Some((entry, result)) = reads.next().await {
            if quarantined.contains(&entry.id) {
                continue;
            }
            match result {
                Ok(staged) => {
                    if cancel.is_cancelled() {
                        interrupted = true;
                        break;
                    }
                    self.add_entry(state, staged, closing);
                }
                Err(e) => {
                    self.quarantine(entry.id, &e).await;
                    quarantined.insert(entry.id);
                    report.quarantined += 1;
                }
            }
        }

        // Ungrouped entries past the break are found again from the old cursor.
        if !interrupted {
            state.cursor = batch.scanned_through;
        }
        Ok(())
    }

    async fn read_entry(&self, entry: EntryRef) -> (EntryRef, Result<StagedEntry>) {
        let result = match self.files.acquire().await {
            Ok(_permit) => self
                .store
                .read_entry_async(entry)
                .await
                .map_err(AgentError::from),
            Err(_) => Err(AgentError::Config("file limiter closed".to_string())),
        };
        (entry, result)
    }

    fn add_entry(&self, state: &mut PassState, staged: StagedEntry, closing: &mut Vec<OpenAggregate>) {
        let key = self.config.partition_by.key_for(&staged.attributes);
        let open = state
            .open
            .entry(key.clone())
            .or_insert_with(|| OpenAggregate::new(key.clone()));

        if open.would_overflow(staged.data_size, &self.config) {
            closing.push(std::mem::replace(open, OpenAggregate::new(key.clone())));
        }

        self.claimed.claim(staged.entry);
        open.push(staged);

        if open.is_full(&self.config) {
            if let Some(full) = state.open.remove(&key) {
                closing.push(full);
            }
        }
    }

    /// Write, forward and settle one closed aggregate. Failures are contained
    /// here; the entries stay staged and the cursor rewinds.
    async fn close(&self, mut aggregate: OpenAggregate, state: &mut PassState, report: &mut PassReport) {
        while !aggregate.entries.is_empty() {
            match self.write_aggregate(&aggregate).await {
                Ok(file) => {
                    self.forward(&aggregate, &file, state, report).await;
                    if let Err(e) = tokio::fs::remove_file(&file.path).await {
                        debug!(path = ?file.path, error = %e, "Failed to remove aggregate file");
                    }
                    return;
                }
                Err(AgentError::UnreadableEntry { entry, source }) => {
                    self.quarantine(entry.id, &source).await;
                    report.quarantined += 1;
                    let dropped = aggregate.remove_submission(entry.id);
                    self.claimed.release(&dropped);
                }
                Err(e) => {
                    warn!(
                        feed = %aggregate.key.feed,
                        items = aggregate.entries.len(),
                        error = %e,
                        "Failed to write aggregate"
                    );
                    self.settle_failure(&aggregate, state, report);
                    return;
                }
            }
        }
    }

    async fn forward(
        &self,
        aggregate: &OpenAggregate,
        file: &AggregateFile,
        state: &mut PassState,
        report: &mut PassReport,
    ) {
        let outcome = self.forwarder.deliver(file).await;
        if !outcome.is_success() {
            warn!(
                feed = %aggregate.key.feed,
                items = file.item_count,
                failures = ?outcome.failures(),
                "Aggregate not forwarded, entries kept for retry"
            );
            self.settle_failure(aggregate, state, report);
            return;
        }

        let refs = aggregate.refs();
        if let Err(e) = self.store.mark_forwarded(refs.clone()).await {
            // Delivered but still staged: the next pass sends these entries again.
            warn!(feed = %aggregate.key.feed, error = %e, "Failed to record forwarded entries");
            self.settle_failure(aggregate, state, report);
            return;
        }
        self.claimed.release(&refs);

        report.aggregates_forwarded += 1;
        report.entries_forwarded += refs.len();
        metrics::AGGREGATES_TOTAL.with_label_values(&["forwarded"]).inc();
        metrics::AGGREGATE_ITEMS.observe(refs.len() as f64);
        info!(
            feed = %aggregate.key.feed,
            data_type = aggregate.key.data_type.as_deref().unwrap_or(""),
            items = file.item_count,
            bytes = file.uncompressed_bytes,
            "Aggregate forwarded"
        );
    }

    fn settle_failure(&self, aggregate: &OpenAggregate, state: &mut PassState, report: &mut PassReport) {
        self.claimed.release(&aggregate.refs());
        state.cursor = RepositoryId(0);
        report.aggregates_failed += 1;
        metrics::AGGREGATES_TOTAL.with_label_values(&["failed"]).inc();
    }

    async fn write_aggregate(&self, aggregate: &OpenAggregate) -> Result<AggregateFile> {
        let _permit = self
            .files
            .acquire()
            .await
            .map_err(|_| AgentError::Config("file limiter closed".to_string()))?;

        let store = self.store.clone();
        let path = self.work_dir.join(format!("{}.zip", Uuid::new_v4()));
        let key = aggregate.key.clone();
        let entries = aggregate.entries.clone();

        tokio::task::spawn_blocking(move || {
            let result = write_container(&store, &path, &key, &entries);
            if result.is_err() {
                let _ = fs::remove_file(&path);
            }
            result
        })
        .await?
    }

    async fn quarantine(&self, id: RepositoryId, reason: &(dyn std::fmt::Display + Sync)) {
        warn!(id = %id, error = %reason, "Staged submission unreadable, moving aside");
        if let Err(e) = self.store.quarantine(id).await {
            warn!(id = %id, error = %e, "Failed to quarantine submission");
        }
    }
}

fn write_container(
    store: &RepositoryStore,
    path: &Path,
    key: &GroupKey,
    entries: &[StagedEntry],
) -> Result<AggregateFile> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = ContainerWriter::new(BufWriter::new(File::create(path)?));
    let mut common: Option<AttributeMap> = None;

    for staged in entries {
        let mut data = store
            .open_entry_data(staged.entry)
            .map_err(|e| AgentError::UnreadableEntry {
                entry: staged.entry,
                source: Box::new(e.into()),
            })?;
        writer.add_entry_from_reader(&staged.attributes, &mut data)?;

        match common.as_mut() {
            Some(common) => common.retain_common(&staged.attributes),
            None => common = Some(staged.attributes.clone()),
        }
    }

    let item_count = writer.entry_count();
    let uncompressed_bytes = writer.uncompressed_bytes();
    let file = writer
        .finish()?
        .into_inner()
        .map_err(|e| AgentError::Io(e.into_error()))?;
    file.sync_all()?;

    let mut attributes = common.unwrap_or_default();
    attributes.insert(headers::FEED, &key.feed);
    if let Some(data_type) = &key.data_type {
        attributes.insert(headers::TYPE, data_type);
    }
    attributes.insert(headers::ITEM_COUNT, item_count.to_string());
    attributes.insert(headers::UNCOMPRESSED_SIZE, uncompressed_bytes.to_string());

    Ok(AggregateFile {
        path: path.to_path_buf(),
        attributes,
        item_count,
        uncompressed_bytes,
    })
}
