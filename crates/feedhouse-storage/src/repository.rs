//! Repository Store
//!
//! Durable, crash-safe staging area for received submissions.
//!
//! ## Layout
//!
//! ```text
//! data/
//!   0/001/          submission id 1
//!     0.meta        attributes of entry 0
//!     0.dat         payload of entry 0
//!     1.meta
//!     1.dat
//!     forwarded.json   (optional) indices already delivered
//!   1/001/234/      submission id 1234
//! temp/
//!   <uuid>/         staging writer, not yet committed
//!   <uuid>.spool    scratch copy of an uploaded container
//! home/failed/      submissions that could not be read
//! ```
//!
//! ## Commit Discipline
//!
//! A `StagingWriter` writes every file of a submission into its own directory
//! under `temp/`, fsyncs each file, and on `commit()` renames the whole directory
//! to its numbered path under `data/`. The rename is the only step that makes a
//! submission visible, so the scanner never sees a partial one. A writer dropped
//! before commit removes its directory; anything left in `temp/` by a crash is
//! removed by `open()`.
//!
//! ## Identifiers
//!
//! Ids come from an atomic counter seeded by `max_dir_id(data)` at open. Ids are
//! allocated at commit, so concurrent writers may rename out of id order. The
//! store tracks allocated-but-uncommitted ids and `list_ready` never reports past
//! the lowest of them, so a scan cursor cannot skip a late commit.
//!
//! ## Blocking
//!
//! `StagingWriter`, `read_entry`, `open_entry_data` and `ScratchFile` do blocking
//! I/O and are meant for the blocking pool. The async methods hop there
//! themselves.

use chrono::{DateTime, Utc};
use feedhouse_core::{dirs, headers, AttributeMap};
use feedhouse_observability::metrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};

const META_SUFFIX: &str = ".meta";
const DATA_SUFFIX: &str = ".dat";
const MARKER_FILE: &str = "forwarded.json";
const MARKER_TEMP_FILE: &str = ".forwarded.json.tmp";
const RENAME_ATTEMPTS: usize = 3;

/// Identifier of one committed submission.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RepositoryId(pub u64);

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a committed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef {
    pub id: RepositoryId,
    pub index: u32,
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.index)
    }
}

/// Metadata of a staged entry, read without touching its payload.
#[derive(Debug, Clone)]
pub struct StagedEntry {
    pub entry: EntryRef,
    pub attributes: AttributeMap,
    /// Uncompressed payload size
    pub data_size: u64,
    /// `ReceivedTime`, falling back to the file modification time
    pub received_at: DateTime<Utc>,
}

/// Result of `list_ready`.
#[derive(Debug, Clone, Default)]
pub struct ReadyBatch {
    /// Entries in id order, then index order
    pub entries: Vec<EntryRef>,
    /// Highest id whose remaining entries are all in `entries` or skipped
    pub scanned_through: RepositoryId,
    /// Submissions whose directory or progress marker could not be read
    pub unreadable: Vec<RepositoryId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ForwardedMarker {
    forwarded: BTreeSet<u32>,
}

struct StoreInner {
    config: RepositoryConfig,
    last_id: AtomicU64,
    /// Ids handed out whose rename has not finished
    pending: Mutex<BTreeSet<u64>>,
}

/// Handle to the staging repository. Cheap to clone.
#[derive(Clone)]
pub struct RepositoryStore {
    inner: Arc<StoreInner>,
}

impl RepositoryStore {
    /// Create the roots, verify they are writable, clear `temp/` and recover the
    /// highest committed id.
    ///
    /// Any failure here is fatal for the process.
    pub async fn open(config: RepositoryConfig) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::open_blocking(config)).await?
    }

    fn open_blocking(config: RepositoryConfig) -> Result<Self> {
        for root in [&config.data_dir, &config.temp_dir, &config.home_dir] {
            ensure_writable(root)?;
        }

        let orphans = clear_dir(&config.temp_dir)?;
        if orphans > 0 {
            warn!(
                path = ?config.temp_dir,
                orphans,
                "Removed orphaned temp files from previous run"
            );
        }

        let max_id = dirs::max_dir_id(&config.data_dir)?;
        metrics::REPOSITORY_MAX_ID.set(max_id as i64);
        info!(path = ?config.data_dir, max_id, "Repository opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                last_id: AtomicU64::new(max_id),
                pending: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// Highest id allocated so far.
    pub fn last_id(&self) -> RepositoryId {
        RepositoryId(self.inner.last_id.load(Ordering::Acquire))
    }

    pub fn submission_path(&self, id: RepositoryId) -> PathBuf {
        dirs::id_path(&self.inner.config.data_dir, id.0)
    }

    fn allocate_id(&self) -> RepositoryId {
        let mut pending = lock(&self.inner.pending);
        let id = self.inner.last_id.fetch_add(1, Ordering::AcqRel) + 1;
        pending.insert(id);
        metrics::REPOSITORY_MAX_ID.set(id as i64);
        RepositoryId(id)
    }

    fn release_id(&self, id: RepositoryId) {
        lock(&self.inner.pending).remove(&id.0);
    }

    /// Highest id below which every allocated id has finished committing.
    fn committed_watermark(&self) -> u64 {
        let pending = lock(&self.inner.pending);
        match pending.iter().next() {
            Some(lowest) => lowest - 1,
            None => self.inner.last_id.load(Ordering::Acquire),
        }
    }

    /// Start a new submission in its own temp directory. Blocking.
    pub fn begin(&self) -> Result<StagingWriter> {
        let temp_path = self
            .inner
            .config
            .temp_dir
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&temp_path)?;
        Ok(StagingWriter {
            store: self.clone(),
            temp_path,
            entries: 0,
            bytes: 0,
            committed: false,
        })
    }

    /// Scratch file under `temp/`, removed on drop. Blocking.
    pub fn scratch_file(&self, extension: &str) -> Result<ScratchFile> {
        let path = self
            .inner
            .config
            .temp_dir
            .join(format!("{}.{}", Uuid::new_v4(), extension));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(ScratchFile { path, file })
    }

    /// Stage in-memory entries as one submission.
    pub async fn stage(&self, entries: Vec<(AttributeMap, bytes::Bytes)>) -> Result<RepositoryId> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = store.begin()?;
            for (attributes, data) in &entries {
                writer.add_entry(attributes, &mut &data[..])?;
            }
            writer.commit()
        })
        .await?
    }

    /// Committed entries with ids greater than `after`, in arrival order.
    ///
    /// At most `limit` entries are returned. Entries already forwarded and entries
    /// for which `skip` returns true are left out and do not count towards `limit`.
    pub async fn list_ready<F>(&self, after: RepositoryId, limit: usize, skip: F) -> Result<ReadyBatch>
    where
        F: Fn(&EntryRef) -> bool + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_ready_blocking(after, limit, skip)).await?
    }

    fn list_ready_blocking<F>(&self, after: RepositoryId, limit: usize, skip: F) -> Result<ReadyBatch>
    where
        F: Fn(&EntryRef) -> bool,
    {
        let watermark = self.committed_watermark();
        let mut batch = ReadyBatch {
            entries: Vec::new(),
            scanned_through: after,
            unreadable: Vec::new(),
        };

        let mut cursor = after.0;
        'scan: while batch.entries.len() < limit && cursor < watermark {
            let ids = dirs::list_ids_after(&self.inner.config.data_dir, cursor, limit.max(16))?;
            if ids.is_empty() {
                batch.scanned_through = RepositoryId(watermark.max(after.0));
                break;
            }

            for id in ids {
                if id > watermark {
                    batch.scanned_through = RepositoryId(watermark);
                    break 'scan;
                }
                let id = RepositoryId(id);
                let indices = match self.pending_indices(id) {
                    Ok(indices) => indices,
                    // Deleted by a concurrent mark_forwarded.
                    Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => {
                        warn!(id = %id, error = %e, "Submission cannot be listed");
                        batch.unreadable.push(id);
                        Vec::new()
                    }
                };

                for index in indices {
                    let entry = EntryRef { id, index };
                    if skip(&entry) {
                        continue;
                    }
                    if batch.entries.len() >= limit {
                        break 'scan;
                    }
                    batch.entries.push(entry);
                }
                batch.scanned_through = id;
                cursor = id.0;
            }
        }

        if batch.entries.len() < limit && cursor >= watermark {
            batch.scanned_through = RepositoryId(watermark.max(after.0));
        }
        Ok(batch)
    }

    /// Entry indices of a submission not yet forwarded.
    fn pending_indices(&self, id: RepositoryId) -> Result<Vec<u32>> {
        let dir = self.submission_path(id);
        let all = entry_indices(&dir)?;
        let marker = read_marker(&dir)?;
        Ok(all
            .into_iter()
            .filter(|i| !marker.forwarded.contains(i))
            .collect())
    }

    /// Attributes and payload size of one entry. Blocking.
    pub fn read_entry(&self, entry: EntryRef) -> Result<StagedEntry> {
        let dir = self.submission_path(entry.id);
        let meta_path = dir.join(format!("{}{}", entry.index, META_SUFFIX));
        let data_path = dir.join(format!("{}{}", entry.index, DATA_SUFFIX));

        let meta = fs::read(&meta_path).map_err(|e| not_found_as(e, entry))?;
        let data_meta = fs::metadata(&data_path).map_err(|e| not_found_as(e, entry))?;
        let attributes = AttributeMap::from_meta_bytes(&meta);

        let received_at = attributes
            .get_date_time(headers::RECEIVED_TIME)
            .or_else(|| data_meta.modified().ok().map(DateTime::<Utc>::from))
            .unwrap_or_else(Utc::now);

        Ok(StagedEntry {
            entry,
            attributes,
            data_size: data_meta.len(),
            received_at,
        })
    }

    /// Async form of [`read_entry`](Self::read_entry).
    pub async fn read_entry_async(&self, entry: EntryRef) -> Result<StagedEntry> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read_entry(entry)).await?
    }

    /// Open an entry's payload for reading. Blocking.
    pub fn open_entry_data(&self, entry: EntryRef) -> Result<File> {
        let path = self
            .submission_path(entry.id)
            .join(format!("{}{}", entry.index, DATA_SUFFIX));
        File::open(&path).map_err(|e| not_found_as(e, entry))
    }

    /// Record entries as delivered.
    ///
    /// A submission whose entries are all delivered is deleted; otherwise its
    /// progress marker is atomically replaced.
    pub async fn mark_forwarded(&self, entries: Vec<EntryRef>) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.mark_forwarded_blocking(&entries)).await?
    }

    fn mark_forwarded_blocking(&self, entries: &[EntryRef]) -> Result<()> {
        let mut by_id: BTreeMap<RepositoryId, Vec<u32>> = BTreeMap::new();
        for entry in entries {
            by_id.entry(entry.id).or_default().push(entry.index);
        }

        for (id, indices) in by_id {
            let dir = self.submission_path(id);
            let all: HashSet<u32> = match entry_indices(&dir) {
                Ok(all) => all.into_iter().collect(),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(id = %id, "Submission already removed");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut marker = read_marker(&dir)?;
            marker.forwarded.extend(indices);

            if all.iter().all(|i| marker.forwarded.contains(i)) {
                self.delete_blocking(id)?;
            } else {
                write_marker(&dir, &marker)?;
                debug!(
                    id = %id,
                    forwarded = marker.forwarded.len(),
                    total = all.len(),
                    "Submission partially forwarded"
                );
            }
        }
        Ok(())
    }

    /// Remove a committed submission.
    pub async fn delete(&self, id: RepositoryId) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.delete_blocking(id)).await?
    }

    fn delete_blocking(&self, id: RepositoryId) -> Result<()> {
        let dir = self.submission_path(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        dirs::prune_empty_parents(&self.inner.config.data_dir, &dir);
        Ok(())
    }

    /// Move an unreadable submission to `home/failed/`, keeping its id path.
    pub async fn quarantine(&self, id: RepositoryId) -> Result<PathBuf> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.quarantine_blocking(id)).await?
    }

    fn quarantine_blocking(&self, id: RepositoryId) -> Result<PathBuf> {
        let source = self.submission_path(id);
        let target = dirs::id_path(&self.inner.config.failed_dir(), id.0);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&source, &target)?;
        dirs::prune_empty_parents(&self.inner.config.data_dir, &source);

        metrics::QUARANTINED_TOTAL.inc();
        warn!(id = %id, path = ?target, "Moved unreadable submission aside");
        Ok(target)
    }
}

/// Writer for one submission. Nothing is visible until [`commit`](Self::commit).
pub struct StagingWriter {
    store: RepositoryStore,
    temp_path: PathBuf,
    entries: u32,
    bytes: u64,
    committed: bool,
}

impl StagingWriter {
    pub fn entry_count(&self) -> u32 {
        self.entries
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Write one entry, streaming the payload from `payload`.
    ///
    /// Returns the number of payload bytes written.
    pub fn add_entry<R: Read + ?Sized>(&mut self, attributes: &AttributeMap, payload: &mut R) -> Result<u64> {
        let index = self.entries;

        let data_path = self.temp_path.join(format!("{}{}", index, DATA_SUFFIX));
        let mut data = File::create(&data_path)?;
        let written = io::copy(payload, &mut data)?;
        data.sync_all()?;

        let meta_path = self.temp_path.join(format!("{}{}", index, META_SUFFIX));
        let mut meta = File::create(&meta_path)?;
        attributes.write_meta(&mut meta)?;
        meta.sync_all()?;

        self.entries += 1;
        self.bytes += written;
        Ok(written)
    }

    /// Atomically publish the submission and return its id.
    pub fn commit(mut self) -> Result<RepositoryId> {
        if self.entries == 0 {
            return Err(Error::EmptySubmission);
        }
        sync_dir(&self.temp_path)?;

        let id = self.store.allocate_id();
        let target = self.store.submission_path(id);
        let result = rename_into(&self.temp_path, &target);
        self.store.release_id(id);
        result?;

        self.committed = true;
        if let Some(parent) = target.parent() {
            sync_dir(parent)?;
        }

        metrics::STAGED_ENTRIES_TOTAL.inc_by(self.entries as u64);
        debug!(id = %id, entries = self.entries, bytes = self.bytes, "Submission committed");
        Ok(id)
    }
}

impl Drop for StagingWriter {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_dir_all(&self.temp_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = ?self.temp_path, error = %e, "Failed to remove uncommitted submission");
                }
            }
        }
    }
}

/// Temp file deleted when dropped.
pub struct ScratchFile {
    path: PathBuf,
    file: File,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// A fresh read handle positioned at the start.
    pub fn reopen(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Rename `from` to `to`, creating parents. Retries when a concurrent prune
/// removes a freshly created bucket directory.
fn rename_into(from: &Path, to: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < RENAME_ATTEMPTS => {
                debug!(path = ?to, attempt, "Bucket vanished during commit, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn entry_indices(dir: &Path) -> Result<Vec<u32>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = name.strip_suffix(META_SUFFIX) {
            if let Ok(index) = index.parse::<u32>() {
                indices.push(index);
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

fn read_marker(dir: &Path) -> Result<ForwardedMarker> {
    match fs::read(dir.join(MARKER_FILE)) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ForwardedMarker::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_marker(dir: &Path, marker: &ForwardedMarker) -> Result<()> {
    let temp = dir.join(MARKER_TEMP_FILE);
    let mut file = File::create(&temp)?;
    file.write_all(&serde_json::to_vec(marker)?)?;
    file.sync_all()?;
    fs::rename(&temp, dir.join(MARKER_FILE))?;
    Ok(())
}

fn ensure_writable(root: &Path) -> Result<()> {
    let unwritable = |source: io::Error| Error::Unwritable {
        path: root.to_path_buf(),
        source,
    };
    fs::create_dir_all(root).map_err(unwritable)?;
    let probe = root.join(format!(".probe-{}", Uuid::new_v4()));
    File::create(&probe)
        .and_then(|mut f| f.write_all(b"probe"))
        .map_err(unwritable)?;
    fs::remove_file(&probe).map_err(unwritable)?;
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn not_found_as(e: io::Error, entry: EntryRef) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::EntryNotFound(entry)
    } else {
        Error::Io(e)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
