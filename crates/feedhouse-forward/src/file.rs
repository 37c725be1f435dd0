//! Local File Destination
//!
//! Drops each aggregate into a numbered directory under the configured root:
//!
//! ```text
//! <root>/0/001/proxy.zip    aggregate container
//! <root>/0/001/proxy.meta   aggregate attributes
//! <root>/temp/<uuid>/       in-flight copy, renamed into place when complete
//! ```
//!
//! Output ids continue from the highest existing directory after a restart.

use async_trait::async_trait;
use feedhouse_core::dirs;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::traits::{AggregateFile, Destination};

pub const OUTPUT_DATA_FILE: &str = "proxy.zip";
pub const OUTPUT_META_FILE: &str = "proxy.meta";
const TEMP_DIR: &str = "temp";

pub struct FileDestination {
    name: String,
    inner: Arc<FileInner>,
}

struct FileInner {
    root: PathBuf,
    last_id: AtomicU64,
}

impl FileDestination {
    /// Create the output root, clear stale temp copies and recover the last id.
    pub async fn open(name: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let recovered = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || -> io::Result<u64> {
                fs::create_dir_all(&root)?;
                let temp = root.join(TEMP_DIR);
                if temp.exists() {
                    fs::remove_dir_all(&temp)?;
                }
                fs::create_dir_all(&temp)?;
                dirs::max_dir_id(&root)
            })
            .await??
        };

        info!(destination = name, path = ?root, last_id = recovered, "File destination opened");
        Ok(Self {
            name: name.to_string(),
            inner: Arc::new(FileInner {
                root,
                last_id: AtomicU64::new(recovered),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Highest output id written so far.
    pub fn last_id(&self) -> u64 {
        self.inner.last_id.load(Ordering::Acquire)
    }
}

impl FileInner {
    /// Copy the aggregate into a fresh staging directory. Blocking.
    fn stage(&self, aggregate: &AggregateFile) -> Result<PathBuf> {
        let staging = self.root.join(TEMP_DIR).join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging)?;

        let result = write_staged(&staging, aggregate);
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result.map(|()| staging)
    }

    /// Move a complete staging directory to the next output id.
    fn publish(&self, staging: &Path) -> Result<(u64, PathBuf)> {
        let id = self.last_id.fetch_add(1, Ordering::AcqRel) + 1;
        let target = dirs::id_path(&self.root, id);
        let parent = target.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(parent)?;
        fs::rename(staging, &target)?;
        dirs::sync_dir(parent)?;
        Ok((id, target))
    }
}

fn write_staged(staging: &Path, aggregate: &AggregateFile) -> Result<()> {
    let data_path = staging.join(OUTPUT_DATA_FILE);
    fs::copy(&aggregate.path, &data_path)?;
    File::open(&data_path)?.sync_all()?;

    let meta_path = staging.join(OUTPUT_META_FILE);
    let mut meta = File::create(&meta_path)?;
    aggregate.attributes.write_meta(&mut meta)?;
    meta.sync_all()?;
    Ok(())
}

#[async_trait]
impl Destination for FileDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, aggregate: &AggregateFile) -> Result<()> {
        let staging = {
            let inner = self.inner.clone();
            let aggregate = aggregate.clone();
            tokio::task::spawn_blocking(move || inner.stage(&aggregate)).await??
        };
        // Publishing does not await, so a cancelled delivery leaves only a temp copy.
        let (id, path) = self.inner.publish(&staging)?;
        debug!(destination = %self.name, id, path = ?path, "Aggregate written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedhouse_core::AttributeMap;
    use tempfile::TempDir;

    fn aggregate(dir: &Path, body: &[u8]) -> AggregateFile {
        let path = dir.join(format!("{}.zip", Uuid::new_v4()));
        fs::write(&path, body).unwrap();
        AggregateFile {
            path,
            attributes: [("Feed", "F"), ("Type", "Raw Events")].into_iter().collect::<AttributeMap>(),
            item_count: 1,
            uncompressed_bytes: body.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_file_destination_writes_numbered_output() {
        let temp = TempDir::new().unwrap();
        let dest = FileDestination::open("local", temp.path().join("out"))
            .await
            .unwrap();

        dest.deliver(&aggregate(temp.path(), b"one")).await.unwrap();
        dest.deliver(&aggregate(temp.path(), b"two")).await.unwrap();

        assert_eq!(dest.last_id(), 2);
        let second = dirs::id_path(dest.root(), 2);
        assert_eq!(fs::read(second.join(OUTPUT_DATA_FILE)).unwrap(), b"two");
        let meta = fs::read_to_string(second.join(OUTPUT_META_FILE)).unwrap();
        assert!(meta.contains("Feed:F"));
    }

    #[tokio::test]
    async fn test_file_destination_recovers_ids() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("out");
        {
            let dest = FileDestination::open("local", &root).await.unwrap();
            for _ in 0..3 {
                dest.deliver(&aggregate(temp.path(), b"x")).await.unwrap();
            }
        }
        // A crashed copy from the previous run.
        fs::create_dir_all(root.join(TEMP_DIR).join("stale")).unwrap();

        let dest = FileDestination::open("local", &root).await.unwrap();
        assert_eq!(dest.last_id(), 3);
        assert!(!root.join(TEMP_DIR).join("stale").exists());

        dest.deliver(&aggregate(temp.path(), b"y")).await.unwrap();
        assert!(dirs::id_path(&root, 4).exists());
    }

    #[tokio::test]
    async fn test_file_destination_abandoned_delivery_is_not_published() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("out");
        let dest = FileDestination::open("local", &root).await.unwrap();

        let attempt = tokio::time::timeout(
            std::time::Duration::ZERO,
            dest.deliver(&aggregate(temp.path(), b"late")),
        )
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let published = u64::from(matches!(attempt, Ok(Ok(()))));
        assert_eq!(dirs::max_dir_id(&root).unwrap(), published);

        dest.deliver(&aggregate(temp.path(), b"retry")).await.unwrap();
        assert_eq!(dest.last_id(), published + 1);
        let retried = dirs::id_path(&root, published + 1);
        assert_eq!(fs::read(retried.join(OUTPUT_DATA_FILE)).unwrap(), b"retry");
    }

    #[tokio::test]
    async fn test_file_destination_missing_source_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let dest = FileDestination::open("local", temp.path().join("out"))
            .await
            .unwrap();

        let mut missing = aggregate(temp.path(), b"x");
        missing.path = temp.path().join("does-not-exist.zip");

        assert!(dest.deliver(&missing).await.is_err());
        assert_eq!(dest.last_id(), 0);
        assert_eq!(fs::read_dir(dest.root().join(TEMP_DIR)).unwrap().count(), 0);
    }
}
