//! Numbered Directory Scheme
//!
//! Staged submissions and forwarded output both live in directories named after a
//! strictly increasing id. The decimal id is left-padded to a multiple of three
//! digits and split into three-digit groups; the first path component is the
//! number of groups minus one (the depth):
//!
//! ```text
//! id 7        -> 0/007
//! id 1234     -> 1/001/234
//! id 5001002  -> 2/005/001/002
//! ```
//!
//! Every group but the last forms a coarse bucket holding up to 1000 ids, so no
//! directory grows past 1000 children. Names that are not numeric (temp dirs,
//! marker files) are ignored by every scan in this module.
//!
//! All functions here use blocking `std::fs` calls. Async callers run them on the
//! blocking pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const GROUP_WIDTH: usize = 3;
const GROUP_SPAN: u64 = 1000;

/// Path of the directory for `id` under `root`.
pub fn id_path(root: &Path, id: u64) -> PathBuf {
    let digits = id.to_string();
    let pad = (GROUP_WIDTH - digits.len() % GROUP_WIDTH) % GROUP_WIDTH;
    let padded = format!("{}{}", "0".repeat(pad), digits);
    let groups: Vec<&str> = padded
        .as_bytes()
        .chunks(GROUP_WIDTH)
        .map(|c| std::str::from_utf8(c).unwrap_or("000"))
        .collect();

    let mut path = root.join((groups.len() - 1).to_string());
    for group in groups {
        path.push(group);
    }
    path
}

/// Highest id with an existing directory under `root`, or 0 when there is none.
///
/// Buckets left empty by deletions are skipped by backtracking into the next
/// lower bucket.
pub fn max_dir_id(root: &Path) -> io::Result<u64> {
    let mut depths = numeric_children(root, false)?;
    depths.sort_unstable_by(|a, b| b.cmp(a));

    for depth in depths {
        let levels = depth as u32 + 1;
        if let Some(id) = max_below(&root.join(depth.to_string()), levels, 0)? {
            return Ok(id);
        }
    }
    Ok(0)
}

fn max_below(dir: &Path, levels: u32, prefix: u64) -> io::Result<Option<u64>> {
    let mut children = numeric_children(dir, true)?;
    children.sort_unstable_by(|a, b| b.cmp(a));

    for child in children {
        let value = prefix.saturating_mul(GROUP_SPAN).saturating_add(child);
        if levels == 1 {
            return Ok(Some(value));
        }
        if let Some(id) = max_below(&dir.join(group_name(child)), levels - 1, value)? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Ids strictly greater than `after`, ascending, at most `limit` of them.
pub fn list_ids_after(root: &Path, after: u64, limit: usize) -> io::Result<Vec<u64>> {
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }

    let mut depths = numeric_children(root, false)?;
    depths.sort_unstable();

    for depth in depths {
        let levels = depth as u32 + 1;
        let upper = GROUP_SPAN.saturating_pow(levels).saturating_sub(1);
        if upper <= after {
            continue;
        }
        collect_after(
            &root.join(depth.to_string()),
            levels,
            0,
            after,
            limit,
            &mut out,
        )?;
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

fn collect_after(
    dir: &Path,
    levels: u32,
    prefix: u64,
    after: u64,
    limit: usize,
    out: &mut Vec<u64>,
) -> io::Result<()> {
    let mut children = numeric_children(dir, true)?;
    children.sort_unstable();

    for child in children {
        if out.len() >= limit {
            return Ok(());
        }
        let value = prefix.saturating_mul(GROUP_SPAN).saturating_add(child);
        let span = GROUP_SPAN.saturating_pow(levels - 1);
        let upper = value
            .saturating_add(1)
            .saturating_mul(span)
            .saturating_sub(1);
        if upper <= after {
            continue;
        }
        if levels == 1 {
            out.push(value);
        } else {
            collect_after(&dir.join(group_name(child)), levels - 1, value, after, limit, out)?;
        }
    }
    Ok(())
}

/// Remove empty bucket directories above `leaf`, stopping at `root`.
pub fn prune_empty_parents(root: &Path, leaf: &Path) {
    let mut current = leaf.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the walk.
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Flush a directory's entries (renames, new files) to disk.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn group_name(value: u64) -> String {
    format!("{:03}", value)
}

/// Numeric child directory names. Group levels require exactly three digits.
fn numeric_children(dir: &Path, groups: bool) -> io::Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if groups && name.len() != GROUP_WIDTH {
            continue;
        }
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(value) = name.parse::<u64>() {
            out.push(value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make(root: &Path, id: u64) {
        fs::create_dir_all(id_path(root, id)).unwrap();
    }

    #[test]
    fn test_id_path_layout() {
        let root = Path::new("/data");
        assert_eq!(id_path(root, 7), PathBuf::from("/data/0/007"));
        assert_eq!(id_path(root, 999), PathBuf::from("/data/0/999"));
        assert_eq!(id_path(root, 1000), PathBuf::from("/data/1/001/000"));
        assert_eq!(id_path(root, 5001002), PathBuf::from("/data/2/005/001/002"));
    }

    #[test]
    fn test_max_dir_id_empty_root() {
        let temp = TempDir::new().unwrap();
        assert_eq!(max_dir_id(temp.path()).unwrap(), 0);
        assert_eq!(max_dir_id(&temp.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_max_dir_id_across_depths() {
        let temp = TempDir::new().unwrap();
        for id in [1, 2, 999, 1000, 1500] {
            make(temp.path(), id);
        }
        fs::create_dir_all(temp.path().join("temp")).unwrap();

        assert_eq!(max_dir_id(temp.path()).unwrap(), 1500);
    }

    #[test]
    fn test_max_dir_id_backtracks_over_empty_bucket() {
        let temp = TempDir::new().unwrap();
        make(temp.path(), 1500);
        fs::create_dir_all(temp.path().join("1/002")).unwrap();

        assert_eq!(max_dir_id(temp.path()).unwrap(), 1500);
    }

    #[test]
    fn test_list_ids_after() {
        let temp = TempDir::new().unwrap();
        for id in [3, 1, 2, 998, 1001, 2000] {
            make(temp.path(), id);
        }

        assert_eq!(
            list_ids_after(temp.path(), 0, 100).unwrap(),
            vec![1, 2, 3, 998, 1001, 2000]
        );
        assert_eq!(list_ids_after(temp.path(), 2, 3).unwrap(), vec![3, 998, 1001]);
        assert_eq!(list_ids_after(temp.path(), 1001, 10).unwrap(), vec![2000]);
        assert!(list_ids_after(temp.path(), 2000, 10).unwrap().is_empty());
    }

    #[test]
    fn test_prune_empty_parents() {
        let temp = TempDir::new().unwrap();
        make(temp.path(), 1001);
        make(temp.path(), 2001);

        let leaf = id_path(temp.path(), 1001);
        fs::remove_dir(&leaf).unwrap();
        prune_empty_parents(temp.path(), &leaf);

        assert!(!temp.path().join("1/001").exists());
        assert!(temp.path().join("1/002/001").exists());
        assert!(temp.path().exists());
    }
}
