//! On-disk evidence layout.
//!
//! ```text
//! <root>/
//!   cats/     20240101_120000.jpg  20240101_120000.json
//!   dogs/     ...
//!   unknown/  ...
//! ```
//!
//! Each entry is a JPEG plus a same-stem JSON sidecar. The image is always
//! written before the sidecar and removed before it, and a store-wide lock
//! serialises writes, deletions and capacity passes so no scan observes a
//! half-written or half-deleted pair.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::detect::DetectionRecord;

pub const IMAGE_EXT: &str = "jpg";
pub const METADATA_EXT: &str = "json";
const TMP_SUFFIX: &str = "tmp";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Cats,
    Dogs,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Cats, Category::Dogs, Category::Unknown];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Cats => "cats",
            Category::Dogs => "dogs",
            Category::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "cats" => Ok(Category::Cats),
            "dogs" => Ok(Category::Dogs),
            "unknown" => Ok(Category::Unknown),
            other => Err(anyhow!("unknown evidence category '{}'", other)),
        }
    }
}

/// Sidecar contents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub timestamp: String,
    pub category: Category,
    pub detections: Vec<DetectionRecord>,
    pub filename: String,
}

impl EvidenceMetadata {
    /// Accepts RFC 3339 timestamps and, for older sidecars, naive local ISO 8601.
    pub fn parsed_timestamp(&self) -> Result<DateTime<FixedOffset>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Ok(ts);
        }
        let naive = NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .with_context(|| format!("unparseable evidence timestamp '{}'", self.timestamp))?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.fixed_offset())
            .ok_or_else(|| {
                anyhow!(
                    "evidence timestamp '{}' is not a valid local time",
                    self.timestamp
                )
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvidenceEntry {
    pub id: String,
    pub timestamp: DateTime<FixedOffset>,
    pub category: Category,
    pub detections: Vec<DetectionRecord>,
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl EvidenceEntry {
    pub fn filename(&self) -> String {
        format!("{}.{}", self.id, IMAGE_EXT)
    }
}

#[derive(Clone, Debug, Default)]
pub struct EvidenceListing {
    pub entries: Vec<EvidenceEntry>,
    /// Entries matching the filter before `limit` was applied.
    pub total: usize,
}

/// One image/sidecar pair as found on disk, either half possibly missing.
#[derive(Clone, Debug)]
pub(crate) struct StoredPair {
    pub category: Category,
    pub id: String,
    pub captured_at: DateTime<Utc>,
    pub image: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct EvidenceStore {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create the root and category directories.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        store.ensure_layout()?;
        Ok(store)
    }

    /// Create the category directories and drop sidecar temp files left by
    /// an earlier run.
    pub fn ensure_layout(&self) -> Result<()> {
        let _guard = self.lock();
        for category in Category::ALL {
            let dir = self.category_dir(category);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create evidence directory {}", dir.display()))?;
        }
        let removed = self.clear_leftovers()?;
        if removed > 0 {
            log::info!("removed {} interrupted write(s) from {}", removed, self.root.display());
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.as_str())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entries sorted newest first, at most `limit` of them.
    pub fn enumerate(&self, category: Option<Category>, limit: usize) -> Result<EvidenceListing> {
        let _guard = self.lock();
        let categories: Vec<Category> = match category {
            Some(category) => vec![category],
            None => Category::ALL.to_vec(),
        };

        let mut entries = Vec::new();
        for category in categories {
            let dir = self.category_dir(category);
            let read_dir = match fs::read_dir(&dir) {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("read evidence directory {}", dir.display())))
                }
            };
            for dir_entry in read_dir {
                let path = dir_entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
                    continue;
                }
                match read_entry(category, &path) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => log::warn!("skipping {}: {:#}", path.display(), err),
                }
            }
        }

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        let total = entries.len();
        entries.truncate(limit);
        Ok(EvidenceListing { entries, total })
    }

    /// Remove one entry's image and sidecar. Absent files are not an error.
    pub fn delete(&self, category: Category, id: &str) -> Result<()> {
        validate_id(id)?;
        let _guard = self.lock();
        let dir = self.category_dir(category);
        remove_pair_files(
            &dir.join(format!("{}.{}", id, IMAGE_EXT)),
            &dir.join(format!("{}.{}", id, METADATA_EXT)),
        )
    }

    /// Resolve a stored image for serving. Rejects anything that is not a
    /// plain `<id>.jpg` name.
    pub fn image_path(&self, category: Category, filename: &str) -> Result<PathBuf> {
        let id = filename
            .strip_suffix(&format!(".{}", IMAGE_EXT))
            .ok_or_else(|| anyhow!("evidence images must be .{} files", IMAGE_EXT))?;
        validate_id(id)?;
        Ok(self.category_dir(category).join(filename))
    }

    /// Total bytes of every file under the root.
    pub fn usage_bytes(&self) -> Result<u64> {
        dir_size(&self.root)
    }

    pub(crate) fn pair_exists(&self, id: &str) -> bool {
        Category::ALL.iter().any(|&category| {
            let dir = self.category_dir(category);
            dir.join(format!("{}.{}", id, IMAGE_EXT)).exists()
                || dir.join(format!("{}.{}", id, METADATA_EXT)).exists()
        })
    }

    /// Every pair on disk, orphans included. Caller holds the lock.
    pub(crate) fn scan_pairs(&self) -> Result<Vec<StoredPair>> {
        let mut pairs = Vec::new();
        for category in Category::ALL {
            let dir = self.category_dir(category);
            let read_dir = match fs::read_dir(&dir) {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            let mut by_id: BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
            for dir_entry in read_dir {
                let path = dir_entry?.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let slot = match path.extension().and_then(|e| e.to_str()) {
                    Some(IMAGE_EXT) => 0,
                    Some(METADATA_EXT) => 1,
                    _ => continue,
                };
                let pair = by_id.entry(stem.to_string()).or_default();
                if slot == 0 {
                    pair.0 = Some(path);
                } else {
                    pair.1 = Some(path);
                }
            }

            for (id, (image, metadata)) in by_id {
                let captured_at = pair_timestamp(image.as_deref(), metadata.as_deref());
                pairs.push(StoredPair {
                    category,
                    id,
                    captured_at,
                    image,
                    metadata,
                });
            }
        }
        Ok(pairs)
    }

    /// Delete `*.tmp` files from the category directories. Caller holds the
    /// lock, so none of them belongs to a write in progress.
    pub(crate) fn clear_leftovers(&self) -> Result<usize> {
        let mut removed = 0;
        for category in Category::ALL {
            let dir = self.category_dir(category);
            let read_dir = match fs::read_dir(&dir) {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for dir_entry in read_dir {
                let dir_entry = dir_entry?;
                let path = dir_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(TMP_SUFFIX)
                    || !dir_entry.file_type()?.is_file()
                {
                    continue;
                }
                match remove_if_present(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => log::warn!("{:#}", err),
                }
            }
        }
        Ok(removed)
    }

    /// Remove a scanned pair, image first. Caller holds the lock.
    pub(crate) fn remove_pair(&self, pair: &StoredPair) -> Result<()> {
        let dir = self.category_dir(pair.category);
        let image = pair
            .image
            .clone()
            .unwrap_or_else(|| dir.join(format!("{}.{}", pair.id, IMAGE_EXT)));
        let metadata = pair
            .metadata
            .clone()
            .unwrap_or_else(|| dir.join(format!("{}.{}", pair.id, METADATA_EXT)));
        remove_pair_files(&image, &metadata)
    }
}

fn read_entry(category: Category, metadata_path: &Path) -> Result<EvidenceEntry> {
    let raw = fs::read_to_string(metadata_path)?;
    let metadata: EvidenceMetadata = serde_json::from_str(&raw).context("invalid sidecar")?;
    let id = metadata_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("sidecar has no usable stem"))?
        .to_string();
    Ok(EvidenceEntry {
        timestamp: metadata.parsed_timestamp()?,
        image_path: metadata_path.with_extension(IMAGE_EXT),
        metadata_path: metadata_path.to_path_buf(),
        detections: metadata.detections,
        category,
        id,
    })
}

/// Capture time from the sidecar, falling back to the oldest file mtime.
fn pair_timestamp(image: Option<&Path>, metadata: Option<&Path>) -> DateTime<Utc> {
    if let Some(path) = metadata {
        let parsed = fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<EvidenceMetadata>(&raw).ok())
            .and_then(|meta| meta.parsed_timestamp().ok());
        if let Some(ts) = parsed {
            return ts.with_timezone(&Utc);
        }
    }
    [image, metadata]
        .into_iter()
        .flatten()
        .filter_map(|path| fs::metadata(path).and_then(|m| m.modified()).ok())
        .min()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn remove_pair_files(image: &Path, metadata: &Path) -> Result<()> {
    remove_if_present(image)?;
    remove_if_present(metadata)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow::Error::new(err).context(format!("remove {}", path.display()))),
    }
}

pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("evidence id cannot be empty"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!("evidence id must be [A-Za-z0-9_-] only"));
    }
    Ok(())
}

fn dir_size(path: &Path) -> Result<u64> {
    let read_dir = match fs::read_dir(path) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut total = 0u64;
    for entry in read_dir {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            // Files can vanish between listing and stat under an external delete.
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Create `path`, failing if it already exists. A partial file is removed
/// on error.
pub(crate) fn write_new(path: &Path, data: &[u8]) -> Result<()> {
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    fill(file, data)
        .with_context(|| format!("write {}", path.display()))
        .inspect_err(|_| discard(path))
}

/// Write `<path>.tmp` and rename it over `path`. The temp file is removed on
/// error.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".");
    tmp_name.push(TMP_SUFFIX);
    let tmp_path = PathBuf::from(tmp_name);
    let file =
        File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    fill(file, data)
        .with_context(|| format!("write {}", tmp_path.display()))
        .and_then(|()| {
            fs::rename(&tmp_path, path)
                .with_context(|| format!("rename into {}", path.display()))
        })
        .inspect_err(|_| discard(&tmp_path))
}

fn fill(mut file: File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data)?;
    file.sync_all()
}

fn discard(path: &Path) {
    if let Err(err) = remove_if_present(path) {
        log::warn!("{:#}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionType;

    fn put(store: &EvidenceStore, category: Category, id: &str, ts: &str) -> Result<()> {
        let dir = store.category_dir(category);
        fs::write(dir.join(format!("{id}.jpg")), b"jpeg")?;
        let meta = EvidenceMetadata {
            timestamp: ts.to_string(),
            category,
            detections: vec![DetectionRecord {
                kind: DetectionType::Cat,
                confidence: 0.8,
                bbox: [0.0, 0.0, 1.0, 1.0],
            }],
            filename: format!("{id}.jpg"),
        };
        fs::write(dir.join(format!("{id}.json")), serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    #[test]
    fn ensure_layout_creates_categories() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path().join("data"))?;
        for category in Category::ALL {
            assert!(store.category_dir(category).is_dir());
        }
        Ok(())
    }

    #[test]
    fn enumerate_sorts_newest_first_and_limits() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        put(&store, Category::Cats, "20240101_100000", "2024-01-01T10:00:00+00:00")?;
        put(&store, Category::Dogs, "20240101_120000", "2024-01-01T12:00:00+00:00")?;
        put(&store, Category::Unknown, "20240101_110000", "2024-01-01T11:00:00+00:00")?;

        let all = store.enumerate(None, 2)?;
        assert_eq!(all.total, 3);
        let ids: Vec<_> = all.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["20240101_120000", "20240101_110000"]);

        let cats = store.enumerate(Some(Category::Cats), 10)?;
        assert_eq!(cats.total, 1);
        assert_eq!(cats.entries[0].category, Category::Cats);
        assert_eq!(cats.entries[0].detections[0].kind, DetectionType::Cat);
        Ok(())
    }

    #[test]
    fn enumerate_skips_corrupt_sidecars() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        put(&store, Category::Cats, "good", "2024-01-01T10:00:00+00:00")?;
        fs::write(store.category_dir(Category::Cats).join("bad.json"), b"{not json")?;
        let listing = store.enumerate(None, 10)?;
        assert_eq!(listing.total, 1);
        Ok(())
    }

    #[test]
    fn naive_timestamps_are_accepted() -> Result<()> {
        let meta = EvidenceMetadata {
            timestamp: "2024-03-05T07:08:09.123456".to_string(),
            category: Category::Unknown,
            detections: vec![],
            filename: "x.jpg".to_string(),
        };
        let ts = meta.parsed_timestamp()?;
        assert_eq!(ts.naive_local().to_string(), "2024-03-05 07:08:09.123456");
        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        put(&store, Category::Dogs, "20240101_100000", "2024-01-01T10:00:00+00:00")?;

        store.delete(Category::Dogs, "20240101_100000")?;
        store.delete(Category::Dogs, "20240101_100000")?;

        let dir = store.category_dir(Category::Dogs);
        assert!(!dir.join("20240101_100000.jpg").exists());
        assert!(!dir.join("20240101_100000.json").exists());
        Ok(())
    }

    #[test]
    fn rejects_traversal() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        assert!(store.delete(Category::Cats, "../secret").is_err());
        assert!(store.image_path(Category::Cats, "../x.jpg").is_err());
        assert!(store.image_path(Category::Cats, "a.json").is_err());
        assert!(store.image_path(Category::Cats, "a_1.jpg").is_ok());
        Ok(())
    }

    #[test]
    fn usage_counts_every_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        fs::write(store.category_dir(Category::Cats).join("a.jpg"), vec![0u8; 100])?;
        fs::write(store.category_dir(Category::Dogs).join("b.json"), vec![0u8; 23])?;
        assert_eq!(store.usage_bytes()?, 123);
        Ok(())
    }

    #[test]
    fn scan_pairs_reports_orphans() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        put(&store, Category::Cats, "full", "2024-01-01T10:00:00+00:00")?;
        fs::write(store.category_dir(Category::Cats).join("orphan.jpg"), b"jpeg")?;

        let pairs = store.scan_pairs()?;
        assert_eq!(pairs.len(), 2);
        let orphan = pairs.iter().find(|p| p.id == "orphan").unwrap();
        assert!(orphan.image.is_some());
        assert!(orphan.metadata.is_none());
        Ok(())
    }

    #[test]
    fn write_new_refuses_to_overwrite() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("x.jpg");
        write_new(&path, b"one")?;
        assert!(write_new(&path, b"two").is_err());
        assert_eq!(fs::read(&path)?, b"one");
        Ok(())
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("x.json");
        fs::create_dir(&path)?;
        assert!(write_atomic(&path, b"{}").is_err());
        assert!(!temp.path().join("x.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn reopening_clears_interrupted_writes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        put(&store, Category::Cats, "20240101_100000", "2024-01-01T10:00:00+00:00")?;
        let leftover = store.category_dir(Category::Dogs).join("20240101_110000.json.tmp");
        fs::write(&leftover, vec![0u8; 1000])?;

        let store = EvidenceStore::open(temp.path())?;
        assert!(!leftover.exists());
        assert_eq!(store.enumerate(None, 10)?.total, 1);
        Ok(())
    }
}
