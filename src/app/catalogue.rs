use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use chrono::Local;
use serde::Deserialize;

use super::error::{HarvestError, Result};
use super::types::{CurationDecision, GalleryResult, GalleryStatus, sku_key};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub type Entries = BTreeMap<String, Vec<String>>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Map(BTreeMap<String, Vec<String>>),
    List(Vec<LegacyEntry>),
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    sku: String,
    #[serde(default)]
    images: Vec<String>,
}

/// Outcome of folding one run's results into the catalogue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// SKUs whose result did not touch the catalogue, with the reason.
    pub skipped: Vec<(String, GalleryStatus)>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurationOutcome {
    Updated { kept: usize, dropped: usize },
    Removed,
    Unchanged,
}

const LEASE_TIMEOUT: Duration = Duration::from_secs(10);
const LEASE_STALE_AFTER: Duration = Duration::from_secs(120);

/// Sole writer of the catalogue file. Writes hold the in-process lock and a
/// lock file next to the catalogue, re-read the file, and lay this store's
/// own changes over what is on disk, so a long scrape never undoes a
/// curation committed by another process in the meantime.
#[derive(Debug)]
pub struct CatalogueStore {
    path: PathBuf,
    state: Mutex<State>,
    keep_backups: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    entries: Entries,
    /// Changes made through this store and not yet written. `None` removes.
    pending: BTreeMap<String, Option<Vec<String>>>,
}

impl State {
    fn rebased(&self, on_disk: Entries) -> Entries {
        let mut entries = on_disk;
        for (sku, change) in &self.pending {
            match change {
                Some(images) => {
                    entries.insert(sku.clone(), images.clone());
                }
                None => {
                    entries.remove(sku);
                }
            }
        }
        entries
    }
}

impl CatalogueStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = read_catalogue(&path)?;
        tracing::debug!(path = %path.display(), skus = entries.len(), "catalogue loaded");
        Ok(Self {
            path,
            state: Mutex::new(State {
                entries,
                pending: BTreeMap::new(),
            }),
            keep_backups: None,
        })
    }

    pub fn with_keep_backups(mut self, keep: Option<usize>) -> Self {
        self.keep_backups = keep;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Entries {
        self.lock().entries.clone()
    }

    pub fn get(&self, sku: &str) -> Option<Vec<String>> {
        self.lock().entries.get(&sku_key(sku)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Only `Success` results write; everything else leaves the stored
    /// entry, if any, as it was.
    pub fn merge(&self, results: &[GalleryResult]) -> MergeReport {
        let mut report = MergeReport::default();
        let mut state = self.lock();
        for result in results {
            let key = sku_key(&result.sku);
            if result.status != GalleryStatus::Success || result.images.is_empty() {
                report.skipped.push((key, result.status));
                continue;
            }
            let urls = result.image_urls();
            match state.entries.get(&key) {
                Some(existing) if *existing == urls => {
                    report.unchanged.push(key);
                    continue;
                }
                Some(_) => report.updated.push(key.clone()),
                None => report.added.push(key.clone()),
            }
            state.entries.insert(key.clone(), urls.clone());
            state.pending.insert(key, Some(urls));
        }
        report
    }

    /// Writes this store's pending changes over the current file, returning
    /// the backup of the previous file when there was one.
    pub fn persist(&self) -> Result<Option<PathBuf>> {
        self.persist_with(|from, to| fs::rename(from, to))
    }

    fn persist_with<F>(&self, replace: F) -> Result<Option<PathBuf>>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let mut state = self.lock();
        let _lease = Lease::acquire(&self.path)?;
        let merged = state.rebased(read_catalogue(&self.path)?);
        let backup = self.write_locked(&merged, replace)?;
        state.entries = merged;
        state.pending.clear();
        Ok(backup)
    }

    /// Applies one decision against the current file and persists it. A
    /// failed write leaves memory as it was, so memory and disk stay in step.
    pub fn apply_curation(&self, decision: &CurationDecision) -> Result<CurationOutcome> {
        self.apply_curation_with(decision, |from, to| fs::rename(from, to))
    }

    fn apply_curation_with<F>(&self, decision: &CurationDecision, replace: F) -> Result<CurationOutcome>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let key = sku_key(&decision.sku);
        let mut state = self.lock();
        let _lease = Lease::acquire(&self.path)?;
        let mut entries = state.rebased(read_catalogue(&self.path)?);
        let Some(stored) = entries.get(&key).cloned() else {
            state.entries = entries;
            return Err(HarvestError::UnknownSku(key));
        };

        let kept = if decision.drop_sku {
            Vec::new()
        } else {
            stored
                .iter()
                .filter(|url| decision.kept_images.contains(*url))
                .cloned()
                .collect::<Vec<_>>()
        };

        let outcome = if kept.is_empty() {
            entries.remove(&key);
            CurationOutcome::Removed
        } else if kept == stored {
            state.entries = entries;
            return Ok(CurationOutcome::Unchanged);
        } else {
            let dropped = stored.len() - kept.len();
            let kept_len = kept.len();
            entries.insert(key.clone(), kept);
            CurationOutcome::Updated {
                kept: kept_len,
                dropped,
            }
        };

        self.write_locked(&entries, replace)?;
        state.entries = entries;
        state.pending.clear();
        tracing::info!(sku = %key, outcome = ?outcome, "curation applied");
        Ok(outcome)
    }

    fn write_locked<F>(&self, entries: &Entries, replace: F) -> Result<Option<PathBuf>>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let mut bytes = serde_json::to_vec_pretty(entries)
            .map_err(|err| HarvestError::persistence(&self.path, err))?;
        bytes.push(b'\n');

        let parent = parent_dir(&self.path);
        fs::create_dir_all(&parent).map_err(|err| HarvestError::persistence(&self.path, err))?;

        let backup = if self.path.exists() {
            let backup = next_backup_path(&self.path);
            fs::copy(&self.path, &backup).map_err(|err| {
                HarvestError::persistence(&self.path, format!("backup to {} failed: {err}", backup.display()))
            })?;
            Some(backup)
        } else {
            None
        };

        let tmp = parent.join(format!(
            ".{}.tmp.{}.{}",
            file_name(&self.path),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let written = write_synced(&tmp, &bytes).and_then(|()| replace(&tmp, &self.path));
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(HarvestError::persistence(&self.path, err));
        }
        if let Ok(dir) = File::open(&parent) {
            let _ = dir.sync_all();
        }

        tracing::info!(
            path = %self.path.display(),
            skus = entries.len(),
            backup = backup.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            "catalogue written"
        );
        if let Some(keep) = self.keep_backups {
            match prune_backups(&self.path, keep) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "pruned old catalogue backups"),
                Err(err) => tracing::warn!("backup pruning failed: {err}"),
            }
        }
        Ok(backup)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cross-process write lock: a `.<file>.lock` created exclusively next to
/// the catalogue and removed on drop.
struct Lease {
    path: PathBuf,
}

impl Lease {
    fn acquire(catalogue: &Path) -> Result<Self> {
        let parent = parent_dir(catalogue);
        fs::create_dir_all(&parent).map_err(|err| HarvestError::persistence(catalogue, err))?;
        let path = parent.join(format!(".{}.lock", file_name(catalogue)));
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lease_is_stale(&path) {
                        tracing::warn!(lock = %path.display(), "removing stale catalogue lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LEASE_TIMEOUT {
                        return Err(HarvestError::persistence(
                            catalogue,
                            format!("timed out waiting for {}", path.display()),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(HarvestError::persistence(catalogue, err)),
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lease_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= LEASE_STALE_AFTER)
}

/// Missing file reads as an empty catalogue; an unreadable one is an error.
fn read_catalogue(path: &Path) -> Result<Entries> {
    match fs::read_to_string(path) {
        Ok(content) => parse_catalogue(path, &content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Entries::new()),
        Err(err) => Err(HarvestError::persistence(path, err)),
    }
}

fn parse_catalogue(path: &Path, content: &str) -> Result<Entries> {
    if content.trim().is_empty() {
        return Ok(Entries::new());
    }
    let parsed = serde_json::from_str::<OnDisk>(content)
        .map_err(|err| HarvestError::persistence(path, format!("unreadable catalogue: {err}")))?;
    let mut entries = Entries::new();
    match parsed {
        OnDisk::Map(map) => {
            for (sku, images) in map {
                entries.entry(sku_key(&sku)).or_insert(images);
            }
        }
        OnDisk::List(list) => {
            for entry in list {
                entries.entry(sku_key(&entry.sku)).or_insert(entry.images);
            }
        }
    }
    entries.retain(|sku, images| !sku.is_empty() && !images.is_empty());
    Ok(entries)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("catalogue.json")
        .to_string()
}

fn backup_prefix(path: &Path) -> String {
    format!("{}.bak.", file_name(path))
}

fn next_backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d%H%M%S%3f");
    let parent = parent_dir(path);
    let base = format!("{}{stamp}", backup_prefix(path));
    let mut candidate = parent.join(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}

/// Backups of `path`, oldest first.
pub fn list_backups(path: &Path) -> io::Result<Vec<PathBuf>> {
    let prefix = backup_prefix(path);
    let mut backups = fs::read_dir(parent_dir(path))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix))
        })
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    backups.sort_by_key(|path| backup_order(path));
    Ok(backups)
}

/// Sort key: timestamp, then collision counter (`-10` after `-9`).
fn backup_order(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let stamp = name.rsplit(".bak.").next().unwrap_or_default();
    match stamp.split_once('-') {
        Some((ts, n)) => (ts.to_string(), n.parse().unwrap_or(0)),
        None => (stamp.to_string(), 0),
    }
}

fn prune_backups(path: &Path, keep: usize) -> io::Result<usize> {
    let backups = list_backups(path)?;
    let excess = backups.len().saturating_sub(keep);
    for old in &backups[..excess] {
        fs::remove_file(old)?;
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::{ImageKind, ImageRef};
    use std::collections::HashSet;

    fn success(sku: &str, urls: &[&str]) -> GalleryResult {
        GalleryResult::success(
            sku,
            urls.iter()
                .map(|url| ImageRef::new(*url, ImageKind::Gallery))
                .collect(),
        )
    }

    fn decision(sku: &str, keep: &[&str]) -> CurationDecision {
        CurationDecision {
            sku: sku.to_string(),
            kept_images: keep.iter().map(ToString::to_string).collect::<HashSet<_>>(),
            drop_sku: false,
        }
    }

    fn read_json(path: &Path) -> serde_json::Value {
        serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(ToString::to_string))
            .filter(|name| name.contains(".tmp."))
            .collect()
    }

    #[test]
    fn missing_file_opens_empty_and_first_write_has_no_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let store = CatalogueStore::open(&path).expect("open");
        assert!(store.is_empty());

        store.merge(&[success("ab1234_001", &["https://cdn/a.jpg"])]);
        assert_eq!(store.persist().expect("persist"), None);
        assert_eq!(
            read_json(&path),
            serde_json::json!({ "AB1234-001": ["https://cdn/a.jpg"] })
        );
    }

    #[test]
    fn corrupt_catalogue_is_refused_and_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        fs::write(&path, "{not json").expect("write");

        let err = CatalogueStore::open(&path).expect_err("corrupt");
        assert!(matches!(err, HarvestError::Persistence { .. }));
        assert_eq!(fs::read_to_string(&path).expect("read"), "{not json");
    }

    #[test]
    fn legacy_list_format_loads_with_canonical_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        fs::write(
            &path,
            r#"[{"sku": "ab1_2", "images": ["https://cdn/1.jpg", "https://cdn/2.jpg"]},
                {"sku": "EMPTY", "images": []}]"#,
        )
        .expect("write");

        let store = CatalogueStore::open(&path).expect("open");
        assert_eq!(
            store.get("AB1-2"),
            Some(vec!["https://cdn/1.jpg".to_string(), "https://cdn/2.jpg".to_string()])
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_and_empty_results_never_erase_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let store = CatalogueStore::open(&path).expect("open");
        store.merge(&[
            success("A", &["https://cdn/a1.jpg", "https://cdn/a2.jpg"]),
            success("B", &["https://cdn/b1.jpg"]),
        ]);

        let report = store.merge(&[
            GalleryResult::failed("A", "navigation failed"),
            GalleryResult::empty("B"),
            GalleryResult::cancelled("C"),
        ]);
        assert!(!report.changed());
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(store.get("A").map(|v| v.len()), Some(2));
        assert_eq!(store.get("B").map(|v| v.len()), Some(1));
        assert_eq!(store.get("C"), None);
    }

    #[test]
    fn merge_reports_added_updated_and_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CatalogueStore::open(dir.path().join("images.json")).expect("open");
        store.merge(&[success("A", &["https://cdn/1.jpg"]), success("B", &["https://cdn/2.jpg"])]);

        let report = store.merge(&[
            success("A", &["https://cdn/1.jpg"]),
            success("B", &["https://cdn/3.jpg"]),
            success("C", &["https://cdn/4.jpg"]),
        ]);
        assert_eq!(report.unchanged, vec!["A"]);
        assert_eq!(report.updated, vec!["B"]);
        assert_eq!(report.added, vec!["C"]);
    }

    #[test]
    fn failed_replace_leaves_primary_intact_and_cleans_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let store = CatalogueStore::open(&path).expect("open");
        store.merge(&[success("X", &["https://cdn/a.jpg", "https://cdn/b.jpg", "https://cdn/c.jpg"])]);
        store.persist().expect("persist");
        let before = fs::read_to_string(&path).expect("read");

        let err = store
            .apply_curation_with(&decision("X", &["https://cdn/a.jpg"]), |_, _| {
                Err(io::Error::other("disk full"))
            })
            .expect_err("write must fail");
        assert!(matches!(err, HarvestError::Persistence { .. }));
        assert_eq!(fs::read_to_string(&path).expect("read"), before);
        assert!(temp_files(dir.path()).is_empty());
        // memory rolled back too
        assert_eq!(store.get("X").map(|v| v.len()), Some(3));
    }

    #[test]
    fn curation_keeps_subset_in_stored_order_with_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let store = CatalogueStore::open(&path).expect("open");
        store.merge(&[success("X", &["https://cdn/a.jpg", "https://cdn/b.jpg", "https://cdn/c.jpg"])]);
        store.persist().expect("persist");
        let previous = fs::read_to_string(&path).expect("read");

        let outcome = store
            .apply_curation(&decision("X", &["https://cdn/c.jpg", "https://cdn/a.jpg"]))
            .expect("curate");
        assert_eq!(outcome, CurationOutcome::Updated { kept: 2, dropped: 1 });
        assert_eq!(
            read_json(&path),
            serde_json::json!({ "X": ["https://cdn/a.jpg", "https://cdn/c.jpg"] })
        );

        let backups = list_backups(&path).expect("backups");
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(&backups[0]).expect("read"), previous);
    }

    #[test]
    fn noop_and_empty_decisions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let store = CatalogueStore::open(&path).expect("open");
        store.merge(&[
            success("X", &["https://cdn/a.jpg"]),
            success("Y", &["https://cdn/b.jpg"]),
        ]);
        store.persist().expect("persist");

        assert_eq!(
            store.apply_curation(&decision("X", &["https://cdn/a.jpg"])).expect("noop"),
            CurationOutcome::Unchanged
        );
        assert!(list_backups(&path).expect("backups").is_empty());

        assert_eq!(
            store.apply_curation(&decision("X", &[])).expect("drop"),
            CurationOutcome::Removed
        );
        let mut drop = decision("Y", &["https://cdn/b.jpg"]);
        drop.drop_sku = true;
        assert_eq!(store.apply_curation(&drop).expect("drop"), CurationOutcome::Removed);
        assert_eq!(read_json(&path), serde_json::json!({}));

        assert!(matches!(
            store.apply_curation(&decision("nope", &[])),
            Err(HarvestError::UnknownSku(sku)) if sku == "NOPE"
        ));
    }

    #[test]
    fn rapid_writes_keep_every_backup_until_pruned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let store = CatalogueStore::open(&path).expect("open");
        for round in 0..4 {
            let url = format!("https://cdn/{round}.jpg");
            store.merge(&[success("A", &[url.as_str()])]);
            store.persist().expect("persist");
        }
        let backups = list_backups(&path).expect("backups");
        assert_eq!(backups.len(), 3);

        // newest backup holds the third write
        let newest = read_json(backups.last().expect("newest"));
        assert_eq!(newest, serde_json::json!({ "A": ["https://cdn/2.jpg"] }));

        let store = CatalogueStore::open(&path).expect("reopen").with_keep_backups(Some(2));
        store.merge(&[success("A", &["https://cdn/final.jpg"])]);
        store.persist().expect("persist");
        let kept = list_backups(&path).expect("backups");
        assert_eq!(kept.len(), 2);
        assert_eq!(
            read_json(kept.last().expect("newest")),
            serde_json::json!({ "A": ["https://cdn/3.jpg"] })
        );
    }

    #[test]
    fn backup_order_sorts_collision_counters_numerically() {
        let a = backup_order(Path::new("images.json.bak.20261019101010123-9"));
        let b = backup_order(Path::new("images.json.bak.20261019101010123-10"));
        let c = backup_order(Path::new("images.json.bak.20261019101010124"));
        assert!(a < b && b < c);
    }
    #[test]
    fn long_running_store_keeps_curation_committed_by_another_writer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let seed = CatalogueStore::open(&path).expect("open");
        seed.merge(&[success("X", &["https://cdn/a.jpg", "https://cdn/b.jpg"])]);
        seed.persist().expect("persist");

        let scrape_side = CatalogueStore::open(&path).expect("open scrape side");
        let curate_side = CatalogueStore::open(&path).expect("open curate side");
        curate_side
            .apply_curation(&decision("X", &["https://cdn/a.jpg"]))
            .expect("curate");

        scrape_side.merge(&[success("Y", &["https://cdn/y.jpg"])]);
        scrape_side.persist().expect("persist");

        assert_eq!(
            read_json(&path),
            serde_json::json!({ "X": ["https://cdn/a.jpg"], "Y": ["https://cdn/y.jpg"] })
        );
        assert_eq!(scrape_side.get("X"), Some(vec!["https://cdn/a.jpg".to_string()]));
        assert!(!dir.path().join(".images.json.lock").exists());
    }

    #[test]
    fn own_changes_win_for_skus_this_store_rewrote() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let seed = CatalogueStore::open(&path).expect("open");
        seed.merge(&[success("X", &["https://cdn/a.jpg", "https://cdn/b.jpg"])]);
        seed.persist().expect("persist");

        let scrape_side = CatalogueStore::open(&path).expect("open");
        CatalogueStore::open(&path)
            .expect("open")
            .apply_curation(&decision("X", &["https://cdn/a.jpg"]))
            .expect("curate");
        scrape_side.merge(&[success("X", &["https://cdn/new.jpg"])]);
        scrape_side.persist().expect("persist");

        assert_eq!(read_json(&path), serde_json::json!({ "X": ["https://cdn/new.jpg"] }));
    }

    #[test]
    fn stale_lock_file_does_not_block_writes_forever() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let lock = dir.path().join(".images.json.lock");
        fs::write(&lock, "").expect("lock");
        let old = SystemTime::now() - LEASE_STALE_AFTER - Duration::from_secs(5);
        File::options()
            .write(true)
            .open(&lock)
            .expect("open lock")
            .set_modified(old)
            .expect("age lock");

        let store = CatalogueStore::open(&path).expect("open");
        store.merge(&[success("A", &["https://cdn/a.jpg"])]);
        store.persist().expect("persist");
        assert!(!lock.exists());
    }

    #[test]
    fn run_results_land_in_catalogue_file_after_merge_and_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("images.json");
        let first = [
            "https://cdn.example/ab1234/1.jpg",
            "https://cdn.example/ab1234/2.jpg",
            "https://cdn.example/ab1234/3.jpg",
        ];

        // fresh catalogue: the empty SKU gets no entry
        let store = CatalogueStore::open(&path).expect("open");
        let results = vec![success("AB1234-001", &first), GalleryResult::empty("CD5678-002")];
        let report = store.merge(&results);
        assert_eq!(report.added, vec!["AB1234-001"]);
        assert_eq!(report.skipped, vec![("CD5678-002".to_string(), GalleryStatus::Empty)]);
        store.persist().expect("persist");
        assert_eq!(read_json(&path), serde_json::json!({ "AB1234-001": first }));

        // prior entry for the empty SKU survives unchanged
        fs::write(
            &path,
            r#"{"CD5678-002": ["https://cdn.example/cd5678/old.jpg"]}"#,
        )
        .expect("seed");
        let store = CatalogueStore::open(&path).expect("reopen");
        store.merge(&results);
        store.persist().expect("persist");
        assert_eq!(
            read_json(&path),
            serde_json::json!({
                "AB1234-001": first,
                "CD5678-002": ["https://cdn.example/cd5678/old.jpg"],
            })
        );
        assert_eq!(list_backups(&path).expect("backups").len(), 1);
    }
}
