use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::ImageRecord;
use crate::error::{IndexError, StoreError};

/// Append-only id → record map.
///
/// When opened on a path every accepted record is appended as one JSON line
/// before it becomes visible; reopening replays the file. All access goes
/// through one mutex, so the store can be shared behind an `Arc`.
#[derive(Debug)]
pub struct LineageStore {
    path: Option<PathBuf>,
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<String, ImageRecord>,
    last_minted: u64,
}

impl StoreInner {
    fn note_id(&mut self, id: &str) {
        if let Ok(numeric) = id.parse::<u64>() {
            self.last_minted = self.last_minted.max(numeric);
        }
    }
}

impl LineageStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut inner = StoreInner::default();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed = serde_json::from_str::<Value>(line)
                    .map_err(StoreError::from)
                    .and_then(ImageRecord::from_row);
                match parsed {
                    Ok(record) => {
                        if inner.records.contains_key(&record.id) {
                            tracing::warn!(
                                id = %record.id,
                                line = lineno + 1,
                                "duplicate record id in store file; keeping first"
                            );
                            continue;
                        }
                        inner.note_id(&record.id);
                        inner.records.insert(record.id.clone(), record);
                    }
                    Err(err) => {
                        tracing::warn!(
                            line = lineno + 1,
                            error = %err,
                            "skipping unreadable store line"
                        );
                    }
                }
            }
        }
        tracing::debug!(
            path = %path.display(),
            records = inner.records.len(),
            "lineage store opened"
        );
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Issues an id no earlier record can hold: the current unix second, or one
    /// past the largest id seen so far when that is later.
    pub fn mint_id(&self) -> String {
        let mut inner = self.lock();
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        let next = now.max(inner.last_minted + 1);
        inner.last_minted = next;
        next.to_string()
    }

    pub fn put(&self, record: ImageRecord) -> Result<(), StoreError> {
        record.check_storable()?;
        let mut inner = self.lock();
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        if let Some(path) = &self.path {
            let line = serde_json::to_string(&record.to_row()?)?;
            append_line(path, &line)?;
        }
        inner.note_id(&record.id);
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<ImageRecord> {
        self.lock().records.get(id).cloned()
    }

    /// Most recently created record, used to resume the remote session.
    pub fn get_latest(&self) -> Option<ImageRecord> {
        self.lock()
            .records
            .values()
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| compare_ids(&a.id, &b.id))
            })
            .cloned()
    }

    pub fn validate_index(&self, id: &str, index: usize) -> Result<(), IndexError> {
        let inner = self.lock();
        let record = inner.records.get(id).ok_or(IndexError::UnknownId)?;
        let count = record.urls.len();
        if count == 0 {
            return Err(IndexError::NoImages);
        }
        if index < 1 || index > count {
            return Err(IndexError::OutOfRange { count });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn children_of(&self, id: &str) -> Vec<ImageRecord> {
        let mut children = self
            .lock()
            .records
            .values()
            .filter(|record| record.parent_id.as_deref() == Some(id))
            .cloned()
            .collect::<Vec<_>>();
        children.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| compare_ids(&a.id, &b.id))
        });
        children
    }

    /// Ancestors of `id`, nearest first. Stops at the first parent that is no
    /// longer held (purged or never stored).
    pub fn lineage(&self, id: &str) -> Vec<ImageRecord> {
        let inner = self.lock();
        let mut chain: Vec<ImageRecord> = Vec::new();
        let mut cursor = inner.records.get(id).and_then(|record| record.parent_id.clone());
        while let Some(parent_id) = cursor {
            if chain.iter().any(|seen| seen.id == parent_id) {
                break;
            }
            let Some(parent) = inner.records.get(&parent_id) else {
                break;
            };
            cursor = parent.parent_id.clone();
            chain.push(parent.clone());
        }
        chain
    }

    /// Drops records created before `cutoff` and compacts the backing file.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let expired = inner
            .records
            .values()
            .filter(|record| record.created_at < cutoff)
            .map(|record| record.id.clone())
            .collect::<Vec<_>>();
        if expired.is_empty() {
            return Ok(0);
        }

        if let Some(path) = &self.path {
            let mut body = String::new();
            for record in inner.records.values() {
                if record.created_at < cutoff {
                    continue;
                }
                body.push_str(&serde_json::to_string(&record.to_row()?)?);
                body.push('\n');
            }
            let staging = path.with_extension("jsonl.tmp");
            std::fs::write(&staging, body)?;
            std::fs::rename(&staging, path)?;
        }

        for id in &expired {
            inner.records.remove(id);
        }
        Ok(expired.len())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Every mutation completes before the map is touched, so a poisoned
        // guard still holds a consistent map.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background housekeeping: every `interval`, purge records older than
/// `window`. The thread exits once the store has been dropped.
pub fn spawn_retention_sweeper(
    store: &Arc<LineageStore>,
    window: chrono::Duration,
    interval: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(store);
    thread::spawn(move || loop {
        thread::sleep(interval);
        let Some(store) = weak.upgrade() else {
            break;
        };
        match store.purge_older_than(Utc::now() - window) {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "retention sweep removed expired records"),
            Err(err) => tracing::warn!(error = %err, "retention sweep failed"),
        }
    })
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => a.cmp(b),
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::{Duration as ChronoDuration, Utc};

    use super::{spawn_retention_sweeper, LineageStore};
    use crate::error::{IndexError, StoreError};
    use crate::records::fixtures::generate_record;

    #[test]
    fn latest_is_max_created_at() -> anyhow::Result<()> {
        let store = LineageStore::in_memory();
        assert!(store.get_latest().is_none());

        let now = Utc::now();
        store.put(generate_record("10", &["u"], now - ChronoDuration::seconds(30)))?;
        store.put(generate_record("11", &["u"], now))?;
        store.put(generate_record("12", &["u"], now - ChronoDuration::seconds(5)))?;

        assert_eq!(store.get_latest().map(|r| r.id), Some("11".to_string()));
        Ok(())
    }

    #[test]
    fn duplicate_ids_are_refused() -> anyhow::Result<()> {
        let store = LineageStore::in_memory();
        store.put(generate_record("7", &["u"], Utc::now()))?;
        let err = store.put(generate_record("7", &["v"], Utc::now()));
        assert!(matches!(err, Err(StoreError::DuplicateId(id)) if id == "7"));
        assert_eq!(store.get("7").map(|r| r.urls), Some(vec!["u".to_string()]));
        Ok(())
    }

    #[test]
    fn validate_index_reports_image_count() -> anyhow::Result<()> {
        let store = LineageStore::in_memory();
        store.put(generate_record("1", &["a", "b", "c", "d"], Utc::now()))?;

        assert_eq!(store.validate_index("1", 1), Ok(()));
        assert_eq!(store.validate_index("1", 4), Ok(()));
        assert_eq!(
            store.validate_index("1", 0),
            Err(IndexError::OutOfRange { count: 4 })
        );
        let err = store.validate_index("1", 5).unwrap_err();
        assert_eq!(err.to_string(), "index out of range, only 4 images");
        assert_eq!(store.validate_index("nope", 1), Err(IndexError::UnknownId));
        Ok(())
    }

    #[test]
    fn records_without_images_never_enter_the_store() {
        let store = LineageStore::in_memory();
        let mut record = generate_record("1", &["a"], Utc::now());
        record.urls.clear();
        assert!(matches!(store.put(record), Err(StoreError::InvalidRecord { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn minted_ids_never_collide() -> anyhow::Result<()> {
        let store = Arc::new(LineageStore::in_memory());
        let far_future = (Utc::now().timestamp() + 1_000).to_string();
        store.put(generate_record(&far_future, &["u"], Utc::now()))?;

        let handles = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || (0..50).map(|_| store.mint_id()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();
        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle
                .join()
                .map_err(|_| anyhow::anyhow!("minting thread panicked"))?;
            for id in ids {
                assert!(id.parse::<u64>()? > far_future.parse::<u64>()?);
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 200);
        Ok(())
    }

    #[test]
    fn reopen_replays_file_and_skips_garbage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage").join("images.jsonl");
        {
            let store = LineageStore::open(&path)?;
            store.put(generate_record("100", &["a", "b"], Utc::now()))?;
            let mut child = generate_record("101", &["c"], Utc::now());
            child.parent_id = Some("100".to_string());
            store.put(child)?;
        }
        let mut raw = std::fs::read_to_string(&path)?;
        raw.push_str("{not json\n");
        std::fs::write(&path, raw)?;

        let reopened = LineageStore::open(&path)?;
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.get("101").and_then(|r| r.parent_id),
            Some("100".to_string())
        );
        assert_eq!(reopened.lineage("101").len(), 1);
        assert_eq!(reopened.children_of("100").len(), 1);
        assert!(reopened.mint_id().parse::<u64>()? > 101);
        Ok(())
    }

    #[test]
    fn purge_drops_expired_records_and_compacts_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("images.jsonl");
        let store = LineageStore::open(&path)?;
        let now = Utc::now();
        store.put(generate_record("1", &["old"], now - ChronoDuration::days(10)))?;
        store.put(generate_record("2", &["new"], now))?;

        let purged = store.purge_older_than(now - ChronoDuration::days(7))?;
        assert_eq!(purged, 1);
        assert!(store.get("1").is_none());
        assert_eq!(store.purge_older_than(now - ChronoDuration::days(7))?, 0);

        let reopened = LineageStore::open(&path)?;
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get("2").is_some());
        Ok(())
    }

    #[test]
    fn concurrent_puts_land_once_each_on_disk() -> anyhow::Result<()> {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 25;

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("images.jsonl");
        let store = Arc::new(LineageStore::open(&path)?);

        let handles = (0..THREADS)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || -> Result<Vec<String>, StoreError> {
                    let mut ids = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        let id = store.mint_id();
                        store.put(generate_record(&id, &["u"], Utc::now()))?;
                        let _ = store.get_latest();
                        ids.push(id);
                    }
                    Ok(ids)
                })
            })
            .collect::<Vec<_>>();
        let mut ids = Vec::new();
        for handle in handles {
            let written = handle
                .join()
                .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
            ids.extend(written);
        }

        assert_eq!(store.len(), THREADS * PER_THREAD);
        for id in &ids {
            assert!(store.get(id).is_some(), "missing {id}");
        }

        let reopened = LineageStore::open(&path)?;
        assert_eq!(reopened.len(), THREADS * PER_THREAD);
        assert_eq!(
            std::fs::read_to_string(&path)?.lines().count(),
            THREADS * PER_THREAD
        );
        Ok(())
    }

    #[test]
    fn sweeper_purges_then_stops_with_the_store() -> anyhow::Result<()> {
        let store = Arc::new(LineageStore::in_memory());
        store.put(generate_record(
            "1",
            &["old"],
            Utc::now() - ChronoDuration::days(1),
        ))?;

        let handle = spawn_retention_sweeper(
            &store,
            ChronoDuration::zero(),
            Duration::from_millis(10),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(store.is_empty());

        drop(store);
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("sweeper thread panicked"))?;
        Ok(())
    }
}
