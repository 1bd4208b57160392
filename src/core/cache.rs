//! Content-addressed result cache with in-flight deduplication.
//!
//! Entries are keyed by task fingerprint. At most one computation per
//! fingerprint runs at a time across every run sharing the cache: the first
//! caller becomes the owner, later callers wait on the owner's outcome.
//! Only successful results are ever stored.
//!
//! A cache opened on a directory persists one JSON file per fingerprint and
//! reloads them on open.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{TaskPayload, TaskResult, TaskStatus};

/// Default age after which entries are evicted
pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;

/// A stored successful payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub payload: TaskPayload,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry for a freshly succeeded result; `None` for anything else
    pub fn from_result(result: &TaskResult) -> Option<Self> {
        if result.status != TaskStatus::Succeeded {
            return None;
        }
        Some(Self {
            fingerprint: result.fingerprint.clone(),
            payload: result.payload.clone()?,
            model_id: result.model.clone()?,
            created_at: result.created_at,
        })
    }
}

/// Counters reported by `ResultCache::stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub dedupe_joins: u64,
    pub persistent: bool,
}

/// Outcome of `ResultCache::dedupe`
pub enum Ticket {
    /// A stored result exists
    Hit(CacheEntry),

    /// Caller must compute the result and complete the guard
    Owner(FlightGuard),

    /// Another caller is computing the same fingerprint
    Waiter(Waiter),
}

type Outcome = Option<TaskResult>;

struct Inner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Outcome>>>,
    dir: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
}

/// Shared cache handle. Clones refer to the same storage.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ResultCache {
    /// Create a cache that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::with_entries(HashMap::new(), None)
    }

    /// Open a persistent cache rooted at `dir`, loading existing entries
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;

        let mut entries = HashMap::new();
        let listing = fs::read_dir(dir)
            .with_context(|| format!("Failed to read cache directory: {}", dir.display()))?;

        for item in listing {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path) {
                Ok(entry) => {
                    entries.insert(entry.fingerprint.clone(), entry);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }

        debug!(dir = %dir.display(), entries = entries.len(), "Opened result cache");
        Ok(Self::with_entries(entries, Some(dir.to_path_buf())))
    }

    fn with_entries(entries: HashMap<String, CacheEntry>, dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(entries),
                in_flight: Mutex::new(HashMap::new()),
                dir,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                joins: AtomicU64::new(0),
            }),
        }
    }

    /// Look up a stored entry
    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    /// Store an entry, replacing any previous one for the fingerprint.
    /// Persistent caches write the file on the blocking pool first.
    pub async fn put(&self, entry: CacheEntry) {
        if let Some(dir) = self.inner.dir.clone() {
            let record = entry.clone();
            let written = tokio::task::spawn_blocking(move || write_entry(&dir, &record))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|outcome| outcome);
            if let Err(e) = written {
                warn!(fingerprint = %entry.fingerprint, error = %e, "Failed to persist cache entry");
            }
        }
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.fingerprint.clone(), entry);
    }

    /// Claim a fingerprint: hit, become its owner, or wait for the owner
    pub fn dedupe(&self, fingerprint: &str) -> Ticket {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Checked under the in-flight lock so a just-completed owner is seen
        // either as a stored entry or as still in flight.
        if let Some(entry) = self.get(fingerprint) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ticket::Hit(entry);
        }

        if let Some(rx) = in_flight.get(fingerprint) {
            self.inner.joins.fetch_add(1, Ordering::Relaxed);
            return Ticket::Waiter(Waiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(fingerprint.to_string(), rx);
        self.inner.misses.fetch_add(1, Ordering::Relaxed);

        Ticket::Owner(FlightGuard {
            cache: self.clone(),
            fingerprint: fingerprint.to_string(),
            tx: Some(tx),
        })
    }

    fn release(&self, fingerprint: &str) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fingerprint);
    }

    /// Remove entries older than `max_age`; returns how many were removed
    pub fn evict_expired(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let expired: Vec<String> = entries
            .values()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.fingerprint.clone())
            .collect();

        for fingerprint in &expired {
            entries.remove(fingerprint);
            self.remove_file(fingerprint);
        }

        expired.len()
    }

    /// Drop every entry; returns how many were removed
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let count = entries.len();
        for fingerprint in entries.keys() {
            self.remove_file(fingerprint);
        }
        entries.clear();
        count
    }

    fn remove_file(&self, fingerprint: &str) {
        if let Some(dir) = &self.inner.dir {
            let path = entry_path(dir, fingerprint);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove cache entry");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            dedupe_joins: self.inner.joins.load(Ordering::Relaxed),
            persistent: self.inner.dir.is_some(),
        }
    }
}

/// Ownership of an in-flight computation.
///
/// Dropping the guard without completing it releases waiters, who then
/// contend for the fingerprint again.
pub struct FlightGuard {
    cache: ResultCache,
    fingerprint: String,
    tx: Option<watch::Sender<Outcome>>,
}

impl FlightGuard {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Publish the outcome, storing it first when it succeeded
    pub async fn complete(mut self, result: &TaskResult) {
        if let Some(entry) = CacheEntry::from_result(result) {
            self.cache.put(entry).await;
        }
        self.cache.release(&self.fingerprint);
        if let Some(tx) = self.tx.take() {
            // No receivers left is fine
            let _ = tx.send(Some(result.clone()));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.cache.release(&self.fingerprint);
        }
    }
}

/// Handle on another caller's in-flight computation
pub struct Waiter {
    rx: watch::Receiver<Outcome>,
}

impl Waiter {
    /// Wait for the owner's result; `None` if the owner was abandoned
    pub async fn wait(mut self) -> Option<TaskResult> {
        loop {
            if let Some(result) = self.rx.borrow_and_update().clone() {
                return Some(result);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

fn entry_path(dir: &Path, fingerprint: &str) -> PathBuf {
    dir.join(format!("{}.json", fingerprint))
}

fn read_entry(path: &Path) -> Result<CacheEntry> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read cache entry: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse cache entry: {}", path.display()))
}

fn write_entry(dir: &Path, entry: &CacheEntry) -> Result<()> {
    let json = serde_json::to_vec_pretty(entry).context("Failed to serialize cache entry")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in: {}", dir.display()))?;
    tmp.write_all(&json).context("Failed to write cache entry")?;
    tmp.persist(entry_path(dir, &entry.fingerprint))
        .context("Failed to move cache entry into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AxisReading, InferenceErrorKind, StageId, TaskError, TaskKey};
    use tempfile::TempDir;

    fn payload() -> TaskPayload {
        TaskPayload {
            axes: [("threat".to_string(), AxisReading::new("low", 0.6))]
                .into_iter()
                .collect(),
            evidence: vec![],
            summary: Some("calm".to_string()),
            confidence: None,
        }
    }

    fn success(fp: &str) -> TaskResult {
        TaskResult::succeeded(
            TaskKey::new(StageId::Visual, "kinesic_log"),
            fp.to_string(),
            payload(),
            "model-a".to_string(),
            12,
            vec![],
        )
    }

    fn entry(fp: &str, age_days: i64) -> CacheEntry {
        CacheEntry {
            fingerprint: fp.to_string(),
            payload: payload(),
            model_id: "model-a".to_string(),
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn test_first_caller_owns_second_waits() {
        let cache = ResultCache::in_memory();

        let owner = match cache.dedupe("fp") {
            Ticket::Owner(guard) => guard,
            _ => panic!("expected owner"),
        };
        assert!(matches!(cache.dedupe("fp"), Ticket::Waiter(_)));

        owner.complete(&success("fp")).await;
        assert!(matches!(cache.dedupe("fp"), Ticket::Hit(_)));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.dedupe_joins, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_waiter_receives_owner_outcome() {
        let cache = ResultCache::in_memory();
        let Ticket::Owner(owner) = cache.dedupe("fp") else {
            panic!("expected owner")
        };
        let Ticket::Waiter(waiter) = cache.dedupe("fp") else {
            panic!("expected waiter")
        };

        let handle = tokio::spawn(waiter.wait());
        owner.complete(&success("fp")).await;

        let received = handle.await.unwrap().unwrap();
        assert_eq!(received.payload, Some(payload()));
    }

    #[test]
    fn test_waiter_pending_until_owner_completes() {
        let cache = ResultCache::in_memory();
        let Ticket::Owner(owner) = cache.dedupe("fp") else {
            panic!("expected owner")
        };
        let Ticket::Waiter(waiter) = cache.dedupe("fp") else {
            panic!("expected waiter")
        };

        let mut wait = tokio_test::task::spawn(waiter.wait());
        tokio_test::assert_pending!(wait.poll());

        tokio_test::block_on(owner.complete(&success("fp")));
        assert!(wait.is_woken());
        let received = tokio_test::assert_ready!(wait.poll());
        assert_eq!(received.unwrap().fingerprint, "fp");
    }

    #[tokio::test]
    async fn test_failures_are_shared_but_not_stored() {
        let cache = ResultCache::in_memory();
        let Ticket::Owner(owner) = cache.dedupe("fp") else {
            panic!("expected owner")
        };
        let Ticket::Waiter(waiter) = cache.dedupe("fp") else {
            panic!("expected waiter")
        };

        let failure = TaskResult::failed(
            TaskKey::new(StageId::Visual, "kinesic_log"),
            "fp".to_string(),
            TaskError {
                kind: InferenceErrorKind::Schema,
                message: "not an object".to_string(),
            },
            5,
            vec![],
        );
        owner.complete(&failure).await;

        let received = waiter.wait().await.unwrap();
        assert_eq!(received.status, TaskStatus::Failed);
        assert!(cache.get("fp").is_none());
        assert!(matches!(cache.dedupe("fp"), Ticket::Owner(_)));
    }

    #[tokio::test]
    async fn test_dropped_owner_releases_waiters() {
        let cache = ResultCache::in_memory();
        let Ticket::Owner(owner) = cache.dedupe("fp") else {
            panic!("expected owner")
        };
        let Ticket::Waiter(waiter) = cache.dedupe("fp") else {
            panic!("expected waiter")
        };

        drop(owner);

        assert!(waiter.wait().await.is_none());
        assert!(matches!(cache.dedupe("fp"), Ticket::Owner(_)));
    }

    #[tokio::test]
    async fn test_persistent_cache_reloads() {
        let temp = TempDir::new().unwrap();

        let cache = ResultCache::open(temp.path()).unwrap();
        cache.put(entry("abc", 0)).await;
        assert!(temp.path().join("abc.json").exists());

        let reopened = ResultCache::open(temp.path()).unwrap();
        assert_eq!(reopened.get("abc").unwrap().model_id, "model-a");
        assert!(reopened.stats().persistent);
    }

    #[tokio::test]
    async fn test_eviction_and_invalidation() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::open(temp.path()).unwrap();

        cache.put(entry("old", 45)).await;
        cache.put(entry("fresh", 1)).await;

        assert_eq!(cache.evict_expired(Duration::days(DEFAULT_MAX_AGE_DAYS)), 1);
        assert!(cache.get("old").is_none());
        assert!(!temp.path().join("old.json").exists());
        assert!(cache.get("fresh").is_some());

        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
        assert!(!temp.path().join("fresh.json").exists());
    }
}
