//! File-backed, category+TTL cache store and the issue fingerprint tracker.
//!
//! One durable JSON record per `(category, key)`, written through a temp
//! file and an atomic rename so concurrent writers on the same key never
//! leave a torn record behind. Expiry is lazy: an expired record reads as
//! a miss and only gets deleted by the opportunistic bulk clean.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use orgkeeper_core::{fingerprint, Issue, ProjectMembership};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "orgkeeper-cache";

/// Expired-record count above which `maybe_clean_expired` sweeps the store.
const CLEAN_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Projects,
    Repositories,
    Issues,
    Labels,
    State,
}

impl CacheCategory {
    pub const ALL: [Self; 5] = [
        Self::Projects,
        Self::Repositories,
        Self::Issues,
        Self::Labels,
        Self::State,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Repositories => "repositories",
            Self::Issues => "issues",
            Self::Labels => "labels",
            Self::State => "state",
        }
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// Per-category time-to-live table. Defaults reflect how often each kind
/// of data actually changes upstream.
#[derive(Debug, Clone)]
pub struct TtlTable {
    entries: BTreeMap<CacheCategory, Duration>,
}

impl Default for TtlTable {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(CacheCategory::Projects, Duration::hours(24));
        entries.insert(CacheCategory::Repositories, Duration::hours(6));
        entries.insert(CacheCategory::Issues, Duration::hours(1));
        entries.insert(CacheCategory::Labels, Duration::hours(12));
        entries.insert(CacheCategory::State, Duration::minutes(30));
        Self { entries }
    }
}

impl TtlTable {
    pub fn ttl(&self, category: CacheCategory) -> Duration {
        self.entries
            .get(&category)
            .copied()
            .unwrap_or_else(|| Duration::hours(1))
    }

    pub fn with_override(mut self, category: CacheCategory, ttl: Duration) -> Self {
        self.entries.insert(category, ttl);
        self
    }
}

/// How reads and writes behave for the duration of a run. Neither variant
/// may change synchronization outcomes, only traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Normal,
    /// Every read misses; writes still land. Entries are not deleted.
    RefreshAll,
    /// The store is bypassed entirely: reads miss, writes are dropped.
    Bypass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    category: CacheCategory,
    key: String,
    cached_at: DateTime<Utc>,
    ttl_secs: i64,
    payload: serde_json::Value,
}

impl CacheRecord {
    /// Validity is judged against the live TTL table, not the TTL frozen
    /// into the record at write time; `ttl_secs` is kept as metadata.
    fn is_expired(&self, now: DateTime<Utc>, ttls: &TtlTable) -> bool {
        now - self.cached_at > ttls.ttl(self.category)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub file_count: usize,
    pub total_size: u64,
    pub per_category: BTreeMap<String, usize>,
    pub expired_count: usize,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    ttls: TtlTable,
    mode: CacheMode,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, mode: CacheMode) -> Self {
        Self {
            root: root.into(),
            ttls: TtlTable::default(),
            mode,
        }
    }

    pub fn with_ttls(mut self, ttls: TtlTable) -> Self {
        self.ttls = ttls;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Keys are hashed into the file name so arbitrary strings (URLs,
    /// `org/repo/since` triples) stay filesystem-safe.
    fn record_path(&self, category: CacheCategory, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.root
            .join(category.as_str())
            .join(format!("{}.json", &digest[..16]))
    }

    /// Look up a payload. A hit requires the record to be present, parseable
    /// and younger than its TTL; anything else is a miss. Corruption is
    /// logged and degrades to a miss for that key only.
    pub async fn get<T: DeserializeOwned>(&self, category: CacheCategory, key: &str) -> Option<T> {
        if self.mode != CacheMode::Normal {
            return None;
        }

        let path = self.record_path(category, key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(category = category.as_str(), key, %err, "cache read failed");
                return None;
            }
        };

        let record: CacheRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(category = category.as_str(), key, %err, "corrupt cache record, treating as miss");
                return None;
            }
        };

        if record.is_expired(Utc::now(), &self.ttls) {
            debug!(category = category.as_str(), key, "cache record expired");
            return None;
        }

        match serde_json::from_value(record.payload) {
            Ok(payload) => {
                debug!(category = category.as_str(), key, "cache hit");
                Some(payload)
            }
            Err(err) => {
                warn!(category = category.as_str(), key, %err, "cache payload shape mismatch");
                None
            }
        }
    }

    /// Store a payload, overwriting any previous record unconditionally.
    pub async fn put<T: Serialize>(
        &self,
        category: CacheCategory,
        key: &str,
        payload: &T,
    ) -> anyhow::Result<()> {
        if self.mode == CacheMode::Bypass {
            return Ok(());
        }

        let record = CacheRecord {
            category,
            key: key.to_string(),
            cached_at: Utc::now(),
            ttl_secs: self.ttls.ttl(category).num_seconds(),
            payload: serde_json::to_value(payload).context("serializing cache payload")?,
        };

        let path = self.record_path(category, key);
        let parent = path.parent().expect("record path always has a parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(&record).context("serializing cache record")?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming cache record {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(category = category.as_str(), key, "cache stored");
        Ok(())
    }

    pub async fn invalidate(&self, category: CacheCategory, key: &str) -> anyhow::Result<()> {
        let path = self.record_path(category, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing cache record {}", path.display()))
            }
        }
    }

    pub async fn stats(&self) -> anyhow::Result<CacheStats> {
        let mut stats = CacheStats::default();
        let now = Utc::now();

        for category in CacheCategory::ALL {
            let dir = self.root.join(category.as_str());
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reading cache directory {}", dir.display()))
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                stats.file_count += 1;
                stats.total_size += entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                *stats
                    .per_category
                    .entry(category.as_str().to_string())
                    .or_default() += 1;

                match fs::read(&path).await {
                    Ok(bytes) => match serde_json::from_slice::<CacheRecord>(&bytes) {
                        Ok(record) if record.is_expired(now, &self.ttls) => stats.expired_count += 1,
                        Ok(_) => {}
                        // Unreadable counts as expired: it will never hit.
                        Err(_) => stats.expired_count += 1,
                    },
                    Err(_) => stats.expired_count += 1,
                }
            }
        }

        Ok(stats)
    }

    /// Remove every expired or unreadable record. Returns how many were
    /// deleted. Purely an optimization; validity checks never rely on it.
    pub async fn clean_expired(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut removed = 0usize;

        for category in CacheCategory::ALL {
            let dir = self.root.join(category.as_str());
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reading cache directory {}", dir.display()))
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let stale = match fs::read(&path).await {
                    Ok(bytes) => serde_json::from_slice::<CacheRecord>(&bytes)
                        .map(|record| record.is_expired(now, &self.ttls))
                        .unwrap_or(true),
                    Err(_) => true,
                };
                if stale && fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "cleaned expired cache records");
        }
        Ok(removed)
    }

    /// Bulk-clean only once enough dead records have piled up.
    pub async fn maybe_clean_expired(&self) -> anyhow::Result<usize> {
        let stats = self.stats().await?;
        if stats.expired_count > CLEAN_THRESHOLD {
            self.clean_expired().await
        } else {
            Ok(0)
        }
    }
}

/// What the tracker remembers about an issue between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFingerprint {
    pub fingerprint: String,
    pub processed_at: DateTime<Utc>,
}

/// Outcome of a change check for one issue.
#[derive(Debug, Clone)]
pub struct FingerprintCheck {
    pub changed: bool,
    pub current: String,
    pub previous: Option<String>,
}

/// Detects whether an issue's externally relevant state moved since the
/// last run, using the store's `state` category. Callers must persist the
/// new fingerprint via `mark_processed` after their decision completes,
/// whether or not an action was applied.
#[derive(Debug, Clone)]
pub struct FingerprintTracker<'a> {
    store: &'a CacheStore,
}

impl<'a> FingerprintTracker<'a> {
    pub fn new(store: &'a CacheStore) -> Self {
        Self { store }
    }

    pub async fn should_process(
        &self,
        issue: &Issue,
        memberships: &[ProjectMembership],
    ) -> FingerprintCheck {
        let current = fingerprint(issue, memberships);
        let previous: Option<StoredFingerprint> =
            self.store.get(CacheCategory::State, &issue.id).await;
        let previous = previous.map(|stored| stored.fingerprint);
        let changed = previous.as_deref() != Some(current.as_str());
        FingerprintCheck {
            changed,
            current,
            previous,
        }
    }

    pub async fn mark_processed(&self, issue_id: &str, fingerprint: &str) -> anyhow::Result<()> {
        let stored = StoredFingerprint {
            fingerprint: fingerprint.to_string(),
            processed_at: Utc::now(),
        };
        self.store.put(CacheCategory::State, issue_id, &stored).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use orgkeeper_core::IssueState;
    use tempfile::tempdir;

    fn issues_store(dir: &Path) -> CacheStore {
        CacheStore::new(dir, CacheMode::Normal)
    }

    /// Rewrites a stored record's `cached_at` so TTL boundaries can be
    /// tested without a clock abstraction.
    async fn backdate(store: &CacheStore, category: CacheCategory, key: &str, age: Duration) {
        let path = store.record_path(category, key);
        let bytes = fs::read(&path).await.expect("record exists");
        let mut record: CacheRecord = serde_json::from_slice(&bytes).expect("record parses");
        record.cached_at = Utc::now() - age;
        fs::write(&path, serde_json::to_vec(&record).expect("serialize"))
            .await
            .expect("rewrite record");
    }

    #[tokio::test]
    async fn roundtrip_hits_with_original_payload() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        store
            .put(CacheCategory::Issues, "org/repo/7d", &vec!["a", "b"])
            .await
            .expect("put");
        let got: Option<Vec<String>> = store.get(CacheCategory::Issues, "org/repo/7d").await;
        assert_eq!(got, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn ttl_boundary_for_issues_category() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        store
            .put(CacheCategory::Issues, "org/repo/7d", &42u32)
            .await
            .expect("put");

        backdate(&store, CacheCategory::Issues, "org/repo/7d", Duration::minutes(59)).await;
        let fresh: Option<u32> = store.get(CacheCategory::Issues, "org/repo/7d").await;
        assert_eq!(fresh, Some(42));

        backdate(&store, CacheCategory::Issues, "org/repo/7d", Duration::minutes(61)).await;
        let stale: Option<u32> = store.get(CacheCategory::Issues, "org/repo/7d").await;
        assert_eq!(stale, None);
    }

    #[tokio::test]
    async fn put_overwrites_unconditionally() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        store.put(CacheCategory::Labels, "k", &1u32).await.expect("put");
        store.put(CacheCategory::Labels, "k", &2u32).await.expect("put");
        let got: Option<u32> = store.get(CacheCategory::Labels, "k").await;
        assert_eq!(got, Some(2));
    }

    #[tokio::test]
    async fn corrupt_record_degrades_to_miss() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        store.put(CacheCategory::Projects, "cat", &1u32).await.expect("put");

        let path = store.record_path(CacheCategory::Projects, "cat");
        fs::write(&path, b"{ not json").await.expect("corrupt it");

        let got: Option<u32> = store.get(CacheCategory::Projects, "cat").await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn refresh_all_misses_but_keeps_records_on_disk() {
        let dir = tempdir().expect("tempdir");
        let normal = issues_store(dir.path());
        normal.put(CacheCategory::Issues, "k", &7u32).await.expect("put");

        let refreshing = CacheStore::new(dir.path(), CacheMode::RefreshAll);
        let got: Option<u32> = refreshing.get(CacheCategory::Issues, "k").await;
        assert_eq!(got, None);
        refreshing.put(CacheCategory::Issues, "k", &8u32).await.expect("put");

        // The record survived and was rewritten, visible to a normal store.
        let got: Option<u32> = normal.get(CacheCategory::Issues, "k").await;
        assert_eq!(got, Some(8));
    }

    #[tokio::test]
    async fn bypass_never_touches_disk() {
        let dir = tempdir().expect("tempdir");
        let bypassed = CacheStore::new(dir.path(), CacheMode::Bypass);
        bypassed.put(CacheCategory::Issues, "k", &7u32).await.expect("put");
        let got: Option<u32> = bypassed.get(CacheCategory::Issues, "k").await;
        assert_eq!(got, None);
        let stats = bypassed.stats().await.expect("stats");
        assert_eq!(stats.file_count, 0);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        store.put(CacheCategory::State, "x", &1u32).await.expect("put");
        store.invalidate(CacheCategory::State, "x").await.expect("first");
        store.invalidate(CacheCategory::State, "x").await.expect("second");
        let got: Option<u32> = store.get(CacheCategory::State, "x").await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn stats_and_clean_count_expired_records() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        store.put(CacheCategory::Issues, "live", &1u32).await.expect("put");
        store.put(CacheCategory::Issues, "dead", &2u32).await.expect("put");
        backdate(&store, CacheCategory::Issues, "dead", Duration::hours(2)).await;

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.per_category.get("issues"), Some(&2));

        let removed = store.clean_expired().await.expect("clean");
        assert_eq!(removed, 1);
        let live: Option<u32> = store.get(CacheCategory::Issues, "live").await;
        assert_eq!(live, Some(1));
    }

    fn tracked_issue(updated_minute: u32) -> Issue {
        Issue {
            id: "I_node1".into(),
            number: 9,
            title: "Broken export".into(),
            repository: "reports".into(),
            state: IssueState::Closed,
            closed_at: Some(Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).single().expect("ts")),
            updated_at: Utc
                .with_ymd_and_hms(2024, 1, 11, 8, updated_minute, 0)
                .single()
                .expect("ts"),
            project_items: vec![],
        }
    }

    fn tracked_membership(status: &str) -> ProjectMembership {
        ProjectMembership {
            project_id: "PVT_9".into(),
            project_title: "Ops".into(),
            item_id: "PVTI_9".into(),
            status: Some(status.to_string()),
            field_id: "PVTF_done".into(),
            field_value: None,
        }
    }

    #[tokio::test]
    async fn second_identical_fetch_is_unchanged() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        let tracker = FingerprintTracker::new(&store);
        let issue = tracked_issue(0);
        let memberships = vec![tracked_membership("Done")];

        let first = tracker.should_process(&issue, &memberships).await;
        assert!(first.changed);
        assert_eq!(first.previous, None);
        tracker
            .mark_processed(&issue.id, &first.current)
            .await
            .expect("mark");

        let second = tracker.should_process(&issue, &memberships).await;
        assert!(!second.changed);
        assert_eq!(second.previous.as_deref(), Some(second.current.as_str()));
    }

    #[tokio::test]
    async fn any_state_change_flips_the_check() {
        let dir = tempdir().expect("tempdir");
        let store = issues_store(dir.path());
        let tracker = FingerprintTracker::new(&store);
        let issue = tracked_issue(0);
        let memberships = vec![tracked_membership("Done")];

        let first = tracker.should_process(&issue, &memberships).await;
        tracker
            .mark_processed(&issue.id, &first.current)
            .await
            .expect("mark");

        let touched = tracked_issue(1);
        assert!(tracker.should_process(&touched, &memberships).await.changed);

        let restatused = vec![tracked_membership("In Progress")];
        assert!(tracker.should_process(&issue, &restatused).await.changed);
    }
}
