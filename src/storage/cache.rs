//! Two-tier summary cache over the persisted layout.
//!
//! The fast tier is the local [`KeyValueStore`]; the slow tier is an optional
//! [`RemoteSummarySource`]. Besides summary artifacts the store also holds the
//! extracted page snapshot, the chat history, the chat reference list and the
//! user settings, so sweeping and clearing live here too.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::kv::{FileStore, KeyValueStore, MemoryStore, StorageChange};
use super::remote::{RemoteSummarySource, RestSummarySource};
use crate::cancel::{Cancellable, ChannelHandle};
use crate::core::config::AppConfig;
use crate::core::models::{
    APP_SETTINGS_KEY, CHAT_HISTORY_KEY, ChatSession, EXTRACTED_DATA_KEY, ExtractedPage,
    REFERENCE_LIST_KEY, RemoteRecord, SUMMARY_KEY_PREFIX, SummaryArtifact, SummaryType,
    summary_key,
};
use crate::core::settings::{AppSettings, RetentionPolicy};
use crate::errors::PanelError;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub summaries: usize,
    pub extracted: bool,
    pub chat_sessions: usize,
    pub references: usize,
}

impl SweepReport {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.summaries == 0 && !self.extracted && self.chat_sessions == 0 && self.references == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub summaries: usize,
    pub has_extracted: bool,
    pub chat_sessions: usize,
    pub references: usize,
}

pub struct CacheStore {
    fast: Arc<dyn KeyValueStore>,
    slow: Option<Arc<dyn RemoteSummarySource>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("remote_configured", &self.slow.is_some())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    #[must_use]
    pub fn new(fast: Arc<dyn KeyValueStore>, slow: Option<Arc<dyn RemoteSummarySource>>) -> Self {
        Self { fast, slow }
    }

    /// Opens the store and remote source the deployment config names: a file
    /// store when a path is set (in-memory otherwise) and the remote table
    /// when both its url and key are set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store file is unreadable or the remote url is invalid.
    pub fn from_config(config: &AppConfig) -> Result<Self, PanelError> {
        let fast: Arc<dyn KeyValueStore> = match &config.store_path {
            Some(path) => Arc::new(FileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let slow: Option<Arc<dyn RemoteSummarySource>> =
            match (&config.remote_url, &config.remote_key) {
                (Some(url), Some(key)) => Some(Arc::new(RestSummarySource::new(url, key.clone())?)),
                (Some(_), None) => {
                    warn!("Remote url configured without a key, remote lookups disabled");
                    None
                }
                _ => None,
            };
        Ok(Self::new(fast, slow))
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.slow.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.fast.subscribe()
    }

    // ---- summary artifacts ----

    #[must_use]
    pub fn get_fast(&self, url: &str, summary_type: SummaryType) -> Option<SummaryArtifact> {
        let key = summary_key(url, summary_type);
        let value = self.fast.get(&key)?;
        match serde_json::from_value::<SummaryArtifact>(value) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(key = %key, "Corrupt cached summary treated as a miss: {e}");
                None
            }
        }
    }

    /// Looks `url` up in the slow tier unless `handle` is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote query itself fails.
    pub async fn get_slow(
        &self,
        url: &str,
        handle: &ChannelHandle,
    ) -> Result<Cancellable<Vec<RemoteRecord>>, PanelError> {
        let Some(slow) = &self.slow else {
            debug!(url = %url, "No remote summary source configured");
            return Ok(Cancellable::Completed(Vec::new()));
        };

        match handle.run(slow.fetch(url)).await {
            Cancellable::Completed(result) => result.map(Cancellable::Completed),
            Cancellable::Cancelled => {
                debug!(url = %url, "Remote lookup cancelled");
                Ok(Cancellable::Cancelled)
            }
        }
    }

    /// Whether the remote table holds a row for `url`, which the panel shows
    /// as the page being bookmarked. Always `false` without a remote source.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote query itself fails.
    pub async fn is_bookmarked(&self, url: &str, handle: &ChannelHandle) -> Result<Cancellable<bool>, PanelError> {
        let found = match self.get_slow(url, handle).await? {
            Cancellable::Completed(rows) => rows.iter().any(|row| row.url == url),
            Cancellable::Cancelled => return Ok(Cancellable::Cancelled),
        };
        debug!(url = %url, found, "Bookmark status checked");
        Ok(Cancellable::Completed(found))
    }

    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn put_fast(&self, artifact: &SummaryArtifact) -> Result<(), PanelError> {
        self.fast.set(&artifact.key(), serde_json::to_value(artifact)?)
    }

    /// Writes `artifact` only when its key holds no readable entry. Returns
    /// whether it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn put_fast_if_absent(&self, artifact: &SummaryArtifact) -> Result<bool, PanelError> {
        if self.get_fast(&artifact.url, artifact.summary_type).is_some() {
            return Ok(false);
        }
        self.put_fast(artifact)?;
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns an error if the store rejects the removal.
    pub fn evict_fast(&self, url: &str, summary_type: SummaryType) -> Result<(), PanelError> {
        self.fast.remove(&summary_key(url, summary_type))
    }

    fn summary_keys(&self) -> Vec<String> {
        self.fast
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(SUMMARY_KEY_PREFIX))
            .collect()
    }

    // ---- sweeping ----

    /// Removes every persisted entity created or last touched before `cutoff`.
    /// Entries whose timestamp cannot be read are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a write.
    pub fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<SweepReport, PanelError> {
        let mut report = SweepReport::default();

        for key in self.summary_keys() {
            let Some(created_at) = self
                .fast
                .get(&key)
                .and_then(|v| timestamp_field(&v, "createdAt"))
            else {
                continue;
            };
            if created_at < cutoff {
                self.fast.remove(&key)?;
                report.summaries += 1;
            }
        }

        if let Some(extracted_at) = self
            .fast
            .get(EXTRACTED_DATA_KEY)
            .and_then(|v| timestamp_field(&v, "extractedAt"))
            && extracted_at < cutoff
        {
            self.fast.remove(EXTRACTED_DATA_KEY)?;
            report.extracted = true;
        }

        if let Some(Value::Array(sessions)) = self.fast.get(CHAT_HISTORY_KEY) {
            let before = sessions.len();
            let kept: Vec<Value> = sessions
                .into_iter()
                .filter(|s| timestamp_field(s, "updatedAt").is_none_or(|t| t >= cutoff))
                .collect();
            report.chat_sessions = before - kept.len();
            if report.chat_sessions > 0 {
                self.fast.set(CHAT_HISTORY_KEY, Value::Array(kept))?;
            }
        }

        if let Some(Value::Array(references)) = self.fast.get(REFERENCE_LIST_KEY) {
            let before = references.len();
            let kept: Vec<Value> = references
                .into_iter()
                .filter(|r| timestamp_field(r, "extractedAt").is_none_or(|t| t >= cutoff))
                .collect();
            report.references = before - kept.len();
            if report.references > 0 {
                self.fast.set(REFERENCE_LIST_KEY, Value::Array(kept))?;
            }
        }

        if report.is_empty() {
            debug!(cutoff = %cutoff, "Sweep found nothing expired");
        } else {
            info!(
                cutoff = %cutoff,
                summaries = report.summaries,
                extracted = report.extracted,
                chat_sessions = report.chat_sessions,
                references = report.references,
                "Swept expired data"
            );
        }
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns an error if the store rejects a write.
    pub fn sweep_with_policy(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, PanelError> {
        match policy.cutoff(now) {
            Some(cutoff) => self.sweep_expired(cutoff),
            None => {
                debug!("Retention disabled, skipping sweep");
                Ok(SweepReport::default())
            }
        }
    }

    // ---- housekeeping ----

    /// Removes every cached summary. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a removal.
    pub fn clear_summaries(&self) -> Result<usize, PanelError> {
        let keys = self.summary_keys();
        for key in &keys {
            self.fast.remove(key)?;
        }
        info!(removed = keys.len(), "Cleared cached summaries");
        Ok(keys.len())
    }

    /// Removes cached summaries and the extracted page snapshot. Settings,
    /// chat history and references survive.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a removal.
    pub fn clear_all_data(&self) -> Result<(), PanelError> {
        self.clear_summaries()?;
        self.fast.remove(EXTRACTED_DATA_KEY)?;
        info!("Cleared extracted data and summaries");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> StorageStats {
        let array_len = |key: &str| match self.fast.get(key) {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        };
        StorageStats {
            summaries: self.summary_keys().len(),
            has_extracted: self.fast.get(EXTRACTED_DATA_KEY).is_some(),
            chat_sessions: array_len(CHAT_HISTORY_KEY),
            references: array_len(REFERENCE_LIST_KEY),
        }
    }

    // ---- other persisted entities ----

    #[must_use]
    pub fn load_extracted(&self) -> Option<ExtractedPage> {
        self.load_or_warn(EXTRACTED_DATA_KEY)
    }

    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn save_extracted(&self, page: &ExtractedPage) -> Result<(), PanelError> {
        self.save(EXTRACTED_DATA_KEY, page)
    }

    /// Stored settings, or defaults when none are stored or the blob is corrupt.
    #[must_use]
    pub fn load_settings(&self) -> AppSettings {
        self.load_or_warn(APP_SETTINGS_KEY).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn save_settings(&self, settings: &AppSettings) -> Result<(), PanelError> {
        self.save(APP_SETTINGS_KEY, settings)
    }

    #[must_use]
    pub fn load_chat_history(&self) -> Vec<ChatSession> {
        self.load_or_warn(CHAT_HISTORY_KEY).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn save_chat_history(&self, sessions: &[ChatSession]) -> Result<(), PanelError> {
        self.save(CHAT_HISTORY_KEY, sessions)
    }

    #[must_use]
    pub fn load_references(&self) -> Vec<ExtractedPage> {
        self.load_or_warn(REFERENCE_LIST_KEY).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn save_references(&self, references: &[ExtractedPage]) -> Result<(), PanelError> {
        self.save(REFERENCE_LIST_KEY, references)
    }

    fn load_or_warn<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.fast.get(key)?;
        serde_json::from_value(value)
            .inspect_err(|e| warn!(key = %key, "Unreadable stored entry ignored: {e}"))
            .ok()
    }

    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), PanelError> {
        self.fast.set(key, serde_json::to_value(value)?)
    }
}

fn timestamp_field(value: &Value, field: &str) -> Option<DateTime<Utc>> {
    value
        .get(field)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancellationRegistry, Channel};
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRemote {
        calls: AtomicUsize,
        rows: Vec<RemoteRecord>,
    }

    #[async_trait]
    impl RemoteSummarySource for CountingRemote {
        async fn fetch(&self, _url: &str) -> Result<Vec<RemoteRecord>, PanelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.clone())
        }
    }

    fn local_only() -> (Arc<MemoryStore>, CacheStore) {
        let kv = Arc::new(MemoryStore::new());
        let cache = CacheStore::new(kv.clone(), None);
        (kv, cache)
    }

    fn artifact_at(url: &str, created_at: DateTime<Utc>) -> SummaryArtifact {
        SummaryArtifact {
            content: format!("summary of {url}"),
            summary_type: SummaryType::Full,
            created_at,
            url: url.to_string(),
        }
    }

    #[test]
    fn from_config_picks_file_store_and_remote() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            store_path: Some(dir.path().join("panel.json")),
            remote_url: Some("https://db.example".to_string()),
            remote_key: Some("anon".to_string()),
            ..AppConfig::default()
        };
        let cache = CacheStore::from_config(&config).unwrap();
        assert!(cache.has_remote());
        cache.put_fast(&artifact_at("u", Utc::now())).unwrap();
        assert!(dir.path().join("panel.json").exists());

        let keyless = AppConfig {
            remote_url: Some("https://db.example".to_string()),
            ..AppConfig::default()
        };
        assert!(!CacheStore::from_config(&keyless).unwrap().has_remote());
    }

    #[test]
    fn put_then_get_returns_artifact() {
        let (_, cache) = local_only();
        let artifact = SummaryArtifact::new("https://a.example", SummaryType::KeyInfo, "facts");
        cache.put_fast(&artifact).unwrap();

        assert_eq!(
            cache.get_fast("https://a.example", SummaryType::KeyInfo),
            Some(artifact)
        );
        assert_eq!(cache.get_fast("https://a.example", SummaryType::Full), None);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let (kv, cache) = local_only();
        kv.set(&summary_key("u", SummaryType::Full), json!("garbage"))
            .unwrap();
        assert_eq!(cache.get_fast("u", SummaryType::Full), None);
    }

    #[test]
    fn put_if_absent_keeps_existing_entry() {
        let (_, cache) = local_only();
        let fresh = SummaryArtifact::new("u", SummaryType::Full, "fresh");
        cache.put_fast(&fresh).unwrap();

        let remote = SummaryArtifact::new("u", SummaryType::Full, "from remote");
        assert!(!cache.put_fast_if_absent(&remote).unwrap());
        assert_eq!(cache.get_fast("u", SummaryType::Full).unwrap().content, "fresh");

        cache.evict_fast("u", SummaryType::Full).unwrap();
        assert!(cache.put_fast_if_absent(&remote).unwrap());
    }

    #[tokio::test]
    async fn get_slow_without_remote_is_empty() {
        let (_, cache) = local_only();
        let registry = CancellationRegistry::new();
        let handle = registry.begin(Channel::DatabaseQuery);

        assert_eq!(
            cache.get_slow("u", &handle).await.unwrap(),
            Cancellable::Completed(Vec::new())
        );
    }

    #[tokio::test]
    async fn get_slow_on_cancelled_handle_skips_remote() {
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
            rows: Vec::new(),
        });
        let cache = CacheStore::new(Arc::new(MemoryStore::new()), Some(remote.clone()));
        let registry = CancellationRegistry::new();
        let handle = registry.begin(Channel::DatabaseQuery);
        registry.cancel(Channel::DatabaseQuery);

        assert!(cache.get_slow("u", &handle).await.unwrap().is_cancelled());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bookmark_status_follows_remote_rows() {
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
            rows: vec![RemoteRecord {
                url: "https://a.example".to_string(),
                summarizer: None,
                ai_key_info: None,
            }],
        });
        let cache = CacheStore::new(Arc::new(MemoryStore::new()), Some(remote.clone()));
        let registry = CancellationRegistry::new();
        let handle = registry.begin(Channel::BookmarkCheck);

        assert_eq!(
            cache.is_bookmarked("https://a.example", &handle).await.unwrap(),
            Cancellable::Completed(true)
        );
        assert_eq!(
            cache.is_bookmarked("https://b.example", &handle).await.unwrap(),
            Cancellable::Completed(false)
        );

        let (_, local) = local_only();
        assert_eq!(
            local.is_bookmarked("https://a.example", &handle).await.unwrap(),
            Cancellable::Completed(false)
        );

        registry.cancel(Channel::BookmarkCheck);
        assert!(cache.is_bookmarked("https://a.example", &handle).await.unwrap().is_cancelled());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sweep_removes_exactly_entries_older_than_cutoff() {
        let (_, cache) = local_only();
        let cutoff = Utc::now();
        cache.put_fast(&artifact_at("old", cutoff - Duration::seconds(1))).unwrap();
        cache.put_fast(&artifact_at("edge", cutoff)).unwrap();
        cache.put_fast(&artifact_at("new", cutoff + Duration::seconds(1))).unwrap();

        let report = cache.sweep_expired(cutoff).unwrap();

        assert_eq!(report.summaries, 1);
        assert!(cache.get_fast("old", SummaryType::Full).is_none());
        assert!(cache.get_fast("edge", SummaryType::Full).is_some());
        assert!(cache.get_fast("new", SummaryType::Full).is_some());
    }

    #[test]
    fn sweep_prunes_sessions_and_references() {
        let (kv, cache) = local_only();
        let now = Utc::now();
        let old = (now - Duration::days(10)).to_rfc3339();
        let recent = now.to_rfc3339();

        kv.set(
            CHAT_HISTORY_KEY,
            json!([
                {"id": "a", "title": "", "messages": [], "createdAt": old, "updatedAt": recent},
                {"id": "b", "title": "", "messages": [], "createdAt": old, "updatedAt": old},
            ]),
        )
        .unwrap();
        kv.set(
            REFERENCE_LIST_KEY,
            json!([
                {"url": "r1", "extractedAt": old},
                {"url": "r2"},
            ]),
        )
        .unwrap();
        kv.set(EXTRACTED_DATA_KEY, json!({"url": "p", "extractedAt": old}))
            .unwrap();

        let report = cache.sweep_expired(now - Duration::days(7)).unwrap();

        assert_eq!(report.chat_sessions, 1);
        assert_eq!(report.references, 1);
        assert!(report.extracted);
        let sessions = cache.load_chat_history();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "a");
        // No timestamp: kept.
        assert_eq!(cache.load_references()[0].url, "r2");
        assert!(cache.load_extracted().is_none());
    }

    #[test]
    fn zero_retention_sweeps_nothing() {
        let (_, cache) = local_only();
        let ancient = Utc::now() - Duration::days(3650);
        cache.put_fast(&artifact_at("u", ancient)).unwrap();

        let report = cache
            .sweep_with_policy(RetentionPolicy::new(0), Utc::now())
            .unwrap();

        assert!(report.is_empty());
        assert!(cache.get_fast("u", SummaryType::Full).is_some());
    }

    #[test]
    fn clear_all_data_keeps_settings_and_history() {
        let (_, cache) = local_only();
        cache
            .put_fast(&SummaryArtifact::new("u", SummaryType::Full, "s"))
            .unwrap();
        cache
            .save_extracted(&ExtractedPage {
                url: "u".to_string(),
                ..ExtractedPage::default()
            })
            .unwrap();
        let settings = AppSettings {
            dark_mode: true,
            ..AppSettings::default()
        };
        cache.save_settings(&settings).unwrap();

        cache.clear_all_data().unwrap();

        let stats = cache.stats();
        assert_eq!(stats.summaries, 0);
        assert!(!stats.has_extracted);
        assert_eq!(cache.load_settings(), settings);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let (kv, cache) = local_only();
        kv.set(APP_SETTINGS_KEY, json!(["not", "settings"])).unwrap();
        assert_eq!(cache.load_settings(), AppSettings::default());
    }
}
