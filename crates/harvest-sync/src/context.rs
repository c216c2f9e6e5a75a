//! Run-scoped execution context handed to fetcher bodies.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use harvest_core::{
    decode_set, encode_set, CachedValue, ErrorKind, ErrorRecord, MetricsSnapshot, OpenRun,
    UpsertDecision,
};
use harvest_storage::{
    content_hash, ArtifactStore, CheckpointStore, DedupEngine, SourceHttp, StoredArtifact,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ItemError;

/// Counters and the append-only error list for one run.
#[derive(Debug, Default)]
pub struct RunRecorder {
    attempted: AtomicU64,
    fetched: AtomicU64,
    new: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl RunRecorder {
    pub fn add_attempted(&self, n: u64) {
        self.attempted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_fetched(&self, n: u64) {
        self.fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_new(&self, n: u64) {
        self.new.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_updated(&self, n: u64) {
        self.updated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ErrorKind, message: impl Into<String>, subject: Option<&str>) {
        let record = ErrorRecord {
            kind,
            message: message.into(),
            subject: subject.map(str::to_string),
            recorded_at: Utc::now(),
        };
        warn!(%kind, subject = ?record.subject, message = %record.message, "recorded fetch error");
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            new: self.new.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Checkpoint store bound to one source.
#[derive(Clone)]
pub struct Checkpoints {
    store: Arc<dyn CheckpointStore>,
    source: String,
}

impl Checkpoints {
    pub fn new(store: Arc<dyn CheckpointStore>, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ItemError> {
        self.store
            .get(&self.source, key)
            .await
            .map_err(ItemError::storage)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), ItemError> {
        self.store
            .set(&self.source, key, value)
            .await
            .map_err(ItemError::storage)
    }

    pub async fn get_set(&self, key: &str) -> Result<BTreeSet<String>, ItemError> {
        Ok(self
            .get(key)
            .await?
            .map(|value| decode_set(&value))
            .unwrap_or_default())
    }

    pub async fn set_set(&self, key: &str, members: &BTreeSet<String>) -> Result<(), ItemError> {
        self.set(key, &encode_set(members)).await
    }

    pub async fn get_datetime(&self, key: &str) -> Result<Option<DateTime<Utc>>, ItemError> {
        Ok(self.get(key).await?.and_then(|value| {
            DateTime::parse_from_rfc3339(&value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    pub async fn set_datetime(&self, key: &str, at: DateTime<Utc>) -> Result<(), ItemError> {
        self.set(key, &at.to_rfc3339()).await
    }

    /// Cached lookup with an embedded expiry; stale or unreadable entries read as absent.
    pub async fn get_fresh(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, ItemError> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match CachedValue::decode(&raw) {
            Ok(cached) if cached.is_fresh(now) => Ok(Some(cached.payload)),
            Ok(_) => Ok(None),
            Err(err) => {
                debug!(key, %err, "ignoring unreadable cached checkpoint");
                Ok(None)
            }
        }
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        payload: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), ItemError> {
        self.set(key, &CachedValue::new(payload, now, ttl).encode())
            .await
    }
}

/// Raw storage sink bound to one source.
#[derive(Clone)]
pub struct RawStorage {
    store: ArtifactStore,
    source: String,
}

impl RawStorage {
    pub fn new(store: ArtifactStore, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
        }
    }

    pub async fn store_raw_text(
        &self,
        item_id: &str,
        content: &str,
        extension: &str,
    ) -> Result<StoredArtifact, ItemError> {
        self.store
            .store_raw_text(&self.source, item_id, content, extension)
            .await
            .map_err(ItemError::storage)
    }

    pub async fn read_raw_text(&self, item_id: &str, extension: &str) -> Result<Option<String>, ItemError> {
        self.store
            .read_raw_text(&self.source, item_id, extension)
            .await
            .map_err(ItemError::storage)
    }
}

/// An item classified against its fingerprint whose raw artifact (if any) is
/// already durable. The fingerprint is committed by [`ExecutionContext::commit`].
#[derive(Debug, Clone)]
#[must_use = "the fingerprint is only committed by ExecutionContext::commit"]
pub struct StagedItem {
    pub item_id: String,
    pub content_hash: String,
    pub decision: UpsertDecision,
    pub artifact: Option<StoredArtifact>,
    previous_hash: Option<String>,
}

pub struct ExecutionContext {
    run: OpenRun,
    http: SourceHttp,
    checkpoints: Checkpoints,
    dedup: DedupEngine,
    storage: RawStorage,
    recorder: RunRecorder,
}

impl ExecutionContext {
    pub fn new(
        run: OpenRun,
        http: SourceHttp,
        checkpoints: Checkpoints,
        dedup: DedupEngine,
        storage: RawStorage,
    ) -> Self {
        Self {
            run,
            http,
            checkpoints,
            dedup,
            storage,
            recorder: RunRecorder::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    pub fn source(&self) -> &str {
        &self.run.source
    }

    pub fn version(&self) -> &str {
        &self.run.version
    }

    pub fn http(&self) -> &SourceHttp {
        &self.http
    }

    pub fn checkpoint(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn dedupe(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn storage(&self) -> &RawStorage {
        &self.storage
    }

    pub fn mark_attempted(&self) {
        self.recorder.add_attempted(1);
    }

    pub fn mark_fetched(&self) {
        self.recorder.add_fetched(1);
    }

    pub fn mark_new(&self, n: u64) {
        self.recorder.add_new(n);
    }

    pub fn mark_updated(&self, n: u64) {
        self.recorder.add_updated(n);
    }

    pub fn mark_skipped(&self) {
        self.recorder.add_skipped(1);
    }

    pub fn mark_failed(&self) {
        self.recorder.add_failed(1);
    }

    pub fn record_error(&self, kind: ErrorKind, message: impl Into<String>, subject: Option<&str>) {
        self.recorder.record_error(kind, message, subject);
    }

    /// Records an item-level failure and marks the item failed.
    pub fn fail_item(&self, err: &ItemError, subject: &str) {
        self.recorder
            .record_error(err.kind(), format!("{err:#}"), Some(subject));
        self.mark_failed();
    }

    /// Records one RATE_LIMITED error and leaves `remaining` not-yet-attempted
    /// items for the next scheduled run. They count as attempted and skipped.
    pub fn defer_remaining(&self, remaining: u64, subject: &str) {
        self.recorder.record_error(
            ErrorKind::RateLimited,
            format!("rate limited; deferring {remaining} further item(s) to the next run"),
            Some(subject),
        );
        self.recorder.add_attempted(remaining);
        self.recorder.add_skipped(remaining);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.recorder.snapshot()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.recorder.errors()
    }

    /// Classifies `content` for `item_id` and, for NEW/UPDATED, writes the raw
    /// artifact. A failed write leaves the fingerprint untouched.
    pub async fn stage_raw(
        &self,
        item_id: &str,
        content: &str,
        extension: &str,
    ) -> Result<StagedItem, ItemError> {
        let hash = content_hash(content);
        let (decision, previous_hash) = self
            .dedup
            .classify(item_id, &hash)
            .await
            .map_err(ItemError::storage)?;

        let artifact = if decision.needs_write() {
            Some(
                self.storage
                    .store_raw_text(item_id, content, extension)
                    .await?,
            )
        } else {
            None
        };

        Ok(StagedItem {
            item_id: item_id.to_string(),
            content_hash: hash,
            decision,
            artifact,
            previous_hash,
        })
    }

    /// Commits the fingerprint of a staged item. This is the last step of an upsert.
    pub async fn commit(&self, staged: StagedItem) -> Result<UpsertDecision, ItemError> {
        if !staged.decision.needs_write() {
            return Ok(staged.decision);
        }
        let committed = self
            .dedup
            .commit(
                &staged.item_id,
                staged.previous_hash.as_deref(),
                &staged.content_hash,
            )
            .await
            .map_err(ItemError::storage)?;
        if !committed {
            return Err(ItemError::storage(anyhow::anyhow!(
                "fingerprint for {} changed while it was being stored",
                staged.item_id
            )));
        }
        Ok(staged.decision)
    }

    /// `stage_raw` followed by `commit`, for items with no downstream write.
    pub async fn upsert_raw(
        &self,
        item_id: &str,
        content: &str,
        extension: &str,
    ) -> Result<UpsertDecision, ItemError> {
        let staged = self.stage_raw(item_id, content, extension).await?;
        self.commit(staged).await
    }

    pub(crate) fn into_run(self) -> OpenRun {
        self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_storage::{
        FileCheckpointStore, FileFingerprintStore, HttpClientConfig, HttpFetcher, HttpProfile,
    };
    use tempfile::{tempdir, TempDir};

    fn context(dir: &TempDir, artifacts_root: std::path::PathBuf) -> ExecutionContext {
        let run = OpenRun::start("rss", "1");
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
            .for_source("rss", &HttpProfile::default());
        ExecutionContext::new(
            run.clone(),
            http,
            Checkpoints::new(
                Arc::new(FileCheckpointStore::new(dir.path().join("checkpoints"))),
                "rss",
            ),
            DedupEngine::new(
                Arc::new(FileFingerprintStore::new(dir.path().join("fingerprints"))),
                "rss",
                run.run_id,
            ),
            RawStorage::new(ArtifactStore::new(artifacts_root), "rss"),
        )
    }

    #[tokio::test]
    async fn counters_and_errors_accumulate() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, dir.path().join("artifacts"));
        ctx.mark_attempted();
        ctx.mark_attempted();
        ctx.mark_fetched();
        ctx.mark_new(1);
        ctx.fail_item(&ItemError::parse("entry-2", "missing title"), "entry-2");
        ctx.defer_remaining(3, "entry-3");

        let snap = ctx.snapshot();
        assert_eq!(snap.attempted, 5);
        assert_eq!(snap.new, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.skipped, 3);

        let errors = ctx.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].kind, ErrorKind::ParseError);
        assert_eq!(errors[0].subject.as_deref(), Some("entry-2"));
        assert_eq!(errors[1].kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn staged_upsert_commits_only_after_storage() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, dir.path().join("artifacts"));

        let staged = ctx.stage_raw("item-1", "hello", "txt").await.unwrap();
        assert_eq!(staged.decision, UpsertDecision::New);
        assert!(staged.artifact.is_some());
        // Not committed yet: a second classification still sees NEW.
        let again = ctx.stage_raw("item-1", "hello", "txt").await.unwrap();
        assert_eq!(again.decision, UpsertDecision::New);

        assert_eq!(ctx.commit(staged).await.unwrap(), UpsertDecision::New);
        assert_eq!(
            ctx.upsert_raw("item-1", "hello", "txt").await.unwrap(),
            UpsertDecision::Unchanged
        );
        assert_eq!(
            ctx.upsert_raw("item-1", "hello again", "txt").await.unwrap(),
            UpsertDecision::Updated
        );
        assert_eq!(
            ctx.storage()
                .read_raw_text("item-1", "txt")
                .await
                .unwrap()
                .as_deref(),
            Some("hello again")
        );
    }

    #[tokio::test]
    async fn failed_artifact_write_does_not_commit_fingerprint() {
        let dir = tempdir().unwrap();
        // A regular file where the artifact directory should be makes every write fail.
        let blocked = dir.path().join("artifacts");
        std::fs::write(&blocked, "not a directory").unwrap();
        let ctx = context(&dir, blocked);

        let err = ctx.upsert_raw("item-1", "hello", "txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageError);
        let (decision, _) = ctx.dedupe().classify("item-1", &content_hash("hello")).await.unwrap();
        assert_eq!(decision, UpsertDecision::New);
    }

    #[tokio::test]
    async fn checkpoint_helpers_round_trip_sets_and_expiring_values() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, dir.path().join("artifacts"));
        let cp = ctx.checkpoint();

        let frontier: BTreeSet<String> = ["https://a/1", "https://a/2"].iter().map(|s| s.to_string()).collect();
        cp.set_set("frontier", &frontier).await.unwrap();
        assert_eq!(cp.get_set("frontier").await.unwrap(), frontier);
        assert!(cp.get_set("missing").await.unwrap().is_empty());

        let now = Utc::now();
        cp.set_with_ttl("geo:London", "51.5,-0.12", now, Duration::days(30))
            .await
            .unwrap();
        assert_eq!(
            cp.get_fresh("geo:London", now).await.unwrap().as_deref(),
            Some("51.5,-0.12")
        );
        assert_eq!(
            cp.get_fresh("geo:London", now + Duration::days(31)).await.unwrap(),
            None
        );
    }
}
