//! Content fingerprints and the upsert decision built on them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use harvest_core::{ContentFingerprint, UpsertDecision};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::{path_segment, write_atomic};

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get(&self, source: &str, item_id: &str) -> anyhow::Result<Option<ContentFingerprint>>;

    /// Stores `next` only if the currently stored hash for the item equals
    /// `expected` (`None` meaning "no fingerprint yet"). Returns whether it wrote.
    async fn compare_and_set(
        &self,
        source: &str,
        expected: Option<&str>,
        next: ContentFingerprint,
    ) -> anyhow::Result<bool>;
}

/// Pure upsert decision for an item given its stored fingerprint.
pub fn decide(stored: Option<&ContentFingerprint>, content_hash: &str) -> UpsertDecision {
    match stored {
        None => UpsertDecision::New,
        Some(fp) if fp.content_hash == content_hash => UpsertDecision::Unchanged,
        Some(_) => UpsertDecision::Updated,
    }
}

#[derive(Debug, Default)]
struct SourceIndex {
    entries: HashMap<String, ContentFingerprint>,
    /// The log ends in a torn line; the next append must start on a fresh line.
    needs_newline: bool,
}

/// Append-only JSON-lines log per source with an in-memory index.
#[derive(Debug)]
pub struct FileFingerprintStore {
    root: PathBuf,
    state: Mutex<HashMap<String, SourceIndex>>,
}

impl FileFingerprintStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, source: &str) -> anyhow::Result<PathBuf> {
        Ok(self
            .root
            .join(format!("{}.fingerprints.jsonl", path_segment(source)?)))
    }

    async fn load(&self, source: &str) -> anyhow::Result<SourceIndex> {
        let path = self.log_path(source)?;
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SourceIndex::default())
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };

        let mut index = SourceIndex {
            entries: HashMap::new(),
            needs_newline: !text.is_empty() && !text.ends_with('\n'),
        };
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ContentFingerprint>(line) {
                Ok(fp) => {
                    index.entries.insert(fp.item_id.clone(), fp);
                }
                Err(err) => {
                    warn!(source, line = line_no + 1, %err, "skipping unreadable fingerprint line");
                }
            }
        }
        Ok(index)
    }

    async fn append(&self, source: &str, prefix_newline: bool, fp: &ContentFingerprint) -> anyhow::Result<()> {
        let path = self.log_path(source)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;

        let mut line = String::new();
        if prefix_newline {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(fp).context("serializing fingerprint")?);
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush().await?;
        file.sync_data()
            .await
            .with_context(|| format!("syncing {}", path.display()))?;
        Ok(())
    }

    /// Rewrites the log so it holds exactly one line per item.
    pub async fn compact(&self, source: &str) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        if !state.contains_key(source) {
            let loaded = self.load(source).await?;
            state.insert(source.to_string(), loaded);
        }
        let Some(index) = state.get_mut(source) else {
            return Ok(0);
        };

        let mut fingerprints: Vec<_> = index.entries.values().collect();
        fingerprints.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        let mut body = String::new();
        for fp in &fingerprints {
            body.push_str(&serde_json::to_string(fp).context("serializing fingerprint")?);
            body.push('\n');
        }
        let count = fingerprints.len();
        write_atomic(&self.log_path(source)?, body.as_bytes()).await?;
        index.needs_newline = false;
        Ok(count)
    }
}

#[async_trait]
impl FingerprintStore for FileFingerprintStore {
    async fn get(&self, source: &str, item_id: &str) -> anyhow::Result<Option<ContentFingerprint>> {
        let mut state = self.state.lock().await;
        if !state.contains_key(source) {
            let loaded = self.load(source).await?;
            state.insert(source.to_string(), loaded);
        }
        Ok(state
            .get(source)
            .and_then(|index| index.entries.get(item_id))
            .cloned())
    }

    async fn compare_and_set(
        &self,
        source: &str,
        expected: Option<&str>,
        next: ContentFingerprint,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        if !state.contains_key(source) {
            let loaded = self.load(source).await?;
            state.insert(source.to_string(), loaded);
        }
        let Some(index) = state.get_mut(source) else {
            bail!("fingerprint index for {source} vanished");
        };

        let current = index
            .entries
            .get(&next.item_id)
            .map(|fp| fp.content_hash.as_str());
        if current != expected {
            return Ok(false);
        }

        if let Err(err) = self.append(source, index.needs_newline, &next).await {
            // A partial write may have left a torn line behind.
            index.needs_newline = true;
            return Err(err);
        }
        index.needs_newline = false;
        index.entries.insert(next.item_id.clone(), next);
        Ok(true)
    }
}

/// Source-scoped dedup engine handed to one run.
#[derive(Clone)]
pub struct DedupEngine {
    store: Arc<dyn FingerprintStore>,
    source: String,
    run_id: Uuid,
}

/// Bound on compare-and-set retries when another writer races on the same item.
const MAX_CAS_ATTEMPTS: usize = 8;

impl DedupEngine {
    pub fn new(store: Arc<dyn FingerprintStore>, source: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            store,
            source: source.into(),
            run_id,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Read-only classification; returns the decision and the hash it was based on.
    pub async fn classify(
        &self,
        item_id: &str,
        content_hash: &str,
    ) -> anyhow::Result<(UpsertDecision, Option<String>)> {
        let stored = self.store.get(&self.source, item_id).await?;
        let decision = decide(stored.as_ref(), content_hash);
        Ok((decision, stored.map(|fp| fp.content_hash)))
    }

    /// Commits a fingerprint previously classified against `expected`.
    pub async fn commit(
        &self,
        item_id: &str,
        expected: Option<&str>,
        content_hash: &str,
    ) -> anyhow::Result<bool> {
        self.store
            .compare_and_set(&self.source, expected, self.fingerprint(item_id, content_hash))
            .await
    }

    /// Classifies and, for NEW/UPDATED, commits in one compare-and-set step.
    pub async fn should_upsert(&self, item_id: &str, content_hash: &str) -> anyhow::Result<UpsertDecision> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (decision, previous) = self.classify(item_id, content_hash).await?;
            if !decision.needs_write() {
                return Ok(decision);
            }
            if self.commit(item_id, previous.as_deref(), content_hash).await? {
                return Ok(decision);
            }
        }
        bail!(
            "fingerprint for {}/{item_id} kept changing under concurrent writers",
            self.source
        )
    }

    fn fingerprint(&self, item_id: &str, content_hash: &str) -> ContentFingerprint {
        ContentFingerprint {
            item_id: item_id.to_string(),
            content_hash: content_hash.to_string(),
            last_seen_run: self.run_id,
        }
    }
}
