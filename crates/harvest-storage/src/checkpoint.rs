//! Durable per-source key/value checkpoints.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use harvest_core::CheckpointEntry;
use tokio::fs;
use tokio::sync::Mutex;

use crate::{path_segment, write_atomic};

/// Minimal checkpoint contract. Every call is namespaced by `source`; one
/// source can never read or overwrite another source's keys.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, source: &str, key: &str) -> anyhow::Result<Option<String>>;

    /// Durably replaces the value for `key`. Readers observe either the old or
    /// the new value, never a partial write.
    async fn set(&self, source: &str, key: &str, value: &str) -> anyhow::Result<()>;

    async fn entries(&self, source: &str) -> anyhow::Result<Vec<CheckpointEntry>>;
}

type SourceEntries = BTreeMap<String, CheckpointEntry>;

/// One JSON document per source under `root`, replaced atomically on every `set`.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    cache: Mutex<HashMap<String, SourceEntries>>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, source: &str) -> anyhow::Result<PathBuf> {
        Ok(self
            .root
            .join(format!("{}.checkpoints.json", path_segment(source)?)))
    }

    async fn load(&self, source: &str) -> anyhow::Result<SourceEntries> {
        let path = self.path_for(source)?;
        match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing checkpoint file {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SourceEntries::new()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, source: &str, key: &str) -> anyhow::Result<Option<String>> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(source) {
            let loaded = self.load(source).await?;
            cache.insert(source.to_string(), loaded);
        }
        Ok(cache
            .get(source)
            .and_then(|entries| entries.get(key))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, source: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let mut cache = self.cache.lock().await;
        let mut entries = match cache.get(source) {
            Some(entries) => entries.clone(),
            None => self.load(source).await?,
        };
        entries.insert(
            key.to_string(),
            CheckpointEntry {
                source: source.to_string(),
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );

        let bytes = serde_json::to_vec_pretty(&entries).context("serializing checkpoints")?;
        write_atomic(&self.path_for(source)?, &bytes)
            .await
            .with_context(|| format!("committing checkpoint {source}/{key}"))?;
        // Only committed state becomes visible to readers.
        cache.insert(source.to_string(), entries);
        Ok(())
    }

    async fn entries(&self, source: &str) -> anyhow::Result<Vec<CheckpointEntry>> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(source) {
            let loaded = self.load(source).await?;
            cache.insert(source.to_string(), loaded);
        }
        Ok(cache
            .get(source)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}
