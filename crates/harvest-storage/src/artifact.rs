//! Raw storage sink: the latest fetched payload per item, keyed by item id.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::{path_segment, sha256_hex, write_atomic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub item_id: String,
    pub extension: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub stored_at: DateTime<Utc>,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        source: &str,
        item_id: &str,
        extension: &str,
    ) -> anyhow::Result<PathBuf> {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        Ok(PathBuf::from(path_segment(source)?)
            .join(format!("{}.{}", path_segment(item_id)?, path_segment(ext)?)))
    }

    /// Stores `content` for `item_id`, replacing any earlier version (last write wins).
    pub async fn store_raw_text(
        &self,
        source: &str,
        item_id: &str,
        content: &str,
        extension: &str,
    ) -> anyhow::Result<StoredArtifact> {
        self.store_bytes(source, item_id, extension, content.as_bytes())
            .await
    }

    pub async fn store_bytes(
        &self,
        source: &str,
        item_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = self.artifact_relative_path(source, item_id, extension)?;
        let absolute_path = self.root.join(&relative_path);
        write_atomic(&absolute_path, bytes)
            .await
            .with_context(|| format!("storing raw artifact {item_id} for {source}"))?;

        tracing::debug!(source, item_id, bytes = bytes.len(), "stored raw artifact");
        Ok(StoredArtifact {
            item_id: item_id.to_string(),
            extension: extension.trim_start_matches('.').to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
            stored_at: Utc::now(),
            relative_path,
            absolute_path,
        })
    }

    /// Reads back the latest stored payload, for reprocessing without the network.
    pub async fn read_raw_text(
        &self,
        source: &str,
        item_id: &str,
        extension: &str,
    ) -> anyhow::Result<Option<String>> {
        let path = self
            .root
            .join(self.artifact_relative_path(source, item_id, extension)?);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}
