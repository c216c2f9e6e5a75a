//! Durable per-source state (raw artifacts, checkpoints, fingerprints) and the
//! shared rate-limited HTTP transport for Harvest.

use std::path::Path;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod artifact;
pub mod checkpoint;
pub mod fingerprint;
pub mod http;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use checkpoint::{CheckpointStore, FileCheckpointStore};
pub use fingerprint::{decide, DedupEngine, FileFingerprintStore, FingerprintStore};
pub use http::{
    classify_reqwest_error, classify_status, redact_url, BackoffPolicy, FetchError,
    HttpClientConfig, HttpFetcher, HttpProfile, HttpResponse, RetryDisposition,
    SimpleTokenBucket, SourceHttp, TokenBucketConfig,
};
pub use reqwest::{StatusCode, Url};

pub const CRATE_NAME: &str = "harvest-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content fingerprint for normalized text.
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Validates a value used as a single path segment (source name, item id).
pub(crate) fn path_segment(value: &str) -> anyhow::Result<&str> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        bail!("`{value}` is not a valid storage key segment");
    }
    Ok(value)
}

/// Replaces `path` with `bytes` through a temp file in the same directory and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let Some(parent) = path.parent() else {
        bail!("{} has no parent directory", path.display());
    };
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(content_hash("hello world"), sha256_hex(b"hello world"));
    }

    #[test]
    fn path_segments_reject_traversal() {
        assert!(path_segment("rss-hn").is_ok());
        assert!(path_segment("a1b2.c3_d4").is_ok());
        assert!(path_segment("..").is_err());
        assert!(path_segment("a/b").is_err());
        assert!(path_segment("").is_err());
    }

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
