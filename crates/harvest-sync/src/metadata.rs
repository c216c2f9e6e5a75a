//! Per-run fetch metadata sinks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchMetadata {
    pub run_id: Uuid,
    pub source: String,
    pub category: String,
    pub item_count: u64,
    pub fetched_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn store_fetch_metadata(&self, record: &FetchMetadata) -> Result<()>;

    /// Reachability check without side effects.
    async fn ping(&self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Appends one JSON line per run to a file in the state directory.
pub struct JsonlMetadataSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMetadataSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetadataSink for JsonlMetadataSink {
    async fn store_fetch_metadata(&self, record: &FetchMetadata) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("serializing fetch metadata")?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.sync_data().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        match fs::metadata(&self.path).await {
            Ok(meta) if meta.permissions().readonly() => {
                anyhow::bail!("{} is read-only", self.path.display())
            }
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("inspecting {}", self.path.display())),
        }
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

/// Writes to the `fetch_metadata` table; the schema is created on first use.
pub struct PgMetadataSink {
    pool: PgPool,
    schema: OnceCell<()>,
}

impl PgMetadataSink {
    /// No connection is opened until the first query.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(database_url)
            .context("parsing DATABASE_URL")?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS fetch_metadata (
                        id          BIGSERIAL PRIMARY KEY,
                        run_id      UUID NOT NULL,
                        source      TEXT NOT NULL,
                        category    TEXT NOT NULL,
                        item_count  BIGINT NOT NULL,
                        fetched_at  TIMESTAMPTZ NOT NULL,
                        metadata    JSONB NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .context("creating fetch_metadata table")?;
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataSink for PgMetadataSink {
    async fn store_fetch_metadata(&self, record: &FetchMetadata) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO fetch_metadata (run_id, source, category, item_count, fetched_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.run_id)
        .bind(&record.source)
        .bind(&record.category)
        .bind(i64::try_from(record.item_count).unwrap_or(i64::MAX))
        .bind(record.fetched_at)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting fetch metadata for {}", record.source))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("pinging metadata database")?;
        Ok(())
    }

    fn describe(&self) -> String {
        "postgres:fetch_metadata".to_string()
    }
}
