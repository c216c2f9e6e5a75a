//! Run orchestration for Harvest: execution context, reconciliation, fetcher
//! registry, metadata sinks and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use harvest_core::DryRunResult;
use harvest_storage::{ArtifactStore, FileCheckpointStore, FileFingerprintStore, HttpFetcher};
use tracing::{info, warn};

pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod metadata;
pub mod reconcile;
pub mod runlog;
pub mod runner;
pub mod scheduler;

pub use config::HarvestConfig;
pub use context::{Checkpoints, ExecutionContext, RawStorage, RunRecorder, StagedItem};
pub use error::{check_response, run_error_kind, FatalConfig, ItemError};
pub use fetcher::{DryRunProbe, Fetcher, FetcherRegistry, RegistryError};
pub use metadata::{FetchMetadata, JsonlMetadataSink, MetadataSink, PgMetadataSink};
pub use reconcile::{
    diff_active_sets, document_status, reconcile, ActiveSetDiff, ActiveSetSource, DocumentStatus,
    FetchedDocument, ProbeOutcome, ReconcileReport,
};
pub use runlog::RunLog;
pub use runner::{FetchRunner, RunBody, RunReport};
pub use scheduler::{build_scheduler, maybe_build_scheduler, schedule_plan};

pub const CRATE_NAME: &str = "harvest-sync";

/// Process-wide entry point: one shared HTTP client and store set, many fetchers.
pub struct Harvester {
    config: HarvestConfig,
    registry: FetcherRegistry,
    runner: FetchRunner,
    metadata: Arc<dyn MetadataSink>,
    run_log: RunLog,
}

impl Harvester {
    pub fn new(config: HarvestConfig, registry: FetcherRegistry) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config()).context("building http client")?);
        let runner = FetchRunner::new(
            http,
            Arc::new(FileCheckpointStore::new(config.checkpoints_dir())),
            Arc::new(FileFingerprintStore::new(config.fingerprints_dir())),
            ArtifactStore::new(config.artifacts_dir.clone()),
        );
        let metadata: Arc<dyn MetadataSink> = match &config.database_url {
            Some(url) => Arc::new(PgMetadataSink::connect_lazy(url)?),
            None => Arc::new(JsonlMetadataSink::new(config.metadata_path())),
        };
        Ok(Self::with_components(config, registry, runner, metadata))
    }

    pub fn with_components(
        config: HarvestConfig,
        registry: FetcherRegistry,
        runner: FetchRunner,
        metadata: Arc<dyn MetadataSink>,
    ) -> Self {
        let run_log = RunLog::new(config.run_log_path());
        Self {
            config,
            registry,
            runner,
            metadata,
            run_log,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn registry(&self) -> &FetcherRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &FetchRunner {
        &self.runner
    }

    pub async fn run_source(&self, name: &str) -> Result<RunReport> {
        let fetcher = self.registry.get(name)?;
        Ok(self.run_fetcher(fetcher.as_ref()).await)
    }

    /// Runs one fetcher, then records its metadata and run log entry. Bookkeeping
    /// failures are logged and never change the run's result.
    pub async fn run_fetcher(&self, fetcher: &dyn Fetcher) -> RunReport {
        let report = self
            .runner
            .execute_with_profile(fetcher.name(), fetcher.version(), &fetcher.http_profile(), fetcher)
            .await;

        let record = FetchMetadata {
            run_id: report.run.run_id,
            source: report.run.source.clone(),
            category: fetcher.category().to_string(),
            item_count: report.metrics.changed(),
            fetched_at: report.run.finished_at,
            metadata: serde_json::json!({
                "version": report.run.version,
                "outcome": report.run.outcome,
                "summary": report.run.summary,
                "metrics": report.metrics,
                "error_count": report.errors.len(),
            }),
        };
        if let Err(err) = self.metadata.store_fetch_metadata(&record).await {
            warn!(source = %record.source, error = %format!("{err:#}"), "failed to store fetch metadata");
        }
        if let Err(err) = self.run_log.append(&report).await {
            warn!(source = %record.source, error = %format!("{err:#}"), "failed to append run log");
        }
        report
    }

    /// Runs the named sources concurrently; unknown names are logged and skipped.
    pub async fn run_sources(&self, names: &[String]) -> Vec<RunReport> {
        let mut fetchers = Vec::with_capacity(names.len());
        for name in names {
            match self.registry.get(name) {
                Ok(fetcher) => fetchers.push(fetcher),
                Err(err) => warn!(%err, "skipping source"),
            }
        }
        join_all(fetchers.iter().map(|f| self.run_fetcher(f.as_ref()))).await
    }

    pub async fn run_all(&self) -> Vec<RunReport> {
        let names = self.registry.names();
        info!(sources = names.len(), "running all sources");
        self.run_sources(&names).await
    }

    pub async fn dry_run_source(&self, name: &str) -> Result<DryRunResult> {
        let fetcher = self.registry.get(name)?;
        let probe = DryRunProbe::new(
            self.runner.http().for_source(fetcher.name(), &fetcher.http_profile()),
            Arc::clone(&self.metadata),
            vec![self.config.state_dir.clone(), self.config.artifacts_dir.clone()],
        );
        Ok(fetcher.dry_run(&probe).await)
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunReport>> {
        self.run_log.recent(limit).await
    }
}
