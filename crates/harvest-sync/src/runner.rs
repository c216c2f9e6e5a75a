//! Run orchestrator: builds a fresh context per run and always returns a terminal result.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use harvest_core::{
    ErrorKind, ErrorRecord, FetchResult, FetchRun, MetricsSnapshot, OpenRun, RunOutcome,
};
use harvest_storage::{
    ArtifactStore, CheckpointStore, DedupEngine, FingerprintStore, HttpFetcher, HttpProfile,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, Instrument};

use crate::context::{Checkpoints, ExecutionContext, RawStorage};
use crate::error::run_error_kind;

/// The work of one source run.
#[async_trait]
pub trait RunBody: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: FetchRun,
    pub result: FetchResult,
    pub metrics: MetricsSnapshot,
    pub errors: Vec<ErrorRecord>,
}

pub struct FetchRunner {
    http: Arc<HttpFetcher>,
    checkpoints: Arc<dyn CheckpointStore>,
    fingerprints: Arc<dyn FingerprintStore>,
    artifacts: ArtifactStore,
}

impl FetchRunner {
    pub fn new(
        http: Arc<HttpFetcher>,
        checkpoints: Arc<dyn CheckpointStore>,
        fingerprints: Arc<dyn FingerprintStore>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            http,
            checkpoints,
            fingerprints,
            artifacts,
        }
    }

    pub fn http(&self) -> &Arc<HttpFetcher> {
        &self.http
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Fresh context: zeroed metrics, stores scoped to `source`.
    pub fn context(&self, source: &str, version: &str, profile: &HttpProfile) -> ExecutionContext {
        let run = OpenRun::start(source, version);
        let dedup = DedupEngine::new(Arc::clone(&self.fingerprints), source, run.run_id);
        ExecutionContext::new(
            run,
            self.http.for_source(source, profile),
            Checkpoints::new(Arc::clone(&self.checkpoints), source),
            dedup,
            RawStorage::new(self.artifacts.clone(), source),
        )
    }

    pub async fn execute<B>(&self, source: &str, version: &str, body: &B) -> RunReport
    where
        B: RunBody + ?Sized,
    {
        self.execute_with_profile(source, version, &HttpProfile::default(), body)
            .await
    }

    /// Runs `body` and never propagates its failure: errors and panics become
    /// `FetchResult::Error` with the partial metrics kept. Nothing already
    /// written is rolled back.
    pub async fn execute_with_profile<B>(
        &self,
        source: &str,
        version: &str,
        profile: &HttpProfile,
        body: &B,
    ) -> RunReport
    where
        B: RunBody + ?Sized,
    {
        let ctx = self.context(source, version, profile);
        let span = info_span!("fetch_run", run_id = %ctx.run_id(), source, version);

        let outcome = AssertUnwindSafe(body.run(&ctx))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let (result, run_outcome) = match outcome {
            Ok(Ok(())) => {
                let snapshot = ctx.snapshot();
                (
                    FetchResult::Success {
                        message: snapshot.summary_line(),
                        count: snapshot.changed(),
                    },
                    RunOutcome::Success,
                )
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                ctx.record_error(run_error_kind(&err), message.clone(), None);
                (FetchResult::Error { message }, RunOutcome::Error)
            }
            Err(panic) => {
                let message = format!("fetch body panicked: {}", panic_message(panic.as_ref()));
                ctx.record_error(ErrorKind::FatalConfig, message.clone(), None);
                (FetchResult::Error { message }, RunOutcome::Error)
            }
        };

        let metrics = ctx.snapshot();
        let errors = ctx.errors();
        let summary = match &result {
            FetchResult::Success { message, .. } => message.clone(),
            FetchResult::Error { message } => format!("{message} ({})", metrics.summary_line()),
        };
        let run = ctx.into_run().finish(run_outcome, summary);

        span.in_scope(|| match run.outcome {
            RunOutcome::Success => info!(errors = errors.len(), "{}", run.summary),
            RunOutcome::Error => error!(errors = errors.len(), "{}", run.summary),
        });

        RunReport {
            run,
            result,
            metrics,
            errors,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
