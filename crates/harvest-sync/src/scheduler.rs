use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::fetcher::FetcherRegistry;
use crate::Harvester;

/// Cron expression → fetchers it triggers. Fetchers without their own
/// schedule share `default_cron`.
pub fn schedule_plan(registry: &FetcherRegistry, default_cron: &str) -> BTreeMap<String, Vec<String>> {
    let mut plan: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for fetcher in registry.iter() {
        let cron = fetcher.schedule().unwrap_or(default_cron).to_string();
        plan.entry(cron).or_default().push(fetcher.name().to_string());
    }
    plan
}

pub async fn build_scheduler(harvester: Arc<Harvester>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let plan = schedule_plan(harvester.registry(), &harvester.config().sync_cron);

    for (cron, names) in plan {
        let job_harvester = Arc::clone(&harvester);
        let job_names = names.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let harvester = Arc::clone(&job_harvester);
            let names = job_names.clone();
            Box::pin(async move {
                info!(sources = ?names, "scheduled fetch triggered");
                for report in harvester.run_sources(&names).await {
                    if !report.result.is_success() {
                        warn!(source = %report.run.source, "scheduled fetch failed: {}", report.run.summary);
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, sources = ?names, "scheduled fetchers");
    }
    Ok(sched)
}

pub async fn maybe_build_scheduler(harvester: Arc<Harvester>) -> Result<Option<JobScheduler>> {
    if !harvester.config().scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(harvester).await.map(Some)
}
