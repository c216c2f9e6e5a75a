//! Economic time series served as JSON observations, one request per series.

use async_trait::async_trait;
use harvest_core::{item_id, DryRunResult, UpsertDecision};
use harvest_storage::{HttpProfile, Url};
use harvest_sync::{
    check_response, DryRunProbe, ExecutionContext, FatalConfig, Fetcher, ItemError, RunBody,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{SourceConfigError, SourceMeta};

#[derive(Debug, Clone, Deserialize)]
pub struct EconomicSeriesConfig {
    pub api_base: String,
    pub series: Vec<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    #[serde(default)]
    observations: Vec<RawObservation>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    date: String,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub series: String,
    pub date: String,
    /// `None` for the upstream "missing value" marker.
    pub value: Option<f64>,
    pub raw_value: String,
}

impl Observation {
    pub fn natural_key(&self) -> String {
        format!("{}|{}", self.series, self.date)
    }
}

pub fn parse_observations(series: &str, body: &str) -> Result<Vec<Observation>, ItemError> {
    let response: ObservationsResponse =
        serde_json::from_str(body).map_err(|err| ItemError::parse(series, err))?;
    Ok(response
        .observations
        .into_iter()
        .map(|raw| Observation {
            series: series.to_string(),
            value: raw.value.trim().parse().ok(),
            date: raw.date,
            raw_value: raw.value,
        })
        .collect())
}

pub fn last_date_key(series: &str) -> String {
    format!("last_date:{series}")
}

pub struct EconomicSeriesFetcher {
    meta: SourceMeta,
    api_base: Url,
    series: Vec<String>,
    api_key_env: Option<String>,
}

impl EconomicSeriesFetcher {
    pub fn new(meta: SourceMeta, config: EconomicSeriesConfig) -> anyhow::Result<Self> {
        if config.series.is_empty() {
            return Err(SourceConfigError::Empty {
                name: meta.name,
                what: "series",
            }
            .into());
        }
        let api_base = Url::parse(&config.api_base)?;
        Ok(Self {
            meta,
            api_base,
            series: config.series,
            api_key_env: config.api_key_env,
        })
    }

    fn api_key(&self) -> Result<Option<String>, FatalConfig> {
        let Some(var) = &self.api_key_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => Err(FatalConfig(format!("{var} is not set for source {}", self.meta.name))),
        }
    }

    /// Observations from `start` (inclusive) so a revised latest point is seen again.
    pub fn request_url(&self, series: &str, start: Option<&str>, api_key: Option<&str>) -> Url {
        let mut url = self.api_base.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("series_id", series);
            query.append_pair("file_type", "json");
            if let Some(start) = start {
                query.append_pair("observation_start", start);
            }
            if let Some(key) = api_key {
                query.append_pair("api_key", key);
            }
        }
        url
    }

    async fn sync_series(
        &self,
        ctx: &ExecutionContext,
        series: &str,
        api_key: Option<&str>,
    ) -> Result<(), ItemError> {
        let checkpoint_key = last_date_key(series);
        let since = ctx.checkpoint().get(&checkpoint_key).await?;
        let url = self.request_url(series, since.as_deref(), api_key);
        let body = check_response(ctx.http().get(url.as_str()).await?)?.text().await?;
        let observations = parse_observations(series, &body)?;
        debug!(series, observations = observations.len(), since = ?since, "fetched series");

        let mut latest = since;
        let mut earliest_failed: Option<String> = None;
        for observation in observations {
            ctx.mark_attempted();
            ctx.mark_fetched();
            let key = observation.natural_key();
            let body = serde_json::to_string(&observation).map_err(ItemError::storage)?;
            match ctx.upsert_raw(&item_id(&key), &body, "json").await {
                Ok(UpsertDecision::New) => ctx.mark_new(1),
                Ok(UpsertDecision::Updated) => ctx.mark_updated(1),
                Ok(UpsertDecision::Unchanged) => ctx.mark_skipped(),
                Err(err) => {
                    ctx.fail_item(&err, &key);
                    if earliest_failed.as_deref().map_or(true, |f| observation.date.as_str() < f) {
                        earliest_failed = Some(observation.date);
                    }
                    continue;
                }
            }
            // ISO dates order lexically.
            if latest.as_deref().map_or(true, |l| observation.date.as_str() > l) {
                latest = Some(observation.date);
            }
        }

        // A failed observation is requested again next run.
        let resume_from = match (latest, earliest_failed) {
            (Some(latest), Some(failed)) => Some(latest.min(failed)),
            (latest, failed) => latest.or(failed),
        };
        if let Some(resume_from) = resume_from {
            ctx.checkpoint().set(&checkpoint_key, &resume_from).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RunBody for EconomicSeriesFetcher {
    async fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let api_key = self.api_key()?;
        for (position, series) in self.series.iter().enumerate() {
            match self.sync_series(ctx, series, api_key.as_deref()).await {
                Ok(()) => {}
                Err(err) if err.is_rate_limited() => {
                    info!(series, error = %err, "rate limited; remaining series wait for the next run");
                    ctx.defer_remaining((self.series.len() - position) as u64, series);
                    break;
                }
                Err(err) => ctx.fail_item(&err, series),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for EconomicSeriesFetcher {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn version(&self) -> &str {
        "1"
    }

    fn category(&self) -> &str {
        &self.meta.category
    }

    fn http_profile(&self) -> HttpProfile {
        self.meta.profile.clone()
    }

    fn schedule(&self) -> Option<&str> {
        self.meta.schedule.as_deref()
    }

    async fn dry_run(&self, probe: &DryRunProbe) -> DryRunResult {
        let mut result = DryRunResult::new(self.name());
        if let Some(var) = &self.api_key_env {
            result.push(probe.check_env("api key", var));
        }
        // Never send the key in a dry run.
        let url = self.request_url(&self.series[0], None, None);
        result.push(probe.check_url("api reachable", url.as_str()).await);
        for check in probe.standard_checks().await {
            result.push(check);
        }
        result
    }
}
