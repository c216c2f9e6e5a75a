//! Reference fetchers and the `sources.yaml` registry loader.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use harvest_storage::{HttpProfile, TokenBucketConfig};
use harvest_sync::{Fetcher, FetcherRegistry};
use serde::Deserialize;
use thiserror::Error;

pub mod economic;
pub mod legislation;
pub mod rss;

pub use economic::{EconomicSeriesConfig, EconomicSeriesFetcher};
pub use legislation::{LegislationConfig, LegislationFetcher};
pub use rss::{RssConfig, RssFetcher};

pub const CRATE_NAME: &str = "harvest-sources";

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(flatten)]
    pub kind: SourceKind,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Rss(RssConfig),
    Legislation(LegislationConfig),
    EconomicSeries(EconomicSeriesConfig),
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rss(_) => "rss",
            Self::Legislation(_) => "legislation",
            Self::EconomicSeries(_) => "economic_series",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpSettings {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_ms: u64,
}

impl HttpSettings {
    pub fn profile(&self) -> HttpProfile {
        HttpProfile {
            user_agent: self.user_agent.clone(),
            timeout: self.timeout_secs.map(Duration::from_secs),
            token_bucket: self.rate_limit.map(|r| TokenBucketConfig {
                capacity: r.capacity,
                refill_every: Duration::from_millis(r.refill_ms),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceConfigError {
    #[error("source {name} has no {what} configured")]
    Empty { name: String, what: &'static str },
    #[error("source {name}: invalid selector {selector:?}: {message}")]
    Selector {
        name: String,
        selector: String,
        message: String,
    },
}

/// Shared descriptive fields for a configured fetcher.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub name: String,
    pub category: String,
    pub schedule: Option<String>,
    pub profile: HttpProfile,
}

impl SourceMeta {
    fn from_config(config: &SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            category: config
                .category
                .clone()
                .unwrap_or_else(|| config.kind.label().to_string()),
            schedule: config.schedule.clone(),
            profile: config.http.profile(),
        }
    }
}

impl SourcesFile {
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing sources file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

pub fn build_fetcher(config: &SourceConfig) -> Result<Arc<dyn Fetcher>> {
    let meta = SourceMeta::from_config(config);
    let fetcher: Arc<dyn Fetcher> = match &config.kind {
        SourceKind::Rss(rss) => Arc::new(RssFetcher::new(meta, rss.clone())?),
        SourceKind::Legislation(leg) => Arc::new(LegislationFetcher::new(meta, leg.clone())?),
        SourceKind::EconomicSeries(econ) => Arc::new(EconomicSeriesFetcher::new(meta, econ.clone())?),
    };
    Ok(fetcher)
}

/// Registry of every enabled source in the file.
pub fn build_registry(file: &SourcesFile) -> Result<FetcherRegistry> {
    let mut registry = FetcherRegistry::new();
    for config in file.enabled() {
        let fetcher = build_fetcher(config).with_context(|| format!("configuring source {}", config.name))?;
        registry.register(fetcher)?;
    }
    Ok(registry)
}
