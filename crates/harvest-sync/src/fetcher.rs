//! Fetcher contract, dry-run probes and the explicit name → fetcher registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{DryRunCheck, DryRunResult};
use harvest_storage::{HttpProfile, SourceHttp, StatusCode};
use thiserror::Error;
use tokio::fs;

use crate::metadata::MetadataSink;
use crate::runner::RunBody;

/// One data source. `RunBody::run` is the fetch; everything else is description.
#[async_trait]
pub trait Fetcher: RunBody {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn category(&self) -> &str;

    fn http_profile(&self) -> HttpProfile {
        HttpProfile::default()
    }

    /// Cron expression overriding the global schedule.
    fn schedule(&self) -> Option<&str> {
        None
    }

    /// Pre-flight checks; must not mutate anything.
    async fn dry_run(&self, probe: &DryRunProbe) -> DryRunResult;
}

/// Non-mutating checks available to [`Fetcher::dry_run`].
pub struct DryRunProbe {
    http: SourceHttp,
    metadata: Arc<dyn MetadataSink>,
    writable_dirs: Vec<PathBuf>,
}

impl DryRunProbe {
    pub fn new(http: SourceHttp, metadata: Arc<dyn MetadataSink>, writable_dirs: Vec<PathBuf>) -> Self {
        Self {
            http,
            metadata,
            writable_dirs,
        }
    }

    pub fn http(&self) -> &SourceHttp {
        &self.http
    }

    /// HEAD, falling back to GET for servers that reject HEAD.
    pub async fn check_url(&self, name: &str, url: &str) -> DryRunCheck {
        let head = match self.http.head(url).await {
            Ok(resp) => resp,
            Err(err) => return DryRunCheck::fail(name, format!("{url}: {err}")),
        };
        let resp = if matches!(
            head.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            head.close();
            match self.http.get(url).await {
                Ok(resp) => resp,
                Err(err) => return DryRunCheck::fail(name, format!("{url}: {err}")),
            }
        } else {
            head
        };

        let status = resp.status();
        resp.close();
        if status.is_success() {
            DryRunCheck::pass(name, format!("{url} answered {status}"))
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            DryRunCheck::fail(name, format!("{url} is rate limiting us ({status})"))
        } else {
            DryRunCheck::fail(name, format!("{url} answered {status}"))
        }
    }

    pub fn check_env(&self, name: &str, var: &str) -> DryRunCheck {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => DryRunCheck::pass(name, format!("{var} is set")),
            Ok(_) => DryRunCheck::fail(name, format!("{var} is empty")),
            Err(_) => DryRunCheck::fail(name, format!("{var} is not set")),
        }
    }

    /// Inspects permissions only; a missing directory passes if its nearest
    /// existing ancestor is writable.
    pub async fn check_dir_writable(&self, name: &str, path: &Path) -> DryRunCheck {
        let mut candidate = Some(path);
        while let Some(dir) = candidate {
            match fs::metadata(dir).await {
                Ok(meta) if !meta.is_dir() => {
                    return DryRunCheck::fail(name, format!("{} is not a directory", dir.display()))
                }
                Ok(meta) if meta.permissions().readonly() => {
                    return DryRunCheck::fail(name, format!("{} is read-only", dir.display()))
                }
                Ok(_) if dir == path => {
                    return DryRunCheck::pass(name, format!("{} is writable", path.display()))
                }
                Ok(_) => {
                    return DryRunCheck::pass(
                        name,
                        format!("{} will be created under {}", path.display(), dir.display()),
                    )
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    candidate = dir.parent().filter(|p| !p.as_os_str().is_empty());
                }
                Err(err) => {
                    return DryRunCheck::fail(name, format!("{}: {err}", dir.display()))
                }
            }
        }
        // Relative path with no existing component: it lands in the working directory.
        self.cwd_check(name, path).await
    }

    async fn cwd_check(&self, name: &str, path: &Path) -> DryRunCheck {
        match fs::metadata(".").await {
            Ok(meta) if !meta.permissions().readonly() => DryRunCheck::pass(
                name,
                format!("{} will be created in the working directory", path.display()),
            ),
            _ => DryRunCheck::fail(name, "working directory is not writable"),
        }
    }

    pub async fn check_metadata_sink(&self) -> DryRunCheck {
        match self.metadata.ping().await {
            Ok(()) => DryRunCheck::pass("metadata sink", self.metadata.describe()),
            Err(err) => DryRunCheck::fail("metadata sink", format!("{}: {err:#}", self.metadata.describe())),
        }
    }

    /// Writable state directories plus metadata sink reachability.
    pub async fn standard_checks(&self) -> Vec<DryRunCheck> {
        let mut checks = Vec::with_capacity(self.writable_dirs.len() + 1);
        for dir in &self.writable_dirs {
            checks.push(self.check_dir_writable("writable directory", dir).await);
        }
        checks.push(self.check_metadata_sink().await);
        checks
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a fetcher named {0} is already registered")]
    Duplicate(String),
    #[error("no fetcher registered for {0}")]
    Unknown(String),
}

#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: BTreeMap<String, Arc<dyn Fetcher>>,
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherRegistry")
            .field("fetchers", &self.fetchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) -> Result<(), RegistryError> {
        let name = fetcher.name().to_string();
        if self.fetchers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.fetchers.insert(name, fetcher);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Fetcher>, RegistryError> {
        self.fetchers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.fetchers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Fetcher>> {
        self.fetchers.values()
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};
    use harvest_storage::{HttpClientConfig, HttpFetcher};
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    use crate::context::ExecutionContext;
    use crate::metadata::JsonlMetadataSink;

    struct Noop(&'static str);

    #[async_trait]
    impl RunBody for Noop {
        async fn run(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Fetcher for Noop {
        fn name(&self) -> &str {
            self.0
        }

        fn version(&self) -> &str {
            "1"
        }

        fn category(&self) -> &str {
            "test"
        }

        async fn dry_run(&self, probe: &DryRunProbe) -> DryRunResult {
            let mut result = DryRunResult::new(self.0);
            for check in probe.standard_checks().await {
                result.push(check);
            }
            result
        }
    }

    fn probe(dirs: Vec<PathBuf>, sink_path: PathBuf) -> DryRunProbe {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
            .for_source("probe", &HttpProfile::default());
        DryRunProbe::new(http, Arc::new(JsonlMetadataSink::new(sink_path)), dirs)
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = FetcherRegistry::new();
        registry.register(Arc::new(Noop("rss"))).unwrap();
        registry.register(Arc::new(Noop("economic"))).unwrap();
        let err = registry.register(Arc::new(Noop("rss"))).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "rss"));
        assert_eq!(registry.names(), vec!["economic", "rss"]);
        assert!(matches!(registry.get("wiki"), Err(RegistryError::Unknown(_))));
    }

    #[tokio::test]
    async fn standard_checks_do_not_create_anything() {
        let dir = tempdir().unwrap();
        let state = dir.path().join("state");
        let probe = probe(vec![state.clone()], state.join("fetch_metadata.jsonl"));

        let result = Noop("rss").dry_run(&probe).await;
        assert!(result.all_passed(), "{}", result.render());
        assert!(!state.exists());
    }

    #[tokio::test]
    async fn dir_check_fails_for_regular_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("artifacts");
        std::fs::write(&file, "x").unwrap();
        let probe = probe(vec![], dir.path().join("meta.jsonl"));
        assert!(!probe.check_dir_writable("artifacts", &file).await.passed);
    }

    #[tokio::test]
    async fn env_check_reports_missing_variables() {
        let probe = probe(vec![], PathBuf::from("meta.jsonl"));
        assert!(!probe.check_env("api key", "HARVEST_TEST_SURELY_UNSET_VAR").passed);
    }

    #[tokio::test]
    async fn url_check_uses_head_and_reports_status() {
        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/gone", get(|| async { (AxumStatus::GONE, "gone") }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let probe = probe(vec![], PathBuf::from("meta.jsonl"));
        assert!(probe.check_url("feed", &format!("http://{addr}/ok")).await.passed);
        let gone = probe.check_url("feed", &format!("http://{addr}/gone")).await;
        assert!(!gone.passed);
        assert!(gone.detail.contains("410"));
    }
}
