//! JSON status and trigger API over a shared [`Harvester`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use harvest_sync::Harvester;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "harvest-web";

#[derive(Clone)]
pub struct AppState {
    pub harvester: Arc<Harvester>,
}

impl AppState {
    pub fn new(harvester: Arc<Harvester>) -> Self {
        Self { harvester }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRow {
    pub name: String,
    pub category: String,
    pub version: String,
    pub schedule: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sources", get(sources_handler))
        .route("/runs", get(runs_handler))
        .route("/sources/{name}/fetch", post(fetch_handler))
        .route("/sources/{name}/dry-run", get(dry_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(harvester: Arc<Harvester>) -> anyhow::Result<()> {
    let port = harvester.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving harvest api");
    axum::serve(listener, app(AppState::new(harvester)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "sources": state.harvester.registry().len(),
    }))
    .into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    let rows: Vec<SourceRow> = state
        .harvester
        .registry()
        .iter()
        .map(|f| SourceRow {
            name: f.name().to_string(),
            category: f.category().to_string(),
            version: f.version().to_string(),
            schedule: f.schedule().map(str::to_string),
        })
        .collect();
    Json(rows).into_response()
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    match state.harvester.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn fetch_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if state.harvester.registry().get(&name).is_err() {
        return not_found(&name);
    }
    match state.harvester.run_source(&name).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

async fn dry_run_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if state.harvester.registry().get(&name).is_err() {
        return not_found(&name);
    }
    match state.harvester.dry_run_source(&name).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("unknown source {name}") })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use harvest_core::{item_id, DryRunResult, UpsertDecision};
    use harvest_sync::{
        DryRunProbe, ExecutionContext, Fetcher, FetcherRegistry, HarvestConfig, RunBody, RunReport,
    };
    use http_body_util::BodyExt;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct Notices;

    #[async_trait]
    impl RunBody for Notices {
        async fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
            for key in ["notice-1", "notice-2"] {
                ctx.mark_attempted();
                match ctx.upsert_raw(&item_id(key), key, "txt").await? {
                    UpsertDecision::New => ctx.mark_new(1),
                    UpsertDecision::Updated => ctx.mark_updated(1),
                    UpsertDecision::Unchanged => ctx.mark_skipped(),
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Fetcher for Notices {
        fn name(&self) -> &str {
            "notices"
        }

        fn version(&self) -> &str {
            "2"
        }

        fn category(&self) -> &str {
            "news"
        }

        async fn dry_run(&self, probe: &DryRunProbe) -> DryRunResult {
            let mut result = DryRunResult::new("notices");
            for check in probe.standard_checks().await {
                result.push(check);
            }
            result
        }
    }

    fn test_app(dir: &TempDir) -> Router {
        let mut registry = FetcherRegistry::new();
        registry.register(Arc::new(Notices)).unwrap();
        let harvester = Harvester::new(HarvestConfig::for_state_root(dir.path()), registry).unwrap();
        app(AppState::new(Arc::new(harvester)))
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_and_sources() {
        let dir = tempdir().unwrap();
        let app = test_app(&dir);

        let (status, health) = call(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["sources"], 1);

        let (_, sources) = call(&app, "GET", "/sources").await;
        let rows: Vec<SourceRow> = serde_json::from_value(sources).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "notices");
        assert_eq!(rows[0].version, "2");
    }

    #[tokio::test]
    async fn fetch_trigger_records_a_run() {
        let dir = tempdir().unwrap();
        let app = test_app(&dir);

        let (status, report) = call(&app, "POST", "/sources/notices/fetch").await;
        assert_eq!(status, StatusCode::OK);
        let report: RunReport = serde_json::from_value(report).unwrap();
        assert!(report.result.is_success());
        assert_eq!(report.metrics.new, 2);

        call(&app, "POST", "/sources/notices/fetch").await;
        let (_, runs) = call(&app, "GET", "/runs?limit=5").await;
        let runs: Vec<RunReport> = serde_json::from_value(runs).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].metrics.skipped, 2);
    }

    #[tokio::test]
    async fn unknown_sources_are_404() {
        let dir = tempdir().unwrap();
        let app = test_app(&dir);
        let (status, body) = call(&app, "POST", "/sources/nope/fetch").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
        let (status, _) = call(&app, "GET", "/sources/nope/dry-run").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dry_run_reports_checks() {
        let dir = tempdir().unwrap();
        let app = test_app(&dir);
        let (status, result) = call(&app, "GET", "/sources/notices/dry-run").await;
        assert_eq!(status, StatusCode::OK);
        let result: DryRunResult = serde_json::from_value(result).unwrap();
        assert!(result.all_passed(), "{}", result.render());
    }
}
