use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use harvest_core::{item_id, ErrorKind, RunOutcome};
use harvest_sources::{build_registry, SourcesFile};
use harvest_sync::{HarvestConfig, Harvester};
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Site {
    feed: Arc<Mutex<String>>,
    acts: Arc<Mutex<BTreeMap<String, (String, String)>>>,
    document_gets: Arc<AtomicUsize>,
    reject_head: Arc<AtomicBool>,
    maintenance: Arc<AtomicBool>,
    observation_starts: Arc<Mutex<Vec<Option<String>>>>,
}

fn feed_xml(items: &[(&str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, title)| format!("<item><guid>{guid}</guid><title>{title}</title></item>"))
        .collect();
    format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title>{items}</channel></rss>"#)
}

async fn feed(State(site): State<Site>) -> Response {
    let body = site.feed.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, "application/rss+xml")], body).into_response()
}

async fn acts_listing(State(site): State<Site>) -> Response {
    if site.maintenance.load(Ordering::SeqCst) {
        return "<html><body>Down for maintenance</body></html>".into_response();
    }
    let links: String = site
        .acts
        .lock()
        .unwrap()
        .keys()
        .map(|id| format!(r#"<li><a class="document-link" href="/acts/{id}">{id}</a></li>"#))
        .collect();
    format!("<html><body><ul>{links}</ul></body></html>").into_response()
}

async fn act(State(site): State<Site>, method: Method, Path(id): Path<String>) -> Response {
    if method == Method::GET {
        site.document_gets.fetch_add(1, Ordering::SeqCst);
    } else if method == Method::HEAD && site.reject_head.load(Ordering::SeqCst) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let acts = site.acts.lock().unwrap();
    match acts.get(&id) {
        Some((body, last_modified)) => (
            [(header::LAST_MODIFIED, last_modified.clone())],
            format!("<html><nav>menu</nav><main>{body}</main></html>"),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn observations(State(site): State<Site>, Query(params): Query<HashMap<String, String>>) -> Response {
    let start = params.get("observation_start").cloned();
    site.observation_starts.lock().unwrap().push(start.clone());
    if params.get("series_id").map(String::as_str) == Some("THROTTLED") {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let all = [("2024-01-01", "3.7"), ("2024-02-01", "3.9"), ("2024-03-01", ".")];
    let observations: Vec<_> = all
        .iter()
        .filter(|(date, _)| start.as_deref().map_or(true, |s| *date >= s))
        .map(|(date, value)| serde_json::json!({ "date": date, "value": value }))
        .collect();
    axum::Json(serde_json::json!({ "observations": observations })).into_response()
}

async fn serve(site: Site) -> SocketAddr {
    let app = Router::new()
        .route("/feed.xml", get(feed))
        .route("/acts", get(acts_listing))
        .route("/acts/{id}", get(act))
        .route("/series/observations", get(observations))
        .with_state(site);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn harvester(dir: &TempDir, addr: SocketAddr) -> Harvester {
    let yaml = format!(
        r#"
sources:
  - name: press
    kind: rss
    feeds: ["http://{addr}/feed.xml"]
  - name: acts
    kind: legislation
    listing_urls: ["http://{addr}/acts"]
  - name: labour
    kind: economic_series
    api_base: "http://{addr}/series/observations"
    series: [UNRATE]
  - name: labour-keyed
    kind: economic_series
    api_base: "http://{addr}/series/observations"
    series: [UNRATE]
    api_key_env: HARVEST_SOURCES_TEST_MISSING_KEY
  - name: throttled
    kind: economic_series
    api_base: "http://{addr}/series/observations"
    series: [THROTTLED, UNRATE]
  - name: labour-moved
    kind: economic_series
    api_base: "http://{addr}/moved/observations"
    series: [UNRATE]
    api_key_env: HARVEST_SOURCES_TEST_MOVED_KEY
"#
    );
    let registry = build_registry(&SourcesFile::parse(&yaml).unwrap()).unwrap();
    Harvester::new(HarvestConfig::for_state_root(dir.path()), registry).unwrap()
}

fn counts(message: &str) -> &str {
    message.split_once(": ").map(|(_, rest)| rest).unwrap_or(message)
}

#[tokio::test]
async fn rss_feed_is_incremental() {
    let site = Site::default();
    *site.feed.lock().unwrap() = feed_xml(&[("a", "One"), ("b", "Two"), ("c", "Three")]);
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    let first = harvester.run_source("press").await.unwrap();
    assert_eq!(counts(first.result.message()), "3 new, 0 updated, 0 skipped, 0 failed");

    let second = harvester.run_source("press").await.unwrap();
    assert_eq!(counts(second.result.message()), "0 new, 0 updated, 3 skipped, 0 failed");

    *site.feed.lock().unwrap() = feed_xml(&[("a", "One"), ("b", "Two (corrected)"), ("c", "Three"), ("d", "Four")]);
    let third = harvester.run_source("press").await.unwrap();
    assert_eq!(counts(third.result.message()), "1 new, 1 updated, 2 skipped, 0 failed");
}

#[tokio::test]
async fn legislation_probes_before_fetching_and_tombstones_repeals() {
    let site = Site::default();
    {
        let mut acts = site.acts.lock().unwrap();
        for id in ["water-1990", "roads-2001", "fisheries-2010"] {
            acts.insert(id.into(), (format!("{id} text"), "Mon, 01 Jan 2024 00:00:00 GMT".into()));
        }
    }
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    let first = harvester.run_source("acts").await.unwrap();
    assert_eq!(counts(first.result.message()), "3 new, 0 updated, 0 skipped, 0 failed");
    assert_eq!(site.document_gets.swap(0, Ordering::SeqCst), 3);

    // Nothing modified since the last check: probes only.
    let second = harvester.run_source("acts").await.unwrap();
    assert_eq!(counts(second.result.message()), "0 new, 0 updated, 3 skipped, 0 failed");
    assert_eq!(site.document_gets.swap(0, Ordering::SeqCst), 0);

    {
        let mut acts = site.acts.lock().unwrap();
        acts.remove("roads-2001");
        acts.insert(
            "water-1990".into(),
            ("water-1990 amended".into(), "Fri, 01 Jan 2100 00:00:00 GMT".into()),
        );
    }
    let third = harvester.run_source("acts").await.unwrap();
    assert_eq!(counts(third.result.message()), "0 new, 1 updated, 1 skipped, 0 failed");
    assert_eq!(site.document_gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn economic_series_resume_from_last_date() {
    let site = Site::default();
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    let first = harvester.run_source("labour").await.unwrap();
    assert_eq!(counts(first.result.message()), "3 new, 0 updated, 0 skipped, 0 failed");
    let second = harvester.run_source("labour").await.unwrap();
    assert_eq!(counts(second.result.message()), "0 new, 0 updated, 1 skipped, 0 failed");

    let starts = site.observation_starts.lock().unwrap().clone();
    assert_eq!(starts, vec![None, Some("2024-03-01".to_string())]);
}

#[tokio::test]
async fn economic_series_without_key_fail_fast() {
    let site = Site::default();
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    let report = harvester.run_source("labour-keyed").await.unwrap();
    assert_eq!(report.run.outcome, RunOutcome::Error);
    assert_eq!(report.errors[0].kind, ErrorKind::FatalConfig);
    assert!(site.observation_starts.lock().unwrap().is_empty());

    let dry = harvester.dry_run_source("labour-keyed").await.unwrap();
    assert!(!dry.all_passed());
}

#[tokio::test]
async fn rate_limited_series_stop_the_run_without_retrying() {
    let site = Site::default();
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    let report = harvester.run_source("throttled").await.unwrap();
    assert!(report.result.is_success());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, ErrorKind::RateLimited);
    // Both series are deferred, the throttled one included.
    assert_eq!(report.metrics.attempted, 2);
    assert_eq!(report.metrics.skipped, 2);
    assert_eq!(counts(report.result.message()), "0 new, 0 updated, 2 skipped, 0 failed");
    // One request for THROTTLED, none for the series after it.
    assert_eq!(site.observation_starts.lock().unwrap().len(), 1);
}

fn seed_acts(site: &Site) {
    let mut acts = site.acts.lock().unwrap();
    for id in ["water-1990", "roads-2001", "fisheries-2010"] {
        acts.insert(id.into(), (format!("{id} text"), "Mon, 01 Jan 2024 00:00:00 GMT".into()));
    }
}

#[tokio::test]
async fn documents_are_still_refreshed_when_head_is_refused() {
    let site = Site::default();
    seed_acts(&site);
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    harvester.run_source("acts").await.unwrap();
    site.document_gets.store(0, Ordering::SeqCst);

    site.reject_head.store(true, Ordering::SeqCst);
    site.acts
        .lock()
        .unwrap()
        .get_mut("water-1990")
        .unwrap()
        .0 = "water-1990 amended".into();
    let second = harvester.run_source("acts").await.unwrap();
    assert_eq!(counts(second.result.message()), "0 new, 1 updated, 2 skipped, 0 failed");
    assert!(second.errors.is_empty());
    assert_eq!(site.document_gets.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn a_listing_without_links_never_repeals_the_register() {
    let site = Site::default();
    seed_acts(&site);
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    harvester.run_source("acts").await.unwrap();

    site.maintenance.store(true, Ordering::SeqCst);
    let down = harvester.run_source("acts").await.unwrap();
    assert_eq!(down.run.outcome, RunOutcome::Error);
    assert_eq!(down.errors[0].kind, ErrorKind::ParseError);

    // Every act is still known and active: nothing comes back as new.
    site.maintenance.store(false, Ordering::SeqCst);
    let back = harvester.run_source("acts").await.unwrap();
    assert_eq!(counts(back.result.message()), "0 new, 0 updated, 3 skipped, 0 failed");
}

#[tokio::test]
async fn a_failed_observation_is_requested_again() {
    let site = Site::default();
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    // A directory squatting on the artifact path makes the January write fail.
    let blocked = dir
        .path()
        .join("artifacts")
        .join("labour")
        .join(format!("{}.json", item_id("UNRATE|2024-01-01")));
    std::fs::create_dir_all(&blocked).unwrap();

    let first = harvester.run_source("labour").await.unwrap();
    assert_eq!(counts(first.result.message()), "2 new, 0 updated, 0 skipped, 1 failed");
    assert_eq!(first.errors[0].kind, ErrorKind::StorageError);

    std::fs::remove_dir(&blocked).unwrap();
    let second = harvester.run_source("labour").await.unwrap();
    assert_eq!(counts(second.result.message()), "1 new, 0 updated, 2 skipped, 0 failed");

    let third = harvester.run_source("labour").await.unwrap();
    assert_eq!(counts(third.result.message()), "0 new, 0 updated, 1 skipped, 0 failed");

    let starts = site.observation_starts.lock().unwrap().clone();
    assert_eq!(
        starts,
        vec![None, Some("2024-01-01".to_string()), Some("2024-03-01".to_string())]
    );
}

#[tokio::test]
async fn api_keys_never_reach_run_records() {
    const KEY: &str = "k3y-that-must-stay-private";
    std::env::set_var("HARVEST_SOURCES_TEST_MOVED_KEY", KEY);
    let site = Site::default();
    let addr = serve(site.clone()).await;
    let dir = tempdir().unwrap();
    let harvester = harvester(&dir, addr);

    let report = harvester.run_source("labour-moved").await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].message.contains("api_key=REDACTED"), "{}", report.errors[0].message);

    let recorded = serde_json::to_string(&harvester.recent_runs(10).await.unwrap()).unwrap();
    assert!(!recorded.contains(KEY));
    let log = std::fs::read_to_string(dir.path().join("state").join("runs.jsonl")).unwrap();
    assert!(!log.contains(KEY));
}
