//! Legislation registers: an active set of documents reconciled on every run.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::DryRunResult;
use harvest_storage::{HttpProfile, Url};
use harvest_sync::{
    check_response, reconcile, ActiveSetSource, DryRunProbe, ExecutionContext, FetchedDocument,
    Fetcher, ItemError, ProbeOutcome, RunBody,
};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{SourceConfigError, SourceMeta};

#[derive(Debug, Clone, Deserialize)]
pub struct LegislationConfig {
    pub listing_urls: Vec<String>,
    #[serde(default = "default_link_selector")]
    pub link_selector: String,
    #[serde(default = "default_content_selector")]
    pub content_selector: String,
}

fn default_link_selector() -> String {
    "a.document-link".to_string()
}

fn default_content_selector() -> String {
    "main".to_string()
}

fn parse_selector(name: &str, selector: &str) -> Result<Selector, SourceConfigError> {
    Selector::parse(selector).map_err(|e| SourceConfigError::Selector {
        name: name.to_string(),
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Absolute document URLs linked from a listing page.
pub fn extract_document_links(listing_url: &str, html: &str, links: &Selector) -> Result<BTreeSet<String>, ItemError> {
    let base = Url::parse(listing_url).map_err(|err| ItemError::parse(listing_url, err))?;
    let document = Html::parse_document(html);
    let mut out = BTreeSet::new();
    for href in document.select(links).filter_map(|n| n.value().attr("href")) {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let mut url = base
            .join(href)
            .map_err(|err| ItemError::parse(listing_url, format!("bad link {href:?}: {err}")))?;
        url.set_fragment(None);
        out.insert(url.to_string());
    }
    Ok(out)
}

/// Whitespace-normalized text of the first element matching `content`.
pub fn extract_document_text(document_url: &str, html: &str, content: &Selector) -> Result<String, ItemError> {
    let document = Html::parse_document(html);
    let node = document
        .select(content)
        .next()
        .ok_or_else(|| ItemError::parse(document_url, "content element not found"))?;
    let text = node
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        return Err(ItemError::parse(document_url, "document body is empty"));
    }
    Ok(text)
}

pub struct LegislationFetcher {
    meta: SourceMeta,
    listing_urls: Vec<String>,
    links: Selector,
    content: Selector,
}

impl LegislationFetcher {
    pub fn new(meta: SourceMeta, config: LegislationConfig) -> Result<Self, SourceConfigError> {
        if config.listing_urls.is_empty() {
            return Err(SourceConfigError::Empty {
                name: meta.name,
                what: "listing_urls",
            });
        }
        let links = parse_selector(&meta.name, &config.link_selector)?;
        let content = parse_selector(&meta.name, &config.content_selector)?;
        Ok(Self {
            meta,
            listing_urls: config.listing_urls,
            links,
            content,
        })
    }

    /// The full current active set. Any listing that fails or yields no links
    /// fails the run, since a partial set would tombstone documents that still exist.
    async fn current_active_set(&self, ctx: &ExecutionContext) -> Result<BTreeSet<String>, ItemError> {
        let mut current = BTreeSet::new();
        for listing in &self.listing_urls {
            let html = check_response(ctx.http().get(listing).await?)?.text().await?;
            let links = extract_document_links(listing, &html, &self.links)?;
            if links.is_empty() {
                return Err(ItemError::parse(listing.as_str(), "listing has no document links"));
            }
            current.extend(links);
        }
        Ok(current)
    }
}

#[async_trait]
impl ActiveSetSource for LegislationFetcher {
    async fn probe(
        &self,
        ctx: &ExecutionContext,
        document_id: &str,
        last_checked: Option<DateTime<Utc>>,
    ) -> Result<ProbeOutcome, ItemError> {
        let resp = ctx.http().head(document_id).await?;
        if resp.is_rate_limited() {
            return Err(ItemError::rate_limited(&resp));
        }
        if !resp.is_success() {
            // HEAD refused or unsupported; the full fetch decides.
            debug!(document_id, status = resp.status_code(), "probe inconclusive");
            resp.close();
            return Ok(ProbeOutcome::Inconclusive);
        }
        let last_modified = resp.last_modified();
        resp.close();
        Ok(match (last_modified, last_checked) {
            (Some(modified), Some(checked)) if modified <= checked => ProbeOutcome::Unchanged,
            (Some(_), Some(_)) => ProbeOutcome::Changed,
            _ => ProbeOutcome::Inconclusive,
        })
    }

    async fn fetch_document(
        &self,
        ctx: &ExecutionContext,
        document_id: &str,
    ) -> Result<FetchedDocument, ItemError> {
        let html = check_response(ctx.http().get(document_id).await?)?.text().await?;
        let text = extract_document_text(document_id, &html, &self.content)?;
        Ok(FetchedDocument::new(text, "txt"))
    }
}

#[async_trait]
impl RunBody for LegislationFetcher {
    async fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let current = self.current_active_set(ctx).await?;
        let report = reconcile(ctx, self, &current).await?;
        info!(
            new = report.new,
            updated = report.updated,
            unchanged = report.unchanged,
            removed = report.removed,
            deferred = report.deferred,
            "reconciled register"
        );
        Ok(())
    }
}

#[async_trait]
impl Fetcher for LegislationFetcher {
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
        for listing in &self.listing_urls {
            result.push(probe.check_url("listing reachable", listing).await);
        }
        for check in probe.standard_checks().await {
            result.push(check);
        }
        result
    }
}
