//! Three-way reconciliation for sources that publish an "active set" of documents.
//!
//! Given the previously known active identifiers `A` (checkpoint key
//! [`ACTIVE_SET_KEY`]) and the currently observed identifiers `B`:
//!
//! - `B \ A` is fetched, stored and marked NEW;
//! - `A \ B` is tombstoned (`status:<id>` becomes `repealed@<time>`), never deleted or refetched;
//! - `A ∩ B` is probed first and only fetched when the probe reports a change or
//!   cannot tell, then classified UPDATED or UNCHANGED by content hash.
//!
//! The active set and per-document checkpoints are flushed after every resolved
//! item, so an interrupted pass only repeats the items it had not finished.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{item_id, UpsertDecision};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::{Checkpoints, ExecutionContext};
use crate::error::ItemError;

pub const ACTIVE_SET_KEY: &str = "active_set";

const STATUS_ACTIVE: &str = "active";
const STATUS_REPEALED_PREFIX: &str = "repealed@";

pub fn status_key(document_id: &str) -> String {
    format!("status:{document_id}")
}

pub fn last_checked_key(document_id: &str) -> String {
    format!("last_checked:{document_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Unchanged,
    Changed,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub content: String,
    pub extension: String,
}

impl FetchedDocument {
    pub fn new(content: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            extension: extension.into(),
        }
    }
}

/// Source-specific half of reconciliation.
#[async_trait]
pub trait ActiveSetSource: Send + Sync {
    /// Cheap change check for a retained document.
    async fn probe(
        &self,
        ctx: &ExecutionContext,
        document_id: &str,
        last_checked: Option<DateTime<Utc>>,
    ) -> Result<ProbeOutcome, ItemError>;

    async fn fetch_document(
        &self,
        ctx: &ExecutionContext,
        document_id: &str,
    ) -> Result<FetchedDocument, ItemError>;

    /// Downstream write for a NEW or UPDATED document, run before the fingerprint commit.
    async fn persist(
        &self,
        _ctx: &ExecutionContext,
        _document_id: &str,
        _document: &FetchedDocument,
        _decision: UpsertDecision,
    ) -> Result<(), ItemError> {
        Ok(())
    }

    async fn tombstone(
        &self,
        _ctx: &ExecutionContext,
        _document_id: &str,
        _removed_at: DateTime<Utc>,
    ) -> Result<(), ItemError> {
        Ok(())
    }

    /// Whether an empty observation may tombstone a non-empty active set.
    fn allow_empty_active_set(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSetDiff {
    pub new: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub retained: BTreeSet<String>,
}

pub fn diff_active_sets(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> ActiveSetDiff {
    ActiveSetDiff {
        new: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
        retained: previous.intersection(current).cloned().collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentStatus {
    Active,
    Repealed { at: DateTime<Utc> },
}

impl DocumentStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    fn encode(&self) -> String {
        match self {
            Self::Active => STATUS_ACTIVE.to_string(),
            Self::Repealed { at } => format!("{STATUS_REPEALED_PREFIX}{}", at.to_rfc3339()),
        }
    }

    fn decode(raw: &str) -> Option<Self> {
        if raw == STATUS_ACTIVE {
            return Some(Self::Active);
        }
        let at = raw.strip_prefix(STATUS_REPEALED_PREFIX)?;
        DateTime::parse_from_rfc3339(at)
            .ok()
            .map(|at| Self::Repealed {
                at: at.with_timezone(&Utc),
            })
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Status of a document ever seen by reconciliation; `None` if never seen.
pub async fn document_status(
    checkpoints: &Checkpoints,
    document_id: &str,
) -> Result<Option<DocumentStatus>, ItemError> {
    Ok(checkpoints
        .get(&status_key(document_id))
        .await?
        .and_then(|raw| DocumentStatus::decode(&raw)))
}

enum Work<'a> {
    New(&'a str),
    Retained(&'a str),
}

impl Work<'_> {
    fn id(&self) -> &str {
        match self {
            Work::New(id) | Work::Retained(id) => id,
        }
    }
}

pub async fn reconcile(
    ctx: &ExecutionContext,
    source: &dyn ActiveSetSource,
    current: &BTreeSet<String>,
) -> Result<ReconcileReport, ItemError> {
    let checkpoints = ctx.checkpoint();
    let previous = checkpoints.get_set(ACTIVE_SET_KEY).await?;
    if current.is_empty() && !previous.is_empty() && !source.allow_empty_active_set() {
        return Err(ItemError::parse(
            ctx.source(),
            format!(
                "observed an empty active set; refusing to tombstone {} known document(s)",
                previous.len()
            ),
        ));
    }
    let diff = diff_active_sets(&previous, current);
    info!(
        new = diff.new.len(),
        removed = diff.removed.len(),
        retained = diff.retained.len(),
        "reconciling active set"
    );

    let mut active = previous;
    let mut report = ReconcileReport::default();

    for document_id in &diff.removed {
        let removed_at = Utc::now();
        let outcome = async {
            source.tombstone(ctx, document_id, removed_at).await?;
            checkpoints
                .set(
                    &status_key(document_id),
                    &DocumentStatus::Repealed { at: removed_at }.encode(),
                )
                .await?;
            active.remove(document_id);
            checkpoints.set_set(ACTIVE_SET_KEY, &active).await
        }
        .await;
        match outcome {
            Ok(()) => {
                debug!(document_id, "tombstoned");
                report.removed += 1;
            }
            Err(err) => {
                ctx.fail_item(&err, document_id);
                report.failed += 1;
            }
        }
    }

    let queue: Vec<Work<'_>> = diff
        .new
        .iter()
        .map(|id| Work::New(id))
        .chain(diff.retained.iter().map(|id| Work::Retained(id)))
        .collect();

    for (position, work) in queue.iter().enumerate() {
        let document_id = work.id();
        ctx.mark_attempted();
        let result = match work {
            Work::New(id) => sync_new(ctx, source, id, &mut active).await,
            Work::Retained(id) => sync_retained(ctx, source, id).await,
        };
        match result {
            Ok(Some(UpsertDecision::New)) => {
                ctx.mark_new(1);
                report.new += 1;
            }
            Ok(Some(UpsertDecision::Updated)) => {
                ctx.mark_updated(1);
                report.updated += 1;
            }
            Ok(Some(UpsertDecision::Unchanged)) | Ok(None) => {
                ctx.mark_skipped();
                report.unchanged += 1;
            }
            Err(err) if err.is_rate_limited() => {
                // This item is already attempted; the rest of the queue is not.
                ctx.mark_skipped();
                let rest = queue.len() - position - 1;
                ctx.defer_remaining(rest as u64, document_id);
                report.deferred = rest + 1;
                break;
            }
            Err(err) => {
                ctx.fail_item(&err, document_id);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn sync_new(
    ctx: &ExecutionContext,
    source: &dyn ActiveSetSource,
    document_id: &str,
    active: &mut BTreeSet<String>,
) -> Result<Option<UpsertDecision>, ItemError> {
    let checked_at = Utc::now();
    let document = source.fetch_document(ctx, document_id).await?;
    ctx.mark_fetched();
    store(ctx, source, document_id, &document).await?;

    let checkpoints = ctx.checkpoint();
    checkpoints
        .set(&status_key(document_id), &DocumentStatus::Active.encode())
        .await?;
    checkpoints
        .set_datetime(&last_checked_key(document_id), checked_at)
        .await?;
    active.insert(document_id.to_string());
    checkpoints.set_set(ACTIVE_SET_KEY, active).await?;

    // Membership decides: a reappearing document is new even if its content is known.
    Ok(Some(UpsertDecision::New))
}

async fn sync_retained(
    ctx: &ExecutionContext,
    source: &dyn ActiveSetSource,
    document_id: &str,
) -> Result<Option<UpsertDecision>, ItemError> {
    let checkpoints = ctx.checkpoint();
    let last_checked_key = last_checked_key(document_id);
    let last_checked = checkpoints.get_datetime(&last_checked_key).await?;
    let checked_at = Utc::now();

    let decision = match source.probe(ctx, document_id, last_checked).await? {
        ProbeOutcome::Unchanged => None,
        ProbeOutcome::Changed | ProbeOutcome::Inconclusive => {
            let document = source.fetch_document(ctx, document_id).await?;
            ctx.mark_fetched();
            match store(ctx, source, document_id, &document).await? {
                // Retained documents are never new; a missing fingerprint means it was lost.
                UpsertDecision::New => Some(UpsertDecision::Updated),
                decision => Some(decision),
            }
        }
    };

    checkpoints.set_datetime(&last_checked_key, checked_at).await?;
    Ok(decision)
}

async fn store(
    ctx: &ExecutionContext,
    source: &dyn ActiveSetSource,
    document_id: &str,
    document: &FetchedDocument,
) -> Result<UpsertDecision, ItemError> {
    let staged = ctx
        .stage_raw(&item_id(document_id), &document.content, &document.extension)
        .await?;
    if staged.decision.needs_write() {
        source
            .persist(ctx, document_id, document, staged.decision)
            .await?;
    }
    ctx.commit(staged).await
}
