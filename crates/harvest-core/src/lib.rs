//! Core run, metrics and provenance types shared by every Harvest crate.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Namespace for name-based item ids. Changing it re-keys every stored fingerprint.
const ITEM_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5c1d_8e0a_3f27_4b6e_9a41_d2c7_0b9e_6f13);

/// Stable item id derived from a natural key (URL, GUID, `series|date`, ...).
pub fn item_id(natural_key: &str) -> String {
    Uuid::new_v5(&ITEM_ID_NAMESPACE, natural_key.trim().as_bytes()).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Success,
    Error,
}

/// A run that has started but not yet been finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRun {
    pub run_id: Uuid,
    pub source: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl OpenRun {
    pub fn start(source: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.into(),
            version: version.into(),
            started_at: Utc::now(),
        }
    }

    /// Consumes the open run; the returned record is immutable from here on.
    pub fn finish(self, outcome: RunOutcome, summary: impl Into<String>) -> FetchRun {
        FetchRun {
            run_id: self.run_id,
            source: self.source,
            version: self.version,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            summary: summary.into(),
        }
    }
}

/// Finalized record of one source run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRun {
    pub run_id: Uuid,
    pub source: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub attempted: u64,
    pub fetched: u64,
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl MetricsSnapshot {
    pub fn summary_line(&self) -> String {
        format!(
            "Processed {}: {} new, {} updated, {} skipped, {} failed",
            self.attempted, self.new, self.updated, self.skipped, self.failed
        )
    }

    /// Items that were written downstream during the run.
    pub fn changed(&self) -> u64 {
        self.new + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub source: String,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFingerprint {
    pub item_id: String,
    pub content_hash: String,
    pub last_seen_run: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpsertDecision {
    New,
    Updated,
    Unchanged,
}

impl UpsertDecision {
    pub fn needs_write(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    ParseError,
    StorageError,
    FatalConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TransientNetwork => "TRANSIENT_NETWORK",
            Self::RateLimited => "RATE_LIMITED",
            Self::ParseError => "PARSE_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::FatalConfig => "FATAL_CONFIG",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub subject: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Terminal result of a fetch; the orchestrator never returns anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchResult {
    Success { message: String, count: u64 },
    Error { message: String },
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message, .. } | Self::Error { message } => message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl DryRunCheck {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunResult {
    pub source: String,
    pub checks: Vec<DryRunCheck>,
}

impl DryRunResult {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            checks: Vec::new(),
        }
    }

    pub fn push(&mut self, check: DryRunCheck) {
        self.checks.push(check);
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Checklist report, one line per check.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("dry run: {}", self.source)];
        for check in &self.checks {
            let mark = if check.passed { "x" } else { " " };
            lines.push(format!("  [{mark}] {}: {}", check.name, check.detail));
        }
        lines.join("\n")
    }
}

const SET_DELIMITER: &str = "\n";

/// Serializes a set of members (URLs, ids) into one checkpoint value.
pub fn encode_set<'a>(members: impl IntoIterator<Item = &'a String>) -> String {
    members
        .into_iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(SET_DELIMITER)
}

pub fn decode_set(value: &str) -> BTreeSet<String> {
    value
        .split(SET_DELIMITER)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CachedValueError {
    #[error("cached value has no expiry prefix")]
    MissingExpiry,
    #[error("cached value expiry `{0}` is not a unix timestamp")]
    InvalidExpiry(String),
}

/// Checkpoint payload with an embedded expiry, e.g. a geocoding lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub expires_at: DateTime<Utc>,
    pub payload: String,
}

impl CachedValue {
    pub fn new(payload: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            expires_at: now + ttl,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}", self.expires_at.timestamp(), self.payload)
    }

    pub fn decode(raw: &str) -> Result<Self, CachedValueError> {
        let (stamp, payload) = raw.split_once('|').ok_or(CachedValueError::MissingExpiry)?;
        let secs: i64 = stamp
            .parse()
            .map_err(|_| CachedValueError::InvalidExpiry(stamp.to_string()))?;
        let expires_at = DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| CachedValueError::InvalidExpiry(stamp.to_string()))?;
        Ok(Self {
            expires_at,
            payload: payload.to_string(),
        })
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
