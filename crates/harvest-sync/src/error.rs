//! Item- and run-level error types mapped onto [`ErrorKind`].

use std::fmt::Display;
use std::time::Duration;

use harvest_core::ErrorKind;
use harvest_storage::{FetchError, HttpResponse};
use thiserror::Error;

/// Failure of a single item; never aborts sibling items on its own.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("could not parse {subject}: {message}")]
    Parse { subject: String, message: String },
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl ItemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Http(err) => err.kind(),
            Self::Status { status, .. } => status_kind(*status),
            Self::Parse { .. } => ErrorKind::ParseError,
            Self::Storage(_) => ErrorKind::StorageError,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// The error for a 429 response.
    pub fn rate_limited(resp: &HttpResponse) -> Self {
        Self::RateLimited {
            url: resp.final_url().to_string(),
            retry_after: resp.retry_after(),
        }
    }

    pub fn parse(subject: impl Into<String>, err: impl Display) -> Self {
        Self::Parse {
            subject: subject.into(),
            message: err.to_string(),
        }
    }

    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }
}

/// Rejected credentials are fatal; server faults are transient.
fn status_kind(status: u16) -> ErrorKind {
    match status {
        401 | 403 | 407 => ErrorKind::FatalConfig,
        500..=599 => ErrorKind::TransientNetwork,
        _ => ErrorKind::ParseError,
    }
}

/// Aborts the run of one source before any item is processed.
#[derive(Debug, Error)]
#[error("fatal configuration error: {0}")]
pub struct FatalConfig(pub String);

/// Turns 429 and other non-success statuses into item errors.
pub fn check_response(resp: HttpResponse) -> Result<HttpResponse, ItemError> {
    if resp.is_rate_limited() {
        return Err(ItemError::rate_limited(&resp));
    }
    if !resp.is_success() {
        return Err(ItemError::Status {
            status: resp.status_code(),
            url: resp.final_url().to_string(),
        });
    }
    Ok(resp)
}

/// Error kind recorded when a whole run body fails.
pub fn run_error_kind(err: &anyhow::Error) -> ErrorKind {
    if err.downcast_ref::<FatalConfig>().is_some() {
        return ErrorKind::FatalConfig;
    }
    if let Some(item) = err.downcast_ref::<ItemError>() {
        return item.kind();
    }
    if let Some(fetch) = err.downcast_ref::<FetchError>() {
        return fetch.kind();
    }
    ErrorKind::TransientNetwork
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_errors_map_to_the_error_taxonomy() {
        let limited = ItemError::RateLimited {
            url: "https://example.org".into(),
            retry_after: None,
        };
        assert_eq!(limited.kind(), ErrorKind::RateLimited);
        assert!(limited.is_rate_limited());
        assert_eq!(ItemError::parse("feed", "eof").kind(), ErrorKind::ParseError);
        assert_eq!(
            ItemError::storage(anyhow::anyhow!("disk full")).kind(),
            ErrorKind::StorageError
        );
        assert_eq!(
            ItemError::Http(FetchError::Shutdown).kind(),
            ErrorKind::TransientNetwork
        );
    }

    #[test]
    fn unexpected_statuses_are_classified_by_class() {
        let status = |status| ItemError::Status {
            status,
            url: "https://api.example/series".into(),
        };
        assert_eq!(status(401).kind(), ErrorKind::FatalConfig);
        assert_eq!(status(403).kind(), ErrorKind::FatalConfig);
        assert_eq!(status(503).kind(), ErrorKind::TransientNetwork);
        assert_eq!(status(404).kind(), ErrorKind::ParseError);
        assert_eq!(status(410).kind(), ErrorKind::ParseError);

        let rejected = anyhow::Error::new(status(401)).context("fetching UNRATE");
        assert_eq!(run_error_kind(&rejected), ErrorKind::FatalConfig);
    }

    #[test]
    fn run_errors_are_classified_through_anyhow() {
        let fatal = anyhow::Error::new(FatalConfig("API key missing".into()));
        assert_eq!(run_error_kind(&fatal), ErrorKind::FatalConfig);

        let parse = anyhow::Error::new(ItemError::parse("listing", "no table"));
        assert_eq!(run_error_kind(&parse), ErrorKind::ParseError);

        let wrapped = anyhow::Error::new(FatalConfig("x".into())).context("starting economic run");
        assert_eq!(run_error_kind(&wrapped), ErrorKind::FatalConfig);
    }
}
