//! Error vocabulary shared by the storage client and the recovery run.
//!
//! The client never decides whether a failure is fatal. It reports the
//! operation, the HTTP status (if a response arrived at all) and the start of
//! the response body; the orchestrator classifies.

use crate::models::report::Phase;
use serde::Serialize;
use std::{fmt, io};
use thiserror::Error;

/// Longest response-body excerpt kept on an [`ApiError`].
pub const BODY_EXCERPT_LIMIT: usize = 512;

/// Storage operation that produced an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    BucketMetadata,
    ListObjects,
    CreateBucket,
    CopyObject,
    DeleteObject,
    DeleteBucket,
    RestoreBucket,
    DownloadObject,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::BucketMetadata => "bucket metadata",
            Operation::ListObjects => "list objects",
            Operation::CreateBucket => "create bucket",
            Operation::CopyObject => "copy object",
            Operation::DeleteObject => "delete object",
            Operation::DeleteBucket => "delete bucket",
            Operation::RestoreBucket => "restore bucket",
            Operation::DownloadObject => "download object",
        };
        f.write_str(name)
    }
}

/// A failed storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub operation: Operation,
    /// `None` when no HTTP response was received (connect error, timeout,
    /// local I/O while streaming).
    pub status: Option<u16>,
    pub body_excerpt: String,
}

impl ApiError {
    /// Error built from a non-success HTTP response.
    pub fn http(operation: Operation, status: u16, body: &str) -> Self {
        Self {
            operation,
            status: Some(status),
            body_excerpt: excerpt(body),
        }
    }

    /// Error raised before or while talking to the service, without a status.
    pub fn transport(operation: Operation, msg: impl fmt::Display) -> Self {
        Self {
            operation,
            status: None,
            body_excerpt: excerpt(&msg.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} failed (HTTP {}): {}",
                self.operation, status, self.body_excerpt
            ),
            None => write!(f, "{} failed: {}", self.operation, self.body_excerpt),
        }
    }
}

impl std::error::Error for ApiError {}

/// The storage client could not be constructed.
#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid storage endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// No bearer token could be resolved.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no access token: set `{env_var}` or write a token to `{cache_path}`")]
    Missing { env_var: String, cache_path: String },
    #[error("token cache `{path}` is unreadable: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Fatal failures that abort a recovery run.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("{phase}: {source}")]
    Structural {
        phase: Phase,
        #[source]
        source: ApiError,
    },
    #[error("{phase}: listing is incomplete, refusing to act on it: {source}")]
    Listing {
        phase: Phase,
        #[source]
        source: ApiError,
    },
    #[error(
        "{phase}: bucket `{bucket}` is not visible yet after restore; re-run later once it has propagated"
    )]
    Availability { phase: Phase, bucket: String },
    #[error("{phase}: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: io::Error,
    },
}

impl RecoveryError {
    /// Phase in which the run stopped.
    pub fn phase(&self) -> Phase {
        match self {
            RecoveryError::Credential(_) => Phase::Preflight,
            RecoveryError::Structural { phase, .. }
            | RecoveryError::Listing { phase, .. }
            | RecoveryError::Availability { phase, .. }
            | RecoveryError::Io { phase, .. } => *phase,
        }
    }

    /// HTTP status behind the failure, if one was returned.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            RecoveryError::Structural { source, .. } | RecoveryError::Listing { source, .. } => {
                source.status
            }
            _ => None,
        }
    }
}

/// Cut `body` to at most [`BODY_EXCERPT_LIMIT`] bytes on a char boundary.
fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    let mut end = BODY_EXCERPT_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
