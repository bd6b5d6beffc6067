use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of everything that can go wrong between composing a request
/// and receiving a result. `Cancelled` is a terminal state rather than a fault
/// but travels through the same field on outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Server,
    RateLimited,
    PolicyRejected,
    Rejected,
    MalformedReferenceSet,
    StateStoreCorrupt,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Server => "server",
            Self::RateLimited => "rate_limited",
            Self::PolicyRejected => "policy_rejected",
            Self::Rejected => "rejected",
            Self::MalformedReferenceSet => "malformed_reference_set",
            Self::StateStoreCorrupt => "state_store_corrupt",
            Self::Cancelled => "cancelled",
        }
    }

    /// Kinds the generation client retries after a backoff wait.
    pub fn uses_backoff(self) -> bool {
        matches!(self, Self::Transport | Self::Server | Self::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out after {waited:?} waiting for rotation lock on persona '{persona_id}'")]
    LockTimeout { persona_id: String, waited: Duration },
    #[error("rotation state io failed ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("rotation state encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Lock contention clears on its own; disk faults usually do not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceSetError {
    #[error("reference set has no face anchors")]
    MissingFaceAnchor,
    #[error("reference set has no body anchors")]
    MissingBodyAnchor,
    #[error("reference set pose source '{0}' is empty")]
    EmptyPoseSource(String),
    #[error("reference set marks more than one {0} body anchor as primary")]
    DuplicatePrimary(&'static str),
}

impl ReferenceSetError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedReferenceSet
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
