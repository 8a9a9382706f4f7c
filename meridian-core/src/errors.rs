//! Error taxonomy for the metadata service.
//!
//! `Rejection` is the expected, non-fatal outcome of a proposal that failed
//! validation: stable code, stable operator-facing text, no log side effect.
//! `MetadataError` covers everything else — transport trouble (recovered by
//! the pull path), and the fatal local conditions under which a node must
//! stop serving until resynchronized.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Stable machine-readable class of a proposal rejection.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RejectionCode {
    /// Validation failed; the proposal had no effect.
    Invalid,
    /// The caller's deadline expired before the outcome was known. The
    /// proposal may or may not have committed — re-read the current metadata.
    Timeout,
}

/// Synchronous answer to a proposal that did not commit.
///
/// The message text is part of the operator contract: tooling scripts assert
/// on it verbatim, so it must stay stable.
#[derive(Clone, PartialEq, Eq, Debug, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
}

impl Rejection {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: RejectionCode::Invalid,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            code: RejectionCode::Timeout,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("fetch did not complete within {0:?}")]
    FetchTimeout(Duration),

    #[error("unsupported metadata wire version: {0}")]
    IncompatibleVersion(u32),

    /// Replay of a committed entry failed locally. Not recoverable by
    /// incremental fetch — the node must resynchronize from a known-good
    /// peer via full state transfer.
    #[error("metadata log divergence: {0}")]
    CorruptLog(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
