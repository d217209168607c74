//! Error taxonomy for the pipeline.
//!
//! Per-source and per-item errors are recovered where they happen and end up
//! in the report. Only [`RunError`] aborts a run.

use crate::models::Channel;
use thiserror::Error;

/// State store failure. Always fatal for the current run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid timestamp stored under meta key '{key}': {value}")]
    InvalidTimestamp { key: String, value: String },
}

/// A source could not be fetched. Isolated to that source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("authentication rejected by {url}")]
    Unauthorized { url: String },

    #[error("unexpected response {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("fetch abandoned after {0}s")]
    Timeout(u64),
}

/// A text-generation call failed.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("rate limited by backend")]
    RateLimited,

    #[error("backend error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to reach backend: {0}")]
    Transport(String),

    #[error("malformed backend response: {0}")]
    Malformed(String),

    #[error("backend returned an empty completion")]
    Empty,
}

impl GenerationError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Timeout(_)
            | GenerationError::RateLimited
            | GenerationError::Transport(_) => true,
            GenerationError::Http { status, .. } => *status >= 500,
            GenerationError::Malformed(_) | GenerationError::Empty => false,
        }
    }
}

/// A transport failed to deliver the report.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{channel} transport returned {status}: {body}")]
    Http {
        channel: Channel,
        status: u16,
        body: String,
    },

    #[error("{channel} transport unreachable: {message}")]
    Transport { channel: Channel, message: String },
}

/// Errors that abort a run. Nothing is committed when one of these occurs.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("state store failure: {0}")]
    Store(#[from] StoreError),

    #[error("delivery failed on every configured channel: {}", .attempts.join("; "))]
    DeliveryFailed { attempts: Vec<String> },
}
