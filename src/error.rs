//! Error types for query building, batch setup and individual downloads.
//!
//! [`DownloadError`] never escapes a download task: the coordinator turns it
//! into a failed [`DownloadResult`](crate::models::DownloadResult). Only
//! [`SetupError`] is returned from a batch run.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single link's fetch or write.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connection, TLS, DNS or body-read failure.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timed out fetching {url}")]
    Timeout { url: String },

    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// The URL has no usable final path segment to name the file after.
    #[error("cannot derive a file name from {url}")]
    NoFileName { url: String },

    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The batch was cancelled before this link was admitted.
    #[error("cancelled before {url} was started")]
    Cancelled { url: String },
}

impl DownloadError {
    /// Classifies a reqwest error, splitting timeouts from other network faults.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Fatal conditions detected before any download task is launched.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid concurrency value {value}: must be at least 1")]
    InvalidConcurrency { value: usize },

    /// The progress tracker was sized for a different number of links.
    #[error("progress tracker expects {expected} downloads but {actual} links were supplied")]
    TrackerMismatch { expected: usize, actual: usize },

    #[error("cannot prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid radar/date input for the inventory page query.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("radar site must be a non-empty alphanumeric station id, got {0:?}")]
    Radar(String),

    #[error("year must be four digits, got {0:?}")]
    Year(String),

    #[error("month must be between 1 and 12, got {0:?}")]
    Month(String),

    #[error("day must be between 1 and 31, got {0:?}")]
    Day(String),
}
