//! Error taxonomy for pipeline operations.
//!
//! Errors fall into the classes the executor dispatches on: configuration
//! errors are caught before any data is touched, transient I/O failures are
//! retried with exponential backoff, permanent failures abort the pipeline,
//! and row-scoped failures drop the offending row and continue.

use std::time::Duration;

/// Maximum number of retries for transient failures.
pub const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between retries.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Error types for CDP pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum CdpError {
    /// Static configuration error, caught before execution.
    #[error("invalid configuration at '{path}': {detail}")]
    Config { path: String, detail: String },

    /// A dotted field path was empty on a set operation.
    #[error("field path cannot be empty")]
    EmptyPath,

    /// An intermediate path segment exists but is not a nested record.
    #[error("cannot set field '{path}': intermediate key '{segment}' exists but is not an object")]
    PathType { path: String, segment: String },

    /// Retryable I/O failure (network hiccup, throttled object store, ...).
    #[error("transient i/o failure in {op}: {detail}")]
    Transient { op: String, detail: String },

    /// Terminal I/O failure; aborts the pipeline.
    #[error("permanent i/o failure in {op}: {detail}")]
    Permanent { op: String, detail: String },

    /// Row-scoped failure; the row is dropped and the pipeline continues.
    #[error("row '{id}' dropped: {detail}")]
    Row { id: String, detail: String },

    /// Dedup coordinator failure. Transient unless state corruption is
    /// indicated, then permanent.
    #[error("dedup coordinator: {detail}")]
    Coordinator { detail: String, corrupted: bool },

    /// Channel communication error
    ///
    /// A message channel between pipeline tasks closed unexpectedly,
    /// typically because a downstream task failed or was cancelled.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CdpError {
    /// Build a configuration error for a component or config path.
    pub fn config(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Config { path: path.into(), detail: detail.into() }
    }

    /// Build a transient I/O error for the named operation.
    pub fn transient(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Transient { op: op.into(), detail: detail.into() }
    }

    /// Build a permanent I/O error for the named operation.
    pub fn permanent(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Permanent { op: op.into(), detail: detail.into() }
    }

    /// Build a row-scoped error carrying the row id for the log line.
    pub fn row(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Row { id: id.into(), detail: detail.into() }
    }

    /// Whether the operation that produced this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Coordinator { corrupted: false, .. }
        )
    }

    /// Whether this error must abort the whole pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::Permanent { .. }
                | Self::Coordinator { corrupted: true, .. }
                | Self::ChannelClosed(_)
        )
    }
}

/// Backoff delay before the given retry attempt (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CdpError::transient("read", "timeout").is_transient());
        assert!(CdpError::Coordinator { detail: "rpc".into(), corrupted: false }.is_transient());
        assert!(!CdpError::Coordinator { detail: "bad checksum".into(), corrupted: true }.is_transient());
        assert!(!CdpError::permanent("write", "disk full").is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(CdpError::config("input.format", "unknown").is_fatal());
        assert!(CdpError::permanent("write", "flush failed").is_fatal());
        assert!(CdpError::Coordinator { detail: "bad checksum".into(), corrupted: true }.is_fatal());
        assert!(!CdpError::row("doc-1", "boom").is_fatal());
        assert!(!CdpError::transient("read", "timeout").is_fatal());
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert_eq!(backoff_delay(3), Duration::from_millis(400));
    }
}
