use std::path::PathBuf;

use thiserror::Error;

use crate::policy::WaitCondition;

/// Crate-wide error type for a crawl run.
#[derive(Error, Debug)]
pub enum CrawlError {
    /// Page failed to load or the driver session is unusable.
    #[error("Navigation error: {0}")]
    Navigation(String),

    /// An explicit wait expired before the element satisfied its condition.
    #[error("Timed out after {timeout_secs:.1}s waiting for '{selector}' to be {condition}")]
    WaitTimeout {
        selector: String,
        condition: WaitCondition,
        timeout_secs: f64,
    },

    /// Extraction failed (see [`ExtractionError`]).
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// HTTP request failed (non-success status, bad URL, unreadable body).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Policy failed validation.
    #[error("Policy error: {0}")]
    Policy(String),

    /// Session continuity file could not be read or written.
    #[error("Session error: {0}")]
    Session(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled (run timeout or caller token).
    #[error("Run cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl CrawlError {
    /// Returns true if the orchestrator should retry the current page.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Navigation(_)
            | CrawlError::WaitTimeout { .. }
            | CrawlError::Network(_)
            | CrawlError::Timeout(_) => true,
            CrawlError::Extraction(e) => e.is_recoverable(),
            CrawlError::Http(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}

/// Failure while turning page state into raw records.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    /// No configured selector matched anything on the page.
    #[error("Selector not found: {selector}")]
    SelectorNotFound { selector: String },

    /// The driver could not evaluate a DOM query.
    #[error("DOM query failed: {0}")]
    QueryFailed(String),

    /// The extraction script raised or the driver could not run it.
    #[error("Script execution failed: {0}")]
    ScriptFailed(String),

    /// The declared API endpoint could not be called or parsed.
    #[error("API extraction failed: {0}")]
    ApiFailed(String),

    /// The strategy produced a value that is not a record or list of records.
    #[error("Invalid extraction payload: {0}")]
    InvalidPayload(String),
}

impl ExtractionError {
    /// Only a missing selector is worth reloading the page for; everything
    /// else is fatal for the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExtractionError::SelectorNotFound { .. })
    }
}

/// Per-item persistence failure, recorded on the [`SavedArtifact`](crate::models::SavedArtifact).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// The storage policy has no target directory for this item kind.
    #[error("No storage target configured for kind '{0}'")]
    NoTarget(String),

    /// Target directory is missing and the existence policy forbids creating it.
    #[error("Target directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    /// Remote bytes could not be fetched.
    #[error("Fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Writing the file failed.
    #[error("Write failed for {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },

    /// The item's value is neither a fetchable URL nor decodable data.
    #[error("Cannot save '{value}': {reason}")]
    Unresolved { value: String, reason: String },

    /// The run was cancelled before this item finished.
    #[error("Cancelled before the item was saved")]
    Cancelled,
}
