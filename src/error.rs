use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, LookThroughError>;

#[derive(Error, Debug)]
pub enum LookThroughError {
    /// A record (or a whole file, when a required column is missing) could not be read.
    #[error("Malformed input in {source_name} (record {record}): {reason}")]
    MalformedInput {
        source_name: String,
        record: usize,
        reason: String,
    },

    #[error("Source unavailable: {source_name}: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("Unresolved identifier: {security_id}")]
    UnresolvedIdentifier { security_id: String },

    #[error("Collaborator timed out for {ticker} after {elapsed:?}")]
    CollaboratorTimeout { ticker: String, elapsed: Duration },

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),
}

impl LookThroughError {
    pub fn malformed(source_name: &str, record: usize, reason: impl Into<String>) -> Self {
        LookThroughError::MalformedInput {
            source_name: source_name.to_string(),
            record,
            reason: reason.into(),
        }
    }

    pub fn unavailable(source_name: &str, reason: impl ToString) -> Self {
        LookThroughError::SourceUnavailable {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the run can carry on past this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            LookThroughError::SourceUnavailable { .. } | LookThroughError::Config(_)
        )
    }
}

impl From<reqwest::Error> for LookThroughError {
    fn from(error: reqwest::Error) -> Self {
        LookThroughError::Collaborator(error.to_string())
    }
}

/// Record-level failures contained at a component boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub malformed: usize,
    pub unresolved: usize,
    pub timeouts: usize,
    pub collaborator_failures: usize,
    pub messages: Vec<String>,
}

impl Diagnostics {
    pub fn record(&mut self, error: &LookThroughError) {
        match error {
            LookThroughError::MalformedInput { .. } => self.malformed += 1,
            LookThroughError::UnresolvedIdentifier { .. } => self.unresolved += 1,
            LookThroughError::CollaboratorTimeout { .. } => self.timeouts += 1,
            _ => self.collaborator_failures += 1,
        }
        warn!(error = %error, "record skipped or degraded");
        self.messages.push(error.to_string());
    }

    pub fn merge(&mut self, other: Diagnostics) {
        self.malformed += other.malformed;
        self.unresolved += other.unresolved;
        self.timeouts += other.timeouts;
        self.collaborator_failures += other.collaborator_failures;
        self.messages.extend(other.messages);
    }

    pub fn total(&self) -> usize {
        self.malformed + self.unresolved + self.timeouts + self.collaborator_failures
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }
}
