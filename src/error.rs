//! Error taxonomy shared by capture, relay and aggregation
//!
//! Duplicates and late arrivals are deliberately absent: a duplicate is an
//! `Admission::Duplicate` outcome and a late arrival is an `ApplyOutcome::late`
//! entry, neither is surfaced as an error.

use crate::capture::error_handler::MaxRetriesExceeded;

#[derive(Debug)]
pub enum RelayError {
    /// Feed disconnect, storage timeout, anything worth retrying
    TransientIo(String),
    /// Notification could not be normalized into a `ChangeEvent`
    MalformedEvent(String),
    /// Stored head does not match the publisher's expected head
    OrderingViolation {
        partition: String,
        expected: u64,
        found: u64,
    },
    /// Partition refused writes after an ordering violation
    PartitionHalted(String),
    Database(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl RelayError {
    /// Whether the caller should back off and try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::TransientIo(_) | RelayError::Database(_) | RelayError::Io(_))
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err)
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err)
    }
}

impl From<MaxRetriesExceeded> for RelayError {
    fn from(err: MaxRetriesExceeded) -> Self {
        RelayError::TransientIo(err.to_string())
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::TransientIo(msg) => write!(f, "Transient I/O error: {}", msg),
            RelayError::MalformedEvent(msg) => write!(f, "Malformed event: {}", msg),
            RelayError::OrderingViolation {
                partition,
                expected,
                found,
            } => write!(
                f,
                "Ordering violation on partition {}: expected head {}, found {}",
                partition, expected, found
            ),
            RelayError::PartitionHalted(p) => write!(f, "Partition halted: {}", p),
            RelayError::Database(e) => write!(f, "Database error: {}", e),
            RelayError::Serialization(e) => write!(f, "Serialization error: {}", e),
            RelayError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

pub type RelayResult<T> = Result<T, RelayError>;
