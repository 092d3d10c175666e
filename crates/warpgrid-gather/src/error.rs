//! Gatherer error types.

use thiserror::Error;

use crate::query::QueryError;

/// Result type alias for gatherer operations.
pub type GatherResult<T> = Result<T, GatherError>;

/// Errors that can occur while building or running a gatherer.
#[derive(Debug, Error)]
pub enum GatherError {
    /// A construction option is missing or has the wrong shape.
    #[error("invalid `{option}` option: {reason}")]
    Config { option: String, reason: String },

    #[error("gatherer already registered: {0}")]
    DuplicateName(String),

    #[error("unknown gatherer: {0}")]
    UnknownGatherer(String),

    /// Every configured endpoint failed; errors are kept in endpoint order.
    #[error("all {} endpoints failed: {}", .0.len(), join_errors(.0))]
    AllEndpointsFailed(Vec<EndpointQueryError>),

    #[error("unexpected query result: {0}")]
    Shape(#[from] ShapeError),

    /// The backend answered with NaN, its marker for "no data".
    #[error("query returned NaN, no data available")]
    NoData,

    #[error("value {0} cannot be represented as a quantity")]
    OutOfRange(f64),

    #[error("gather cancelled")]
    Cancelled,

    #[error("gather deadline exceeded")]
    DeadlineExceeded,

    /// Failure inside a gatherer that is not covered above (e.g. a plugin trap).
    #[error("gatherer failed: {0}")]
    Source(String),
}

impl GatherError {
    /// Shorthand for a [`GatherError::Config`] error.
    pub fn config(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from caller cancellation or deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// A query result that does not have the single-sample vector shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("result needs to be a vector, received: {0}")]
    NotVector(String),

    #[error("wrong samples length, should be one, current is: {0}")]
    SampleCount(usize),
}

/// A single endpoint's failure, tagged with its position in the failover order.
#[derive(Debug, Error)]
#[error("endpoint {index} ({address}): {source}")]
pub struct EndpointQueryError {
    pub index: usize,
    pub address: String,
    #[source]
    pub source: QueryError,
}

fn join_errors(errors: &[EndpointQueryError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_option() {
        let err = GatherError::config("query", "option is required");
        assert_eq!(err.to_string(), "invalid `query` option: option is required");
    }

    #[test]
    fn aggregated_error_keeps_endpoint_order() {
        let err = GatherError::AllEndpointsFailed(vec![
            EndpointQueryError {
                index: 0,
                address: "http://a".to_string(),
                source: QueryError::Transport("connection refused".to_string()),
            },
            EndpointQueryError {
                index: 1,
                address: "http://b".to_string(),
                source: QueryError::Timeout,
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("all 2 endpoints failed"));
        let a = msg.find("connection refused").unwrap();
        let b = msg.find("timed out").unwrap();
        assert!(a < b, "errors out of order: {msg}");
    }

    #[test]
    fn cancellation_kinds() {
        assert!(GatherError::Cancelled.is_cancellation());
        assert!(GatherError::DeadlineExceeded.is_cancellation());
        assert!(!GatherError::NoData.is_cancellation());
    }
}
