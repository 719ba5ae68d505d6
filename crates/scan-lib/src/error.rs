//! Error taxonomy for the scan engine
//!
//! Cluster and item level errors end up as entries in the report; only
//! [`ScanError`] aborts a scan.

use crate::models::{ErrorKind, ItemError};
use std::time::Duration;

/// Failure listing workloads from a cluster API
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    #[error("cluster API unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response from cluster API: {0}")]
    MalformedResponse(String),

    #[error("no cluster API client configured for cluster {0}")]
    MissingClient(String),

    /// The filter named namespaces that contain no matching workloads
    #[error("namespace filter selected no workloads in {namespaces:?}")]
    EmptySelection { namespaces: Vec<String> },
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiscoveryError::EmptySelection { .. } => ErrorKind::EmptySelection,
            _ => ErrorKind::Discovery,
        }
    }
}

impl From<kube::Error> for DiscoveryError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::SerdeError(e) => DiscoveryError::MalformedResponse(e.to_string()),
            other => DiscoveryError::Unreachable(other.to_string()),
        }
    }
}

/// Failure asking the metrics backend for a history
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// Backend could not be reached at all
    #[error("metrics backend unreachable: {0}")]
    Connection(String),

    #[error("query timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("metrics backend rejected credentials: {0}")]
    Unauthorized(String),

    #[error("malformed query: {0}")]
    Malformed(String),

    /// Server-side failure (5xx, overload)
    #[error("metrics backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("invalid response from metrics backend: {0}")]
    InvalidResponse(String),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Connection(_) => ErrorKind::Connection,
            QueryError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Query,
        }
    }

    /// Network failures, timeouts and server-side errors may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueryError::Connection(_) | QueryError::Timeout(_) | QueryError::Backend { .. }
        )
    }
}

/// Per-item failure inside a strategy
#[derive(Debug, Clone, thiserror::Error)]
pub enum StrategyError {
    #[error("history contains invalid sample value {0}")]
    InvalidSample(f64),

    #[error("strategy {strategy} does not handle resource {resource}")]
    UnsupportedResource { strategy: String, resource: String },
}

/// Invalid or unknown strategy configuration, fatal at scan start
#[derive(Debug, Clone, thiserror::Error)]
pub enum StrategyConfigError {
    #[error("unknown strategy name: {name}. Available strategies: {}", available.join(", "))]
    Unknown {
        name: String,
        available: Vec<String>,
    },

    #[error("invalid settings for strategy {strategy}: {reason}")]
    Invalid { strategy: String, reason: String },
}

/// Fatal scan-level errors
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    StrategyConfig(#[from] StrategyConfigError),

    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("discovery failed for every cluster ({} errors)", .0.len())]
    AllClustersFailed(Vec<ItemError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(QueryError::Connection("refused".into()).is_transient());
        assert!(QueryError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(QueryError::Backend {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!QueryError::Unauthorized("401".into()).is_transient());
        assert!(!QueryError::Malformed("parse error".into()).is_transient());
        assert!(!QueryError::InvalidResponse("bad json".into()).is_transient());
    }

    #[test]
    fn test_unknown_strategy_lists_available() {
        let err = StrategyConfigError::Unknown {
            name: "magic".into(),
            available: vec!["percentile".into(), "simple".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown strategy name: magic. Available strategies: percentile, simple"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            DiscoveryError::EmptySelection {
                namespaces: vec!["ns".into()]
            }
            .kind(),
            ErrorKind::EmptySelection
        );
        assert_eq!(
            DiscoveryError::Unreachable("x".into()).kind(),
            ErrorKind::Discovery
        );
        assert_eq!(
            QueryError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
    }
}
