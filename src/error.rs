//! Error types for the groupkeeper operator core.
//!
//! Every fallible operation returns [`OperatorError`]. Errors fall into three
//! tiers, exposed through [`OperatorError::kind`]:
//!
//! - **Fatal**: never retried. Authentication and schema-integrity failures on
//!   connections the operator provisioned itself, and broken invariants.
//! - **Temporary**: retried by the caller, optionally after a suggested delay.
//!   Transport failures, unsettled group state, a busy cluster lock.
//! - **Permanent**: the cluster needs an operator. Split-brain, invalid state.
//!
//! # Example
//!
//! ```rust
//! use groupkeeper::error::{ErrorKind, OperatorError};
//! use std::time::Duration;
//!
//! let err = OperatorError::temporary_after("primary election in progress", Duration::from_secs(2));
//! assert_eq!(err.kind(), ErrorKind::Temporary);
//! assert_eq!(err.retry_delay(), Some(Duration::from_secs(2)));
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Numeric error codes reported by the database admin client.
pub mod codes {
    /// Lowest client-side (transport) error code.
    pub const CLIENT_ERROR_MIN: u32 = 2000;
    /// Highest client-side (transport) error code.
    pub const CLIENT_ERROR_MAX: u32 = 2999;
    /// Could not connect through the local socket.
    pub const CONNECTION_ERROR: u32 = 2002;
    /// Could not connect to the remote host.
    pub const CONN_HOST_ERROR: u32 = 2003;
    /// The server went away mid-session.
    pub const SERVER_GONE: u32 = 2006;
    /// Connection lost during a query.
    pub const SERVER_LOST: u32 = 2013;

    pub const DB_ACCESS_DENIED: u32 = 1044;
    pub const ACCESS_DENIED: u32 = 1045;
    pub const BAD_DB: u32 = 1049;
    pub const TABLE_ACCESS_DENIED: u32 = 1142;
    pub const NO_SUCH_TABLE: u32 = 1146;
    pub const SPECIFIC_ACCESS_DENIED: u32 = 1227;

    /// Group replication is already running on the instance.
    pub const GROUP_REPLICATION_RUNNING: u32 = 3093;

    /// The cluster metadata has no record of the member.
    pub const MEMBER_METADATA_MISSING: u32 = 51104;
    /// The instance is not managed by any cluster.
    pub const INSTANCE_NOT_MANAGED: u32 = 51300;
    /// The instance belongs to a replication group the metadata does not know.
    pub const UNMANAGED_GROUP: u32 = 51305;
    /// The instance is not ONLINE in its group.
    pub const INSTANCE_NOT_ONLINE: u32 = 51314;
}

/// An error reported by the database admin client, identified by a stable code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("database error {code}: {message}")]
pub struct DbError {
    /// Stable numeric error code.
    pub code: u32,
    /// Human readable message from the server or client library.
    pub message: String,
}

impl DbError {
    /// Create a new database error.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error was raised client-side: the server could not be reached.
    pub fn is_client_error(&self) -> bool {
        (codes::CLIENT_ERROR_MIN..=codes::CLIENT_ERROR_MAX).contains(&self.code)
    }

    /// Authentication or schema-integrity failure. Never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code,
            codes::DB_ACCESS_DENIED
                | codes::ACCESS_DENIED
                | codes::BAD_DB
                | codes::TABLE_ACCESS_DENIED
                | codes::NO_SUCH_TABLE
                | codes::SPECIFIC_ACCESS_DENIED
        )
    }

    /// The member is already gone from the cluster metadata.
    pub fn is_already_removed(&self) -> bool {
        matches!(
            self.code,
            codes::MEMBER_METADATA_MISSING | codes::INSTANCE_NOT_MANAGED
        )
    }
}

/// Error classification used by retry loops and the event dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Propagate immediately, never retry.
    Fatal,
    /// Retry, possibly after a delay.
    Temporary,
    /// Stop retrying and surface to the user.
    Permanent,
}

/// Main error type for operator operations.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("{message}")]
    Temporary {
        message: String,
        delay: Option<Duration>,
    },

    #[error("{reason}: {message}")]
    Permanent { reason: String, message: String },

    #[error("cluster {key} is busy: held by {holder} since {since}")]
    Busy {
        key: String,
        holder: String,
        since: DateTime<Utc>,
    },

    #[error("{0}")]
    Db(#[from] DbError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Gtid(#[from] crate::gtid::GtidParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    /// A retriable condition with no suggested delay.
    pub fn temporary(message: impl Into<String>) -> Self {
        OperatorError::Temporary {
            message: message.into(),
            delay: None,
        }
    }

    /// A retriable condition that should be retried after `delay`.
    pub fn temporary_after(message: impl Into<String>, delay: Duration) -> Self {
        OperatorError::Temporary {
            message: message.into(),
            delay: Some(delay),
        }
    }

    /// A condition that needs operator intervention.
    pub fn permanent(reason: impl Into<String>, message: impl Into<String>) -> Self {
        OperatorError::Permanent {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::Temporary { .. } | OperatorError::Busy { .. } => ErrorKind::Temporary,
            OperatorError::Permanent { .. } => ErrorKind::Permanent,
            OperatorError::Db(e) => {
                if e.is_fatal() {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::Temporary
                }
            }
            OperatorError::Kube(kube::Error::Api(resp)) if resp.code == 401 || resp.code == 403 => {
                ErrorKind::Fatal
            }
            OperatorError::Kube(_) => ErrorKind::Temporary,
            OperatorError::Serialization(_)
            | OperatorError::Gtid(_)
            | OperatorError::Config(_)
            | OperatorError::InvalidConfig { .. }
            | OperatorError::InvariantViolation(_)
            | OperatorError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Temporary
    }

    /// Suggested delay before the next attempt, when the error carries one.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::Temporary { delay, .. } => *delay,
            _ => None,
        }
    }

    /// The database error code, if this error came from the admin client.
    pub fn db_code(&self) -> Option<u32> {
        match self {
            OperatorError::Db(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Result type alias for operator operations.
pub type Result<T> = std::result::Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_range() {
        assert!(DbError::new(codes::CONN_HOST_ERROR, "no route").is_client_error());
        assert!(DbError::new(codes::SERVER_LOST, "lost").is_client_error());
        assert!(!DbError::new(codes::ACCESS_DENIED, "denied").is_client_error());
        assert!(!DbError::new(codes::INSTANCE_NOT_ONLINE, "offline").is_client_error());
    }

    #[test]
    fn test_fatal_codes() {
        assert!(DbError::new(codes::ACCESS_DENIED, "denied").is_fatal());
        assert!(DbError::new(codes::NO_SUCH_TABLE, "missing").is_fatal());
        assert!(!DbError::new(codes::SERVER_GONE, "gone").is_fatal());
    }

    #[test]
    fn test_error_kinds() {
        let fatal: OperatorError = DbError::new(codes::ACCESS_DENIED, "denied").into();
        assert_eq!(fatal.kind(), ErrorKind::Fatal);
        assert!(!fatal.is_retryable());

        let transport: OperatorError = DbError::new(codes::CONN_HOST_ERROR, "down").into();
        assert_eq!(transport.kind(), ErrorKind::Temporary);

        let busy = OperatorError::Busy {
            key: "ns/cluster".into(),
            holder: "pod-created:cluster-0".into(),
            since: Utc::now(),
        };
        assert!(busy.is_retryable());
        assert_eq!(busy.retry_delay(), None);

        let split = OperatorError::permanent("SplitBrain", "two primaries");
        assert_eq!(split.kind(), ErrorKind::Permanent);
        assert_eq!(split.to_string(), "SplitBrain: two primaries");

        let invariant = OperatorError::InvariantViolation("bad bucket".into());
        assert_eq!(invariant.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_already_removed() {
        assert!(DbError::new(codes::MEMBER_METADATA_MISSING, "gone").is_already_removed());
        assert!(DbError::new(codes::INSTANCE_NOT_MANAGED, "unmanaged").is_already_removed());
        assert!(!DbError::new(codes::SERVER_GONE, "gone").is_already_removed());
    }
}
