//! Error taxonomy for the sync: source, store, state, config.
//!
//! Transient store errors are the only ones the orchestrator retries.
//! Everything else ends the run.
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Why a single Square request attempt failed.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("invalid request: {0}")]
    Build(String),
}

impl RequestError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestError::Status { status, .. } => Some(*status),
            RequestError::Transport(err) | RequestError::Decode(err) => err.status(),
            RequestError::Build(_) => None,
        }
    }

    /// Rate limiting or a server-side failure: retried with exponential backoff.
    pub fn is_throttle(&self) -> bool {
        match self {
            RequestError::Status { status, .. } => matches!(
                *status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::INTERNAL_SERVER_ERROR
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("square request failed after {attempts} attempts: {operation}: {last}")]
    Unavailable {
        operation: String,
        attempts: u32,
        #[source]
        last: RequestError,
    },
    #[error("invalid square request {operation}: {source}")]
    Invalid {
        operation: String,
        #[source]
        source: RequestError,
    },
}

impl SourceError {
    /// HTTP status of the last failed attempt, if it got that far.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SourceError::Unavailable { last, .. } => last.status(),
            SourceError::Invalid { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{context}: {source}")]
    Persistent {
        context: String,
        #[source]
        source: sqlx::Error,
    },
}

/// SQLSTATE for `admin_shutdown`, raised when the server terminates a session.
const ADMIN_SHUTDOWN: &str = "57P01";

const TRANSIENT_MARKERS: &[&str] = &[
    "bad record mac",
    "ssl",
    "tls",
    "consuming input failed",
    "connection terminated",
    "connection is lost",
    "connection closed",
    "connection reset",
    "socket hang up",
    "econnreset",
    "timed out",
    "timeout",
    "server closed the connection",
    "broken pipe",
];

impl StoreError {
    /// Classify a driver error as transient (reconnect and retry) or persistent.
    pub fn classify(context: impl Into<String>, source: sqlx::Error) -> Self {
        let context = context.into();
        if is_transient(&source) {
            StoreError::Transient { context, source }
        } else {
            StoreError::Persistent { context, source }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => return true,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(ADMIN_SHUTDOWN) => return true,
        _ => {}
    }
    let msg = err.to_string().to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| msg.contains(m))
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is not valid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Any failure that ends a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl SyncError {
    pub fn is_transient_store(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_transient())
    }

    /// Subsystem label used for alert codes and logs.
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "sync.config",
            SyncError::Source(_) => "sync.square",
            SyncError::Store(_) => "sync.db",
            SyncError::State(_) => "sync.state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_errors_are_transient() {
        let err = StoreError::classify(
            "upsert products",
            sqlx::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        );
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("upsert products: "));
    }

    #[test]
    fn ssl_message_is_transient() {
        let err = StoreError::classify(
            "commit",
            sqlx::Error::Protocol("SSL error: decryption failed or bad record mac".into()),
        );
        assert!(err.is_transient());
    }

    #[test]
    fn constraint_violation_is_persistent() {
        let err = StoreError::classify(
            "upsert products",
            sqlx::Error::Protocol("duplicate key value violates unique constraint".into()),
        );
        assert!(!err.is_transient());
        assert!(!SyncError::from(err).is_transient_store());
    }

    #[test]
    fn pool_timeout_is_transient() {
        assert!(StoreError::classify("begin", sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::classify("decode", sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn stages_per_subsystem() {
        let err = SyncError::Source(SourceError::Unavailable {
            operation: "POST /v2/catalog/search".into(),
            attempts: 5,
            last: RequestError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "busy".into(),
            },
        });
        assert_eq!(err.stage(), "sync.square");
        assert!(err.to_string().contains("after 5 attempts"));
        assert!(err.to_string().contains("HTTP 503 Service Unavailable: busy"));
    }

    #[test]
    fn source_error_keeps_last_attempt_as_cause() {
        use std::error::Error as _;
        let err = SourceError::Unavailable {
            operation: "GET v2/catalog/list".into(),
            attempts: 5,
            last: RequestError::Status {
                status: StatusCode::UNAUTHORIZED,
                body: "bad token".into(),
            },
        };
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        let cause = err.source().expect("cause");
        assert_eq!(cause.to_string(), "HTTP 401 Unauthorized: bad token");
        assert!(!RequestError::Status {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        }
        .is_throttle());
        assert!(RequestError::Status {
            status: StatusCode::GATEWAY_TIMEOUT,
            body: String::new(),
        }
        .is_throttle());
    }
}
