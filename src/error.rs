//! Error types for remote tasks.
//!
//! [`TaskError`] is the single error type flowing through the task machinery. Whether a failure is
//! worth another attempt is decided by [`TaskError::is_retryable`]:
//!
//! - resolution failures (`NotFound`, `NoLeader`, `Unreachable`) are retryable because membership
//!   and leadership change over time;
//! - transport failures (`Transport`, `RpcTimedOut`) are always retryable within the task budget;
//! - remote application errors are retryable unless an operation classifies them otherwise;
//! - exhaustion, shutdown and abort conditions are terminal.
use std::fmt;
use std::time::Duration;

/// Application-level error code reported by a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServerErrorCode {
    TabletNotFound,
    TabletNotRunning,
    CasFailed,
    WrongServerUuid,
    NotTheLeader,
    LeaderNotReadyToServe,
    AddChangeConfigAlreadyPresent,
    RemoveChangeConfigNotPresent,
    MismatchedSchema,
    TabletHasANewerSchema,
    UnknownError,
}

/// Generic status carried alongside a [`ServerErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatusCode {
    AlreadyPresent,
    NotFound,
    InvalidArgument,
    NotSupported,
    Incomplete,
    IllegalState,
    ServiceUnavailable,
    RemoteError,
}

/// Error payload returned by a node that received and rejected a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<ServerErrorCode>,
    pub status: StatusCode,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?} ({:?}): {}", self.status, code, self.message),
            None => write!(f, "{:?}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

impl RemoteError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { code: None, status, message: message.into() }
    }

    pub fn with_code(
        code: ServerErrorCode,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self { code: Some(code), status, message: message.into() }
    }
}

/// Unified error type for task resolution, transport and lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The target node is not known to the cluster.
    #[error("node not found: {0}")]
    NotFound(String),
    /// No leader is currently known for the partition.
    #[error("no leader known for partition {0}")]
    NoLeader(String),
    /// The node is known but no connection could be opened to it.
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },
    /// The RPC failed at the network layer.
    #[error("transport error: {0}")]
    Transport(String),
    /// The RPC did not complete before the per-attempt deadline.
    #[error("rpc timed out after {0:?}")]
    RpcTimedOut(Duration),
    /// The node answered with an application error.
    #[error("remote error: {0}")]
    Remote(RemoteError),
    /// The task deadline passed before another attempt could be scheduled.
    #[error("request timed out after {attempts} attempt(s)")]
    TimedOut { attempts: u32 },
    /// The retry policy allows no further attempts.
    #[error("reached maximum number of retries ({attempts} attempts, threshold {threshold})")]
    RetriesExhausted { attempts: u32, threshold: u32 },
    /// The task was cancelled.
    #[error("aborted: {0}")]
    Aborted(String),
    /// A scheduler or worker pool refused work because it is shutting down.
    #[error("shutting down: {0}")]
    ShuttingDown(String),
    /// A worker pool refused work because its queue is full.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The target expired; no further attempt can succeed.
    #[error("expired: {0}")]
    Expired(String),
    /// The task was asked to do something its current state forbids.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl TaskError {
    /// Whether another attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::NoLeader(_)
                | Self::Unreachable { .. }
                | Self::Transport(_)
                | Self::RpcTimedOut(_)
                | Self::Remote(_)
        )
    }

    /// Network-level failure: the request may or may not have reached the node.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RpcTimedOut(_) | Self::Unreachable { .. })
    }

    /// Access the remote payload if this is an application error.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Server error code of a remote application error, if any.
    pub fn server_code(&self) -> Option<ServerErrorCode> {
        self.as_remote().and_then(|e| e.code)
    }

    /// Status of a remote application error, if any.
    pub fn remote_status(&self) -> Option<StatusCode> {
        self.as_remote().map(|e| e.status)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::ShuttingDown(_))
    }
}

impl From<RemoteError> for TaskError {
    fn from(e: RemoteError) -> Self {
        TaskError::Remote(e)
    }
}

/// Invalid [`TaskConfig`](crate::TaskConfig) values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
    #[error("rpc_timeout ({rpc_timeout:?}) must not exceed unresponsive_timeout ({unresponsive_timeout:?})")]
    RpcTimeoutExceedsTaskTimeout { rpc_timeout: Duration, unresponsive_timeout: Duration },
}

/// Failure to build a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool needs at least one thread")]
    NoWorkers,
    #[error("worker pool queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_and_transport_errors_are_retryable() {
        assert!(TaskError::NotFound("ts-1".into()).is_retryable());
        assert!(TaskError::NoLeader("tablet-1".into()).is_retryable());
        assert!(TaskError::Transport("connection reset".into()).is_retryable());
        assert!(TaskError::RpcTimedOut(Duration::from_secs(30)).is_retryable());
        assert!(TaskError::Unreachable { node: "ts-1".into(), reason: "refused".into() }
            .is_retryable());
    }

    #[test]
    fn lifecycle_errors_are_terminal() {
        assert!(!TaskError::TimedOut { attempts: 3 }.is_retryable());
        assert!(!TaskError::RetriesExhausted { attempts: 21, threshold: 20 }.is_retryable());
        assert!(!TaskError::Aborted("table deleted".into()).is_retryable());
        assert!(!TaskError::ShuttingDown("scheduler closed".into()).is_retryable());
        assert!(!TaskError::Expired("tablet expired".into()).is_retryable());
        assert!(!TaskError::IllegalState("not running".into()).is_retryable());
    }

    #[test]
    fn remote_errors_expose_code_and_status() {
        let err: TaskError = RemoteError::with_code(
            ServerErrorCode::NotTheLeader,
            StatusCode::IllegalState,
            "not the leader",
        )
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.server_code(), Some(ServerErrorCode::NotTheLeader));
        assert_eq!(err.remote_status(), Some(StatusCode::IllegalState));
        assert!(!err.is_transport());

        let msg = err.to_string();
        assert!(msg.contains("NotTheLeader"));
        assert!(msg.contains("not the leader"));
    }

    #[test]
    fn remote_error_without_code_displays_status() {
        let err = RemoteError::new(StatusCode::AlreadyPresent, "replica exists");
        assert_eq!(err.to_string(), "AlreadyPresent: replica exists");
    }

    #[test]
    fn exhaustion_display_mentions_retries() {
        let err = TaskError::RetriesExhausted { attempts: 1, threshold: 0 };
        assert!(err.to_string().contains("maximum number of retries"));
        assert!(TaskError::TimedOut { attempts: 4 }.to_string().contains("timed out"));
    }
}
