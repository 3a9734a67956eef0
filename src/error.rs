//! Error types for computation, replication and persistence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rpc::CallId;

/// A failure captured into a computed node's output.
///
/// Failures are plain data so they can be cached, shared between every caller
/// of the same node and sent across a process boundary unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Failure {
    /// Short classification of the failure, usually the Rust type name of the source error.
    pub kind: String,
    /// Human readable message, including the source chain.
    pub message: String,
}

impl Failure {
    /// Create a failure from a kind and a message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an `anyhow` error, keeping its full context chain in the message.
    pub fn from_anyhow(kind: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::new(kind, format!("{:#}", err))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

/// Errors returned when requesting a computed value.
///
/// Any `Into<anyhow::Error>` converts into [`ComputeError::Failed`], so user code
/// can use `?` inside compute bodies. Those failures are captured into the node
/// and replayed to every reader. `Cancelled`, `Cycle` and `Rpc` are system errors.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// The computation failed with an application-level error.
    Failed(Failure),

    /// The computation was cancelled before it produced a result.
    Cancelled,

    /// The computation re-entered a method call that is already being computed
    /// on the same call chain.
    Cycle {
        /// Debug representation of the keys forming the cycle.
        path: Vec<String>,
    },

    /// The remote peer could not produce a result.
    Rpc(RpcError),
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Failed(failure) => write!(f, "computation failed: {}", failure),
            ComputeError::Cancelled => write!(f, "computation cancelled"),
            ComputeError::Cycle { path } => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            ComputeError::Rpc(e) => write!(f, "rpc error: {}", e),
        }
    }
}

/// Wraps any error as an application failure.
///
/// This includes [`RpcError`] and [`Failure`]: `?` on either yields a cached
/// `Failed` whose kind is the Rust type name, and an `RpcError` loses its
/// transient status. Use [`IntoComputeResult::into_compute`] to keep them intact.
impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        let kind = std::any::type_name::<T>();
        ComputeError::Failed(Failure::from_anyhow(kind, &err.into()))
    }
}

/// Converts errors that already have a [`ComputeError`] counterpart without wrapping them.
///
/// ```
/// use computed_flow::{ComputeError, IntoComputeResult, RpcError};
///
/// fn forward(result: Result<u32, RpcError>) -> Result<u32, ComputeError> {
///     Ok(result.into_compute()? + 1)
/// }
///
/// let err = forward(Err(RpcError::Timeout)).unwrap_err();
/// assert!(err.is_transient());
/// ```
pub trait IntoComputeResult<T> {
    /// `RpcError` becomes [`ComputeError::Rpc`], `Failure` becomes [`ComputeError::Failed`].
    fn into_compute(self) -> Result<T, ComputeError>;
}

impl<T> IntoComputeResult<T> for Result<T, RpcError> {
    fn into_compute(self) -> Result<T, ComputeError> {
        self.map_err(ComputeError::Rpc)
    }
}

impl<T> IntoComputeResult<T> for Result<T, Failure> {
    fn into_compute(self) -> Result<T, ComputeError> {
        self.map_err(ComputeError::Failed)
    }
}

impl ComputeError {
    /// Returns the captured failure if this is an application-level error.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ComputeError::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns `true` for errors that go away on retry: cancellation and transport failures.
    pub fn is_transient(&self) -> bool {
        match self {
            ComputeError::Cancelled => true,
            ComputeError::Rpc(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Convert into a [`Failure`] suitable for caching or sending to a peer.
    pub fn into_failure(self) -> Failure {
        match self {
            ComputeError::Failed(failure) => failure,
            ComputeError::Cancelled => Failure::new("cancelled", "computation cancelled"),
            ComputeError::Cycle { path } => {
                Failure::new("cycle", format!("dependency cycle: {}", path.join(" -> ")))
            }
            ComputeError::Rpc(e) => Failure::new("rpc", e.to_string()),
        }
    }
}

/// Transport and protocol level RPC failures.
///
/// These are distinct from application failures returned by the remote method,
/// which travel as [`Failure`] values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RpcError {
    /// The peer has no attached connection, or it was lost while the call was pending.
    #[error("peer disconnected")]
    Disconnected,

    /// A message referenced a call id the receiver does not track.
    #[error("unknown call id {0}")]
    UnknownCall(CallId),

    /// The call did not complete within the configured timeout.
    #[error("call timed out")]
    Timeout,

    /// A message or payload failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote side has no handler for the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The remote side could not run the call, for example because of a cycle.
    #[error("remote error: {0}")]
    Remote(String),

    /// The remote side produced a result of an unexpected type.
    #[error("result type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type expected by the caller.
        expected: String,
        /// Type tag sent by the peer.
        actual: String,
    },
}

impl RpcError {
    /// Returns `true` if retrying after a reconnect may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Disconnected | RpcError::Timeout)
    }
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// Errors reported by a persisted cache backing store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend failed to read or write.
    #[error("backing store failure: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("stored record is corrupt: {0}")]
    Codec(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_mark_captures_failure() {
        fn parse(input: &str) -> Result<i32, ComputeError> {
            Ok(input.parse::<i32>()?)
        }

        let err = parse("nope").unwrap_err();
        let failure = err.failure().expect("application failure");
        assert!(failure.kind.contains("ParseIntError"));
        assert!(failure.message.contains("invalid digit"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_anyhow_context_is_kept() {
        let err: ComputeError = anyhow::anyhow!("disk full").context("saving report").into();
        let failure = err.into_failure();
        assert_eq!(failure.message, "saving report: disk full");
    }

    #[test]
    fn test_into_compute_keeps_system_errors() {
        let wrapped: ComputeError = RpcError::Disconnected.into();
        assert!(!wrapped.is_transient());

        let kept = Err::<(), _>(RpcError::Disconnected).into_compute().unwrap_err();
        assert!(matches!(kept, ComputeError::Rpc(RpcError::Disconnected)));
        assert!(kept.is_transient());

        let failure = Failure::new("io", "disk full");
        let kept = Err::<(), _>(failure.clone()).into_compute().unwrap_err();
        assert_eq!(kept.failure(), Some(&failure));
    }

    #[test]
    fn test_rpc_errors_are_transient() {
        assert!(ComputeError::Rpc(RpcError::Disconnected).is_transient());
        assert!(ComputeError::Rpc(RpcError::Timeout).is_transient());
        assert!(!ComputeError::Rpc(RpcError::MethodNotFound("x".into())).is_transient());
        assert!(ComputeError::Cancelled.is_transient());
    }
}
