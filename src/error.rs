//! Contains the `Error` and `Result` types used throughout the pool.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// The result type used by all fallible pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the connection pool.
///
/// The inner [`ErrorKind`] is wrapped in an `Arc` so that errors can be cheaply cloned when they
/// need to be delivered to more than one waiting stream (for example, when a connect failure
/// purges every pending stream queued on a client).
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    /// The kind of failure this error represents.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The [`PoolFailureReason`] a router should surface for this error, if it originated from a
    /// stream attach or connection-event failure rather than from a purely local misuse (e.g. an
    /// assertion).
    pub fn failure_reason(&self) -> Option<PoolFailureReason> {
        match &*self.kind {
            ErrorKind::Overflow => Some(PoolFailureReason::Overflow),
            ErrorKind::LocalConnectionFailure { .. } => {
                Some(PoolFailureReason::LocalConnectionFailure)
            }
            ErrorKind::RemoteConnectionFailure { .. } => {
                Some(PoolFailureReason::RemoteConnectionFailure)
            }
            ErrorKind::ConnectTimeout => Some(PoolFailureReason::Timeout),
            _ => None,
        }
    }

    pub(crate) fn overflow() -> Self {
        Self::new(ErrorKind::Overflow)
    }

    pub(crate) fn local_connection_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LocalConnectionFailure {
            message: message.into(),
        })
    }

    pub(crate) fn remote_connection_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteConnectionFailure {
            message: message.into(),
        })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// The category of failure backing an [`Error`].
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The pending-requests or requests limit for the host's (cluster, priority) scope has been
    /// reached.
    #[error("pool overflow: resource limit reached")]
    Overflow,

    /// The upstream connection was closed locally, failed to establish, or could not be
    /// allocated.
    #[error("local connection failure: {message}")]
    LocalConnectionFailure { message: String },

    /// The peer closed the connection before the handshake completed.
    #[error("remote connection failure: {message}")]
    RemoteConnectionFailure { message: String },

    /// The connect timer fired before the transport finished connecting.
    #[error("connect timeout")]
    ConnectTimeout,

    /// A caller violated an internal invariant (e.g. transitioning a client that is not tracked
    /// by this pool). These never cross the router boundary in a release build; they exist so
    /// tests can assert on programmer errors without panicking a whole test binary.
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    /// The host or transport-socket factory refused to create a connection.
    #[error("host refused connection: {message}")]
    HostRefused { message: String },

    /// Returned by the codec client boundary when a response could not be parsed.
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

/// The reason surfaced to a router via `on_pool_failure`.
///
/// Mirrors the four outcomes a caller can observe. A connect-timeout purges a client's pending
/// streams as if it were a `RemoteClose` (see `PoolCore::on_connect_timeout`), so `Timeout` itself
/// only ever comes from `Error::failure_reason` on an `ErrorKind::ConnectTimeout` produced outside
/// the connection-event path, e.g. by a `Host::create_connection` implementation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PoolFailureReason {
    Overflow,
    LocalConnectionFailure,
    RemoteConnectionFailure,
    Timeout,
}

impl fmt::Display for PoolFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Overflow => "overflow",
            Self::LocalConnectionFailure => "local_connection_failure",
            Self::RemoteConnectionFailure => "remote_connection_failure",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}
