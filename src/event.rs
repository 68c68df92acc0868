//! Contains the events emitted for monitoring pool and connection lifecycle.
//!
//! These are ambient diagnostics, not a pool feature: they are emitted directly via [`tracing`]
//! spans and fields when the `tracing-unstable` feature is enabled, rather than dispatched
//! through a handler registry. Callers that want structured event data (e.g. to drive metrics)
//! should subscribe a `tracing::Subscriber` and match on the `target` and fields documented
//! below.

use std::fmt;

use crate::host::HostId;

/// The reason a connection was closed, attached to the `connection.closed` event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The pool was drained (e.g. a cluster membership change) since the connection was created.
    Stale,

    /// The connection exceeded its configured idle timeout.
    Idle,

    /// A local or remote error occurred while using the connection.
    Error,

    /// The connection was dropped without an orderly close, e.g. during mid-stream I/O.
    Dropped,

    /// The pool the connection belonged to was closed.
    PoolClosed,

    /// The remote peer closed the connection.
    RemoteClose,
}

impl fmt::Display for ConnectionClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stale => "stale",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Dropped => "dropped",
            Self::PoolClosed => "pool_closed",
            Self::RemoteClose => "remote_close",
        };
        f.write_str(s)
    }
}

/// Emits a `pool.created` event for `host`.
pub(crate) fn pool_created(host: &HostId) {
    emit(host, "pool.created", None, None);
}

/// Emits a `pool.ready` event, fired the first time a pool successfully establishes a connection.
pub(crate) fn pool_ready(host: &HostId) {
    emit(host, "pool.ready", None, None);
}

/// Emits a `pool.cleared` event, fired when every connection in the pool is marked for draining.
pub(crate) fn pool_cleared(host: &HostId) {
    emit(host, "pool.cleared", None, None);
}

/// Emits a `pool.closed` event, fired once during the pool's destructor path.
pub(crate) fn pool_closed(host: &HostId) {
    emit(host, "pool.closed", None, None);
}

/// Emits a `connection.created` event for a newly allocated client slot.
pub(crate) fn connection_created(host: &HostId, connection_id: u64) {
    emit(host, "connection.created", Some(connection_id), None);
}

/// Emits a `connection.ready` event once a client finishes connecting (and, for protocols with a
/// handshake, once that handshake completes).
pub(crate) fn connection_ready(host: &HostId, connection_id: u64) {
    emit(host, "connection.ready", Some(connection_id), None);
}

/// Emits a `connection.closed` event with the reason the connection went away.
pub(crate) fn connection_closed(host: &HostId, connection_id: u64, reason: ConnectionClosedReason) {
    emit(host, "connection.closed", Some(connection_id), Some(reason));
}

/// Emits a `stream.checkout_started` event.
pub(crate) fn stream_checkout_started(host: &HostId) {
    emit(host, "stream.checkout_started", None, None);
}

/// Emits a `stream.checked_out` event once a pending stream is attached to a ready client.
pub(crate) fn stream_checked_out(host: &HostId, connection_id: u64) {
    emit(host, "stream.checked_out", Some(connection_id), None);
}

/// Emits a `stream.checkout_failed` event.
pub(crate) fn stream_checkout_failed(host: &HostId, reason: crate::error::PoolFailureReason) {
    #[cfg(feature = "tracing-unstable")]
    tracing::debug!(
        target: "upstream_pool::event",
        cluster = %host.cluster,
        priority = ?host.priority,
        %reason,
        "stream.checkout_failed"
    );
    #[cfg(not(feature = "tracing-unstable"))]
    let _ = (host, reason);
}

/// Emits an `early_data.rejected` event when a client that became zero-RTT-ready does not support
/// early data: the attempted transition to `ReadyForEarlyData` is rejected and the client is left
/// `Connecting`.
pub(crate) fn early_data_rejected(host: &HostId) {
    emit(host, "early_data.rejected", None, None);
}

fn emit(
    host: &HostId,
    name: &'static str,
    connection_id: Option<u64>,
    reason: Option<ConnectionClosedReason>,
) {
    #[cfg(feature = "tracing-unstable")]
    {
        let reason = reason.map(|r| r.to_string());
        tracing::debug!(
            target: "upstream_pool::event",
            cluster = %host.cluster,
            priority = ?host.priority,
            connection_id,
            reason,
            "{}", name
        );
    }
    #[cfg(not(feature = "tracing-unstable"))]
    let _ = (host, name, connection_id, reason);
}
