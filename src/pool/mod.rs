//! The connection pool: a generic engine (see [`core`]) plus the protocol specializations that
//! plug into it ([`http1`], [`tcp`]) and the router-facing surface exposed by each.

pub mod client;
pub mod core;
pub mod http1;
pub mod pending;
pub mod tcp;

use std::sync::Arc;

use crate::host::HostDescription;

use self::core::DrainBehavior;
use self::pending::CancelHandle;

/// The surface every connection pool exposes to a router, regardless of protocol.
pub trait ConnectionPool {
    /// Registers a callback to run the next time (and every time) the pool becomes idle.
    fn add_idle_callback(&self, cb: Box<dyn FnOnce()>);

    /// Whether every client list and the pending-stream queue are empty.
    fn is_idle(&self) -> bool;

    /// Drains the pool's connections per `behavior`.
    fn drain_connections(&self, behavior: DrainBehavior);

    /// The host this pool is bound to.
    fn host(&self) -> Arc<dyn HostDescription>;

    /// Attempts one preconnect at the given ratio; returns whether it created a connection.
    fn maybe_preconnect(&self, ratio: f32) -> bool;
}

/// The HTTP/1 router-facing surface, implemented by [`http1::FixedHttpPool`].
pub trait HttpConnectionPool: ConnectionPool {
    /// Attaches `context` to a client, creating one if necessary. Returns `None` if the stream was
    /// resolved synchronously (attached or failed); otherwise a handle to cancel it later.
    fn new_stream(
        &self,
        context: http1::Http1Context,
        can_send_early_data: bool,
    ) -> Option<CancelHandle>;

    /// Whether the pool has at least one client that is not `Connecting`.
    fn has_active_connections(&self) -> bool;

    /// A short, human-readable protocol name for diagnostics (`"HTTP/1.1"`, etc.).
    fn protocol_description(&self) -> &'static str;
}

/// The TCP router-facing surface, implemented by [`tcp::TcpPool`].
pub trait TcpConnectionPool: ConnectionPool {
    /// Requests a new upstream tunnel. Returns `None` if resolved synchronously; otherwise a
    /// handle to cancel it later.
    fn new_connection(&self, callbacks: Box<dyn tcp::TcpUpstreamCallbacks>) -> Option<CancelHandle>;

    /// Closes every active tunnel (but does not drain pending connection requests).
    fn close_connections(&self);
}
