//! Boundary contract consumed from the underlying network connection.
//!
//! TLS and raw-buffer transport socket implementations live on the other side of this boundary;
//! the pool only ever sees the [`ClientConnection`] trait.

use bytes::Bytes;

use crate::error::Result;

/// Observed lifecycle state of a transport connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// An event delivered to a connection callbacks listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionEvent {
    Connected,
    /// 0-RTT / early-data ready: the connection can carry streams before the handshake completes.
    ConnectedZeroRtt,
    LocalClose,
    RemoteClose,
}

/// How a connection close should be carried out.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CloseType {
    /// Close without flushing any pending write buffer.
    NoFlush,
    /// Flush pending writes, then close.
    FlushWrite,
    /// Flush pending writes, then close after a delay (used to let a final write land).
    FlushWriteAndDelay,
    /// Close immediately, abandoning any buffered state.
    Abort,
    /// Close immediately and send a reset to the peer.
    AbortReset,
}

/// Callback sink a [`ClientConnection`] delivers [`ConnectionEvent`]s to.
///
/// Not `Send`: a pool and everything reachable from it is pinned to the single thread driving
/// its dispatcher, per the concurrency model in this crate's pool module.
pub trait ConnectionCallbacks {
    fn on_event(&mut self, event: ConnectionEvent);
}

/// A filter that observes raw bytes read off the connection, used by the TCP specialization.
pub trait ReadFilter {
    /// Called with data read from the connection. `end_stream` indicates the peer half-closed.
    fn on_data(&mut self, data: Bytes, end_stream: bool);
}

/// The upstream transport connection, consumed by the pool via a trait object so the TLS and
/// raw-buffer implementations can live entirely outside this crate.
pub trait ClientConnection {
    /// The connection's current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Enables or disables reading from the connection. Returns whether the toggle took effect
    /// (some transports may reject disabling past a certain point in their shutdown sequence).
    fn read_disable(&mut self, disable: bool) -> Result<()>;

    /// Sets `TCP_NODELAY` (or the transport's equivalent).
    fn no_delay(&mut self, enable: bool);

    /// Closes the connection using the given strategy.
    fn close(&mut self, close_type: CloseType);

    /// Writes bytes to the connection. `end_stream` half-closes the write side after flushing.
    fn write(&mut self, data: Bytes, end_stream: bool) -> Result<()>;

    /// Registers a callbacks listener for connection lifecycle events. A connection only ever
    /// has one active listener, matching how the pool binds a client's lifetime 1:1 with its
    /// connection.
    fn add_connection_callbacks(&mut self, callbacks: Box<dyn ConnectionCallbacks>);

    /// Installs a read filter; only meaningful for the raw TCP specialization.
    fn add_read_filter(&mut self, filter: Box<dyn ReadFilter>);

    /// Sets the SNI server name to request during the transport handshake, if applicable.
    fn set_requested_server_name(&mut self, name: &str);
}
