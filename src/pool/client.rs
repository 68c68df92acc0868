//! The active-client state machine and its capacity bookkeeping.

use std::fmt;
use std::sync::Arc;

use crate::host::HostDescription;
use crate::transport::ClientConnection;

/// Translates a `0` limit (meaning "unlimited" at the configuration layer) to `u32::MAX`. Applied
/// exactly once, at construction, to `lifetime_stream_limit` and `concurrent_stream_limit`.
pub fn translate_zero_to_unlimited(limit: u64) -> u32 {
    if limit == 0 {
        u32::MAX
    } else {
        limit.try_into().unwrap_or(u32::MAX)
    }
}

/// The lifecycle state of one upstream connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ClientState {
    Connecting,
    ReadyForEarlyData,
    Ready,
    Busy,
    Draining,
    Closed,
}

/// Which of [`crate::pool::core::PoolCore`]'s four lists a state belongs to. `Closed` clients are
/// not tracked in any list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ClientListKind {
    Connecting,
    EarlyData,
    Ready,
    /// Busy and Draining share one list: both represent a client that will not accept a *new*
    /// stream from `on_upstream_ready`, but may still have one in flight.
    BusyOrDraining,
}

impl ClientState {
    pub fn list_kind(self) -> Option<ClientListKind> {
        match self {
            Self::Connecting => Some(ClientListKind::Connecting),
            Self::ReadyForEarlyData => Some(ClientListKind::EarlyData),
            Self::Ready => Some(ClientListKind::Ready),
            Self::Busy | Self::Draining => Some(ClientListKind::BusyOrDraining),
            Self::Closed => None,
        }
    }
}

/// State common to every active client, regardless of protocol specialization.
///
/// Protocol specializations (`Http1Client`, `TcpClient`) embed this and add their own fields; the
/// pool core only ever touches clients through the [`super::core::ClientLifecycle`] trait, which
/// exposes this struct plus a few protocol-specific hooks.
pub struct ActiveClientBase {
    pub real_host_description: Arc<dyn HostDescription>,
    pub connection: Box<dyn ClientConnection>,
    pub state: ClientState,
    /// Remaining lifetime budget. `0` at construction is translated to `u32::MAX` by
    /// [`translate_zero_to_unlimited`] before being stored here.
    pub remaining_streams: u32,
    pub concurrent_stream_limit: u32,
    pub configured_stream_limit: u32,
    pub resources_released: bool,
    pub timed_out: bool,
    pub handshake_completed: bool,
}

impl fmt::Debug for ActiveClientBase {
    /// `ClientConnection` carries no `Debug` bound (its implementations live on the other side of
    /// the transport boundary), so the connection is rendered as a placeholder rather than
    /// derived.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveClientBase")
            .field("real_host_description", &self.real_host_description)
            .field("state", &self.state)
            .field("remaining_streams", &self.remaining_streams)
            .field("concurrent_stream_limit", &self.concurrent_stream_limit)
            .field("configured_stream_limit", &self.configured_stream_limit)
            .field("resources_released", &self.resources_released)
            .field("timed_out", &self.timed_out)
            .field("handshake_completed", &self.handshake_completed)
            .finish()
    }
}

impl ActiveClientBase {
    pub fn new(
        real_host_description: Arc<dyn HostDescription>,
        connection: Box<dyn ClientConnection>,
        lifetime_stream_limit: u64,
        concurrent_stream_limit: u32,
    ) -> Self {
        let remaining_streams = translate_zero_to_unlimited(lifetime_stream_limit);
        Self {
            real_host_description,
            connection,
            state: ClientState::Connecting,
            remaining_streams,
            concurrent_stream_limit,
            configured_stream_limit: concurrent_stream_limit,
            resources_released: false,
            timed_out: false,
            handshake_completed: false,
        }
    }

    /// `min(remaining_streams, concurrent_stream_limit - num_active_streams)`.
    pub fn current_unused_capacity(&self, num_active_streams: u32) -> u32 {
        let concurrent_remaining = self
            .concurrent_stream_limit
            .saturating_sub(num_active_streams);
        self.remaining_streams.min(concurrent_remaining)
    }

    /// `min(remaining_streams, concurrent_stream_limit)`.
    pub fn effective_concurrent_stream_limit(&self) -> u32 {
        self.remaining_streams.min(self.concurrent_stream_limit)
    }

    /// Runs the base portion of resource release. Guarded so it only has an effect once;
    /// specializations call this and then run their own teardown.
    ///
    /// Returns whether this call actually performed the release (`false` if it had already run).
    pub fn release_resources_once(&mut self) -> bool {
        if self.resources_released {
            return false;
        }
        self.resources_released = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_becomes_unlimited() {
        assert_eq!(translate_zero_to_unlimited(0), u32::MAX);
        assert_eq!(translate_zero_to_unlimited(5), 5);
    }

    #[test]
    fn list_kind_groups_busy_and_draining() {
        assert_eq!(
            ClientState::Busy.list_kind(),
            ClientState::Draining.list_kind()
        );
        assert_eq!(ClientState::Closed.list_kind(), None);
    }
}
