//! The generic pool engine: client lists, pending-stream queue, capacity accounting, preconnect,
//! draining, and connection-event handling.
//!
//! Protocol specializations plug in by implementing [`ActiveClientOps`]; this module never
//! constructs an `Http1Client` or `TcpClient` directly.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::arena::{Arena, Id};
use crate::dispatcher::{Dispatcher, ScheduledCallback};
use crate::error::{PoolFailureReason, Result};
use crate::event;
use crate::host::{Host, HostDescription, HostId, Priority};
use crate::options::ConnectionPoolOptions;
use crate::resource::ResourceManager;
use crate::transport::{ConnectionCallbacks, ConnectionEvent};

use super::client::{ActiveClientBase, ClientListKind, ClientState};
use super::pending::{CancelHandle, CancelPolicy, PendingStream};

/// Per-client hooks a protocol specialization must provide so [`PoolCore`] can drive it without
/// knowing its concrete type.
pub trait ClientLifecycle {
    fn base(&self) -> &ActiveClientBase;
    fn base_mut(&mut self) -> &mut ActiveClientBase;

    /// Whether this client can accept a stream before its handshake completes.
    fn supports_early_data(&self) -> bool;

    /// Number of streams currently attached. HTTP/1 is 0 or 1 (one stream wrapper); TCP is 0 or 1
    /// (one set of tunnel callbacks).
    fn num_active_streams(&self) -> u32;

    /// Runs once, the first time the client is released (guarded by the caller via
    /// `resources_released`). Specializations override to additionally tear down
    /// protocol-specific attachments (e.g. defer a stream wrapper for deletion).
    fn release_resources(&mut self) {
        let _ = self.base_mut().release_resources_once();
    }
}

/// The five-hook seam a protocol specialization implements to plug into [`PoolCore`].
pub trait ActiveClientOps {
    type Client: ClientLifecycle;
    type Context;

    /// Creates an unconnected client bound to `dispatcher`, via `host.create_connection`.
    fn instantiate_active_client(
        &mut self,
        host: &dyn Host,
        dispatcher: &Rc<dyn Dispatcher>,
    ) -> Result<(Self::Client, Arc<dyn HostDescription>)>;

    /// Wraps a freshly enqueued pending stream. The default behavior is a pass-through; a
    /// specialization may use this to normalize `can_send_early_data` (TCP always forces `false`).
    fn new_pending_stream(
        &mut self,
        context: Self::Context,
        can_send_early_data: bool,
    ) -> PendingStream<Self::Context> {
        PendingStream::new(context, can_send_early_data).0
    }

    /// A stream was attached to `client` synchronously or via a connection event.
    fn on_pool_ready(&mut self, client: &mut Self::Client, context: Self::Context);

    /// A stream could not be attached; `host_description` is the client's, if one exists yet.
    fn on_pool_failure(
        &mut self,
        host_description: Arc<dyn HostDescription>,
        reason: PoolFailureReason,
        context: Self::Context,
    );

    /// The client finished connecting (handshake complete).
    fn on_connected(&mut self, client: &mut Self::Client);

    /// The client failed to connect or was closed before connecting.
    fn on_connect_failed(&mut self, client: &mut Self::Client);

    /// Called once, immediately after a client is assigned its id inside the arena. Default
    /// no-op; HTTP/1 and TCP specializations override this to install a read filter keyed to
    /// `(pool, id)`, the same resolution pattern [`ConnectionEventSink`] uses for connection
    /// events.
    fn on_client_instantiated(
        &mut self,
        _client: &mut Self::Client,
        _pool: Weak<RefCell<PoolCore<Self>>>,
        _id: ClientId<Self>,
    ) where
        Self: Sized,
    {
    }
}

/// A generation-checked reference to a client inside a [`PoolCore`].
pub type ClientId<Ops> = Id<<Ops as ActiveClientOps>::Client>;

/// The generic pool engine. Owns its clients by indexed arena rather than by strong reference
/// cycles: a connection-event callback holds `(Weak<RefCell<PoolCore<Ops>>>, ClientId<Ops>)` and
/// resolves through the arena on each use, so a client that has already been removed is simply
/// not found.
pub struct PoolCore<Ops: ActiveClientOps> {
    pub ops: Ops,
    host: Arc<dyn Host>,
    host_description: Arc<dyn HostDescription>,
    host_id: HostId,
    priority: Priority,
    dispatcher: Rc<dyn Dispatcher>,
    options: ConnectionPoolOptions,

    /// Set once, right after construction, so connection-event and read-filter sinks can resolve
    /// back through the arena instead of holding a strong cycle. See [`new_pool`].
    self_weak: Weak<RefCell<PoolCore<Ops>>>,

    clients: Arena<Ops::Client>,
    connecting: Vec<ClientId<Ops>>,
    early_data: Vec<ClientId<Ops>>,
    ready: Vec<ClientId<Ops>>,
    busy_or_draining: Vec<ClientId<Ops>>,

    pending_streams: VecDeque<PendingStream<Ops::Context>>,
    idle_callbacks: Vec<Box<dyn FnOnce()>>,
    upstream_ready_cb: Option<Rc<dyn ScheduledCallback>>,

    connecting_and_connected_stream_capacity: i64,
    connecting_stream_capacity: u32,
    num_active_streams: u32,
    is_draining_for_deletion: bool,
    became_ready: bool,
}

/// The outcome of one `try_create_new_connection` attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectAttempt {
    CreatedNewConnection,
    /// Admission control refused and the pool already has at least one client.
    NoConnectionRateLimited,
    /// Admission control refused, but the pool was empty so the connection was created anyway to
    /// avoid deadlocking.
    CreatedButRateLimited,
    ShouldNotConnect,
    FailedToCreateConnection,
}

impl<Ops: ActiveClientOps> PoolCore<Ops> {
    pub fn list_mut(&mut self, kind: ClientListKind) -> &mut Vec<ClientId<Ops>> {
        match kind {
            ClientListKind::Connecting => &mut self.connecting,
            ClientListKind::EarlyData => &mut self.early_data,
            ClientListKind::Ready => &mut self.ready,
            ClientListKind::BusyOrDraining => &mut self.busy_or_draining,
        }
    }

    pub fn list(&self, kind: ClientListKind) -> &Vec<ClientId<Ops>> {
        match kind {
            ClientListKind::Connecting => &self.connecting,
            ClientListKind::EarlyData => &self.early_data,
            ClientListKind::Ready => &self.ready,
            ClientListKind::BusyOrDraining => &self.busy_or_draining,
        }
    }

    pub fn host_description(&self) -> &Arc<dyn HostDescription> {
        &self.host_description
    }

    pub fn num_active_streams(&self) -> u32 {
        self.num_active_streams
    }

    pub fn connecting_and_connected_stream_capacity(&self) -> i64 {
        self.connecting_and_connected_stream_capacity
    }

    pub fn connecting_stream_capacity(&self) -> u32 {
        self.connecting_stream_capacity
    }

    pub fn pending_stream_count(&self) -> usize {
        self.pending_streams.len()
    }

    pub fn client(&self, id: ClientId<Ops>) -> Option<&Ops::Client> {
        self.clients.get(id)
    }

    pub fn client_mut(&mut self, id: ClientId<Ops>) -> Option<&mut Ops::Client> {
        self.clients.get_mut(id)
    }

    fn resource_manager(&self) -> Arc<ResourceManager> {
        self.host_description
            .cluster()
            .resource_manager(self.priority)
    }

    fn move_client(&mut self, id: ClientId<Ops>, from: Option<ClientListKind>, to: ClientState) {
        if let Some(from) = from {
            self.list_mut(from).retain(|&x| x != id);
        }
        if let Some(kind) = to.list_kind() {
            self.list_mut(kind).push(id);
        }
        if let Some(client) = self.clients.get_mut(id) {
            client.base_mut().state = to;
        }
    }

    /// `new_stream(context, can_send_early_data)`. See §4.5.1.
    pub fn new_stream(
        &mut self,
        context: Ops::Context,
        can_send_early_data: bool,
    ) -> Option<CancelHandle> {
        event::stream_checkout_started(&self.host_id);

        if let Some(&id) = self.ready.first() {
            self.attach_stream_to_client(id, context);
            self.try_create_new_connection(0.0);
            return None;
        }
        if can_send_early_data {
            if let Some(&id) = self.early_data.first() {
                self.attach_stream_to_client(id, context);
                self.try_create_new_connection(0.0);
                return None;
            }
        }

        if !self.resource_manager().pending_requests().can_create() {
            event::stream_checkout_failed(&self.host_id, PoolFailureReason::Overflow);
            self.ops
                .on_pool_failure(self.host_description.clone(), PoolFailureReason::Overflow, context);
            return None;
        }

        self.resource_manager().pending_requests().inc();
        let pending = self.ops.new_pending_stream(context, can_send_early_data);
        let handle = pending.cancel_handle();
        self.pending_streams.push_back(pending);

        if matches!(self.try_create_new_connections(), ConnectAttempt::FailedToCreateConnection) {
            // The stream we just enqueued is the one that failed to get a connection started;
            // per §4.5.1 only the very first attempt failing cancels it.
            let pending = self.pending_streams.pop_back().unwrap();
            self.resource_manager().pending_requests().dec();
            event::stream_checkout_failed(&self.host_id, PoolFailureReason::LocalConnectionFailure);
            self.ops.on_pool_failure(
                self.host_description.clone(),
                PoolFailureReason::LocalConnectionFailure,
                pending.context,
            );
            return None;
        }

        Some(handle)
    }

    /// `should_connect(pending, active, capacity, ratio, anticipate)`, §4.5.2.
    fn should_connect(&self, ratio: f32, anticipate: bool) -> bool {
        let pending = self.pending_streams.len() as f32;
        let active = self.num_active_streams as f32;
        let anticipated = if anticipate { 1.0 } else { 0.0 };
        let capacity = self.connecting_and_connected_stream_capacity as f32;
        (pending + active + anticipated) * ratio > capacity + active
    }

    /// `try_create_new_connection(ratio)`, §4.5.2.
    pub fn try_create_new_connection(&mut self, ratio: f32) -> ConnectAttempt {
        if self.is_draining_for_deletion {
            return ConnectAttempt::ShouldNotConnect;
        }
        let (ratio, anticipate) = if ratio == 0.0 {
            (self.host_description.cluster().per_upstream_preconnect_ratio(), false)
        } else {
            (ratio, true)
        };

        if !self.should_connect(ratio, anticipate) {
            return ConnectAttempt::ShouldNotConnect;
        }

        let pool_empty = self.connecting.is_empty()
            && self.early_data.is_empty()
            && self.ready.is_empty()
            && self.busy_or_draining.is_empty();
        let mut rate_limited = false;
        if !self.host.can_create_connection(self.priority) {
            if !pool_empty {
                return ConnectAttempt::NoConnectionRateLimited;
            }
            rate_limited = true;
        }

        let (client, real_host_description) =
            match self.ops.instantiate_active_client(self.host.as_ref(), &self.dispatcher) {
                Ok(pair) => pair,
                Err(_) => return ConnectAttempt::FailedToCreateConnection,
            };

        let id = self.clients.insert(client);
        let capacity = self
            .clients
            .get(id)
            .map(|c| c.base().current_unused_capacity(c.num_active_streams()))
            .unwrap_or(0);
        self.connecting_and_connected_stream_capacity += capacity as i64;
        self.connecting_stream_capacity += capacity;
        self.connecting.insert(0, id);

        if let Some(client) = self.clients.get_mut(id) {
            let sink = ConnectionEventSink::new(self.self_weak.clone(), id);
            client.base_mut().connection.add_connection_callbacks(Box::new(sink));
        }
        if let Some(client) = self.clients.get_mut(id) {
            self.ops.on_client_instantiated(client, self.self_weak.clone(), id);
        }

        event::connection_created(&self.host_id, id_as_u64(id));
        let _ = real_host_description;

        if rate_limited {
            ConnectAttempt::CreatedButRateLimited
        } else {
            ConnectAttempt::CreatedNewConnection
        }
    }

    /// `try_create_new_connections()`: loop at most three times, stop as soon as a call does not
    /// create a new connection. Returns the last call's result.
    pub fn try_create_new_connections(&mut self) -> ConnectAttempt {
        let mut attempt = ConnectAttempt::ShouldNotConnect;
        for _ in 0..3 {
            attempt = self.try_create_new_connection(1.0);
            if !matches!(attempt, ConnectAttempt::CreatedNewConnection) {
                break;
            }
        }
        attempt
    }

    /// `attach_stream_to_client`, §4.5.3.
    pub fn attach_stream_to_client(&mut self, id: ClientId<Ops>, context: Ops::Context) {
        if self.options.enforce_max_requests && !self.resource_manager().requests().can_create() {
            let host_description = self
                .clients
                .get(id)
                .map(|c| c.base().real_host_description.clone())
                .unwrap_or_else(|| self.host_description.clone());
            event::stream_checkout_failed(&self.host_id, PoolFailureReason::Overflow);
            self.ops
                .on_pool_failure(host_description, PoolFailureReason::Overflow, context);
            return;
        }

        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let num_active = client.num_active_streams();
        let capacity = client.base().current_unused_capacity(num_active);
        let handshake_completed = client.base().handshake_completed;
        client.base_mut().remaining_streams = client.base().remaining_streams.saturating_sub(1);

        let from = client.base().state.list_kind();
        if client.base().remaining_streams == 0 {
            self.move_client(id, from, ClientState::Draining);
        } else if capacity == 1 {
            self.move_client(id, from, ClientState::Busy);
        }

        self.connecting_and_connected_stream_capacity -= 1;
        if !handshake_completed {
            self.connecting_stream_capacity = self.connecting_stream_capacity.saturating_sub(1);
        }
        self.num_active_streams += 1;
        self.resource_manager().requests().inc();

        event::stream_checked_out(&self.host_id, id_as_u64(id));
        if let Some(client) = self.clients.get_mut(id) {
            self.ops.on_pool_ready(client, context);
        }
    }

    /// `on_connection_event`, §4.5.4.
    pub fn on_connection_event(&mut self, id: ClientId<Ops>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected(id),
            ConnectionEvent::ConnectedZeroRtt => self.on_connected_zero_rtt(id),
            ConnectionEvent::LocalClose => self.on_close(id, PoolFailureReason::LocalConnectionFailure),
            ConnectionEvent::RemoteClose => self.on_close(id, PoolFailureReason::RemoteConnectionFailure),
        }
    }

    fn on_connected(&mut self, id: ClientId<Ops>) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let from = client.base().state.list_kind();
        let num_active = client.num_active_streams();
        let capacity = client.base().current_unused_capacity(num_active);
        self.connecting_and_connected_stream_capacity -= capacity as i64;
        // Handshake is complete: this client's capacity no longer counts toward
        // connecting_stream_capacity, which tracks handshake-incomplete clients only.
        self.connecting_stream_capacity = self.connecting_stream_capacity.saturating_sub(capacity);
        self.clients.get_mut(id).unwrap().base_mut().handshake_completed = true;

        let next_state = if capacity > 0 {
            ClientState::Ready
        } else {
            ClientState::Busy
        };
        self.move_client(id, from, next_state);

        if let Some(client) = self.clients.get_mut(id) {
            self.ops.on_connected(client);
        }
        if next_state == ClientState::Ready {
            self.on_upstream_ready();
        }

        if !self.became_ready {
            self.became_ready = true;
            event::pool_ready(&self.host_id);
        }
        event::connection_ready(&self.host_id, id_as_u64(id));
    }

    fn on_connected_zero_rtt(&mut self, id: ClientId<Ops>) {
        let Some(client) = self.clients.get(id) else {
            return;
        };
        if client.base().state != ClientState::Connecting {
            return;
        }
        if !client.supports_early_data() {
            // Transitioning to ReadyForEarlyData when the client does not support it is
            // rejected: state is left unchanged.
            event::early_data_rejected(&self.host_id);
            return;
        }
        let from = client.base().state.list_kind();
        let num_active = client.num_active_streams();
        let capacity = client.base().current_unused_capacity(num_active);
        let next_state = if capacity > 0 {
            ClientState::ReadyForEarlyData
        } else {
            ClientState::Busy
        };
        self.move_client(id, from, next_state);
        if next_state == ClientState::ReadyForEarlyData {
            self.on_upstream_ready_for_early_data(id);
        }
    }

    fn on_close(&mut self, id: ClientId<Ops>, reason: PoolFailureReason) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let from = client.base().state.list_kind();
        let num_active = client.num_active_streams();
        let capacity = client.base().current_unused_capacity(num_active);
        self.connecting_and_connected_stream_capacity -= capacity as i64;
        let already_completed = client.base().handshake_completed;
        if !already_completed {
            // Only clients whose handshake never completed are part of connecting_stream_capacity.
            self.connecting_stream_capacity = self.connecting_stream_capacity.saturating_sub(capacity);
            client.base_mut().handshake_completed = true;
        }

        if let Some(client) = self.clients.get_mut(id) {
            self.ops.on_connect_failed(client);
        }

        // Purge every pending stream, oldest first, as if this were the only client available.
        let purge: Vec<_> = self.pending_streams.drain(..).collect();
        let host_description = self
            .clients
            .get(id)
            .map(|c| c.base().real_host_description.clone())
            .unwrap_or_else(|| self.host_description.clone());
        for pending in purge {
            self.resource_manager().pending_requests().dec();
            event::stream_checkout_failed(&self.host_id, reason);
            self.ops
                .on_pool_failure(host_description.clone(), reason, pending.context);
        }

        if let Some(client) = self.clients.get_mut(id) {
            client.release_resources();
            client.base_mut().state = ClientState::Closed;
        }
        if let Some(from) = from {
            self.list_mut(from).retain(|&x| x != id);
        }
        if let Some(client) = self.clients.remove(id) {
            self.dispatcher.deferred_delete(Box::new(client));
        }
        event::connection_closed(&self.host_id, id_as_u64(id), close_event_reason(reason));

        self.check_idle_and_notify();

        if !self.pending_streams.is_empty() {
            self.try_create_new_connections();
        }
    }

    /// `on_connect_timeout`: marks the client timed out and closes it, purging its pending streams
    /// as if it were a `RemoteClose`.
    pub fn on_connect_timeout(&mut self, id: ClientId<Ops>) {
        if let Some(client) = self.clients.get_mut(id) {
            client.base_mut().timed_out = true;
        }
        self.on_close(id, PoolFailureReason::RemoteConnectionFailure);
    }

    /// `on_connection_duration_timeout`: a no-op unless the client's handshake has completed and it
    /// is not already `Closed` or `Draining`, in which case it transitions to `Draining`.
    pub fn on_connection_duration_timeout(&mut self, id: ClientId<Ops>) {
        let Some(client) = self.clients.get(id) else {
            return;
        };
        if !client.base().handshake_completed
            || matches!(client.base().state, ClientState::Closed | ClientState::Draining)
        {
            return;
        }
        self.transition_to_draining(id);
    }

    /// `on_stream_closed(client, delay_attaching)`, §4.5.5.
    pub fn on_stream_closed(&mut self, id: ClientId<Ops>, delay_attaching: bool) {
        self.num_active_streams = self.num_active_streams.saturating_sub(1);
        self.resource_manager().requests().dec();

        let Some(client) = self.clients.get(id) else {
            return;
        };
        let state = client.base().state;
        let num_active = client.num_active_streams();
        let capacity = client.base().current_unused_capacity(num_active);

        if state == ClientState::Draining && num_active == 0 {
            self.close_client(id);
            return;
        }
        if state == ClientState::Busy && capacity > 0 {
            let from = Some(ClientListKind::BusyOrDraining);
            let handshake_completed = client.base().handshake_completed;
            // The client regained capacity: restore it to the aggregate counters it was debited
            // from at attach time.
            self.connecting_and_connected_stream_capacity += capacity as i64;
            if !handshake_completed {
                self.connecting_stream_capacity += capacity;
                self.move_client(id, from, ClientState::ReadyForEarlyData);
                if !delay_attaching {
                    self.on_upstream_ready_for_early_data(id);
                }
            } else {
                self.move_client(id, from, ClientState::Ready);
                if !delay_attaching {
                    self.on_upstream_ready();
                }
            }
        }
    }

    /// `on_upstream_ready`, §4.5.6.
    pub fn on_upstream_ready(&mut self) {
        loop {
            if self.pending_streams.is_empty() || self.ready.is_empty() {
                break;
            }
            let id = self.ready[0];
            let Some(pending) = self.pending_streams.pop_front() else {
                break;
            };
            self.resource_manager().pending_requests().dec();
            self.attach_stream_to_client(id, pending.context);
        }
        if !self.pending_streams.is_empty() {
            self.try_create_new_connections();
        }
    }

    /// `on_upstream_ready_for_early_data(client)`, §4.5.6.
    pub fn on_upstream_ready_for_early_data(&mut self, id: ClientId<Ops>) {
        loop {
            let Some(client) = self.clients.get(id) else { break };
            let num_active = client.num_active_streams();
            if client.base().current_unused_capacity(num_active) == 0 {
                break;
            }
            // Oldest-first: enqueue appends, so the oldest eligible entry is the lowest index.
            let position = self
                .pending_streams
                .iter()
                .position(|p| p.can_send_early_data);
            let Some(position) = position else { break };
            let pending = self.pending_streams.remove(position).unwrap();
            self.resource_manager().pending_requests().dec();
            self.attach_stream_to_client(id, pending.context);
        }
    }

    /// Schedules `on_upstream_ready` to run via the dispatcher rather than reentrantly.
    pub fn schedule_on_upstream_ready(&self) {
        if let Some(cb) = &self.upstream_ready_cb {
            cb.schedule();
        }
    }

    fn close_client(&mut self, id: ClientId<Ops>) {
        let Some(client) = self.clients.get(id) else {
            return;
        };
        let from = client.base().state.list_kind();
        let num_active = client.num_active_streams();
        let capacity = client.base().current_unused_capacity(num_active);
        self.connecting_and_connected_stream_capacity -= capacity as i64;
        if !client.base().handshake_completed {
            self.connecting_stream_capacity = self.connecting_stream_capacity.saturating_sub(capacity);
        }

        if let Some(client) = self.clients.get_mut(id) {
            client.release_resources();
            client.base_mut().state = ClientState::Closed;
        }
        if let Some(from) = from {
            self.list_mut(from).retain(|&x| x != id);
        }
        if let Some(client) = self.clients.remove(id) {
            self.dispatcher.deferred_delete(Box::new(client));
        }
        event::connection_closed(
            &self.host_id,
            id_as_u64(id),
            crate::event::ConnectionClosedReason::PoolClosed,
        );
        self.check_idle_and_notify();
    }

    /// Cancels a pending stream. The handle only records the cancellation; this walks the queue
    /// to actually remove it and, for [`CancelPolicy::CloseExcess`], closes one excess
    /// connecting/early-data client per §4.4.
    pub fn cancel(&mut self, handle: &CancelHandle, policy: CancelPolicy) {
        handle.cancel();
        let before = self.pending_streams.len();
        self.pending_streams.retain(|p| !p.is_cancelled());
        let removed = before - self.pending_streams.len();
        if removed == 0 {
            return;
        }
        for _ in 0..removed {
            self.resource_manager().pending_requests().dec();
        }

        if policy == CancelPolicy::CloseExcess {
            self.close_one_excess_client();
        }
    }

    fn close_one_excess_client(&mut self) {
        let ratio = self.host_description.cluster().per_upstream_preconnect_ratio();
        let pending = self.pending_streams.len() as f32;
        let active = self.num_active_streams as f32;
        let capacity = self.connecting_stream_capacity as f32;

        let candidate = self
            .connecting
            .iter()
            .chain(self.early_data.iter())
            .find(|&&id| {
                let Some(client) = self.clients.get(id) else {
                    return false;
                };
                let num_active = client.num_active_streams();
                let unused = client.base().current_unused_capacity(num_active) as f32;
                (pending + active) * ratio <= capacity - unused + active
            })
            .copied();

        if let Some(id) = candidate {
            self.close_client(id);
        }
    }

    /// `drain_connections(behavior)`, §4.5.7.
    pub fn drain_connections(&mut self, behavior: DrainBehavior) {
        match behavior {
            DrainBehavior::DrainAndDelete => {
                self.is_draining_for_deletion = true;
                self.idle_close_sweep();
            }
            DrainBehavior::DrainExistingConnections => {
                self.idle_close_sweep();
                if self.pending_streams.is_empty() {
                    for id in self.early_data.clone() {
                        self.transition_to_draining(id);
                    }
                }
                for id in self.ready.clone() {
                    self.transition_to_draining(id);
                }
                for id in self.busy_or_draining.clone() {
                    if self.clients.get(id).map(|c| c.base().state) == Some(ClientState::Busy) {
                        self.transition_to_draining(id);
                    }
                }
            }
        }
        event::pool_cleared(&self.host_id);
    }

    fn transition_to_draining(&mut self, id: ClientId<Ops>) {
        let Some(client) = self.clients.get(id) else {
            return;
        };
        let from = client.base().state.list_kind();
        let num_active = client.num_active_streams();
        let capacity = client.base().current_unused_capacity(num_active);
        self.connecting_and_connected_stream_capacity -= capacity as i64;
        if !client.base().handshake_completed {
            self.connecting_stream_capacity = self.connecting_stream_capacity.saturating_sub(capacity);
        }
        if let Some(client) = self.clients.get_mut(id) {
            client.base_mut().remaining_streams = 0;
        }
        self.move_client(id, from, ClientState::Draining);
    }

    /// Collects ready clients (and, absent pending demand, connecting/early-data clients too) with
    /// zero active streams and closes them. Exposed beyond this module because the HTTP/1
    /// specialization runs it directly after every completed response, not just from
    /// `drain_connections`; see §4.6.
    pub(crate) fn idle_close_sweep(&mut self) {
        let mut to_close: Vec<ClientId<Ops>> = self
            .ready
            .iter()
            .copied()
            .filter(|&id| self.clients.get(id).map(|c| c.num_active_streams()) == Some(0))
            .collect();
        if self.pending_streams.is_empty() {
            to_close.extend(self.connecting.iter().copied());
            to_close.extend(
                self.early_data
                    .iter()
                    .copied()
                    .filter(|&id| self.clients.get(id).map(|c| c.num_active_streams()) == Some(0)),
            );
        }
        for id in to_close {
            self.close_client(id);
        }
    }

    fn check_idle_and_notify(&mut self) {
        if self.is_idle() {
            for cb in self.idle_callbacks.drain(..) {
                cb();
            }
        }
    }

    pub fn is_draining_for_deletion(&self) -> bool {
        self.is_draining_for_deletion
    }

    /// `maybe_preconnect(ratio)`: attempts one preconnect and reports whether it created a
    /// connection, for routers that drive preconnect on a timer rather than per-request.
    pub fn maybe_preconnect(&mut self, ratio: f32) -> bool {
        matches!(
            self.try_create_new_connection(ratio),
            ConnectAttempt::CreatedNewConnection | ConnectAttempt::CreatedButRateLimited
        )
    }

    pub fn is_idle(&self) -> bool {
        self.connecting.is_empty()
            && self.early_data.is_empty()
            && self.ready.is_empty()
            && self.busy_or_draining.is_empty()
            && self.pending_streams.is_empty()
    }

    pub fn add_idle_callback(&mut self, cb: Box<dyn FnOnce()>) {
        self.idle_callbacks.push(cb);
    }

    /// `destruct_all_connections()`, §4.5.7.
    pub fn destruct_all_connections(&mut self) {
        let all: Vec<ClientId<Ops>> = self
            .connecting
            .iter()
            .chain(self.early_data.iter())
            .chain(self.ready.iter())
            .chain(self.busy_or_draining.iter())
            .copied()
            .collect();
        for id in all {
            self.close_client(id);
        }
        self.dispatcher.clear_deferred_delete_list();
        event::pool_closed(&self.host_id);
    }
}

/// `drain_connections` behavior, §4.5.7.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrainBehavior {
    DrainAndDelete,
    DrainExistingConnections,
}

fn close_event_reason(reason: PoolFailureReason) -> crate::event::ConnectionClosedReason {
    match reason {
        PoolFailureReason::RemoteConnectionFailure => crate::event::ConnectionClosedReason::RemoteClose,
        _ => crate::event::ConnectionClosedReason::Error,
    }
}

fn id_as_u64<T>(id: Id<T>) -> u64 {
    id.raw()
}

/// A connection-event sink bound to one client inside a pool. Registered via
/// `ClientConnection::add_connection_callbacks` when a client is instantiated; resolves its
/// `(pool, id)` pair lazily so a client removed before the event fires is simply dropped.
pub struct ConnectionEventSink<Ops: ActiveClientOps + 'static> {
    pool: Weak<RefCell<PoolCore<Ops>>>,
    id: ClientId<Ops>,
}

impl<Ops: ActiveClientOps + 'static> ConnectionEventSink<Ops> {
    pub fn new(pool: Weak<RefCell<PoolCore<Ops>>>, id: ClientId<Ops>) -> Self {
        Self { pool, id }
    }
}

impl<Ops: ActiveClientOps + 'static> ConnectionCallbacks for ConnectionEventSink<Ops> {
    fn on_event(&mut self, event: ConnectionEvent) {
        if let Some(pool) = self.pool.upgrade() {
            pool.borrow_mut().on_connection_event(self.id, event);
        }
    }
}

/// Constructs a new [`PoolCore`] wrapped for shared, back-referenced ownership, matching how
/// connection-event sinks resolve `(Weak<RefCell<PoolCore<Ops>>>, ClientId)`.
pub fn new_pool<Ops: ActiveClientOps + 'static>(
    ops: Ops,
    host: Arc<dyn Host>,
    host_description: Arc<dyn HostDescription>,
    host_id: HostId,
    priority: Priority,
    dispatcher: Rc<dyn Dispatcher>,
    options: ConnectionPoolOptions,
) -> Rc<RefCell<PoolCore<Ops>>> {
    let core = PoolCore {
        ops,
        host,
        host_description: host_description.clone(),
        host_id,
        priority,
        dispatcher,
        options,
        self_weak: Weak::new(),
        clients: Arena::new(),
        connecting: Vec::new(),
        early_data: Vec::new(),
        ready: Vec::new(),
        busy_or_draining: Vec::new(),
        pending_streams: VecDeque::new(),
        idle_callbacks: Vec::new(),
        upstream_ready_cb: None,
        connecting_and_connected_stream_capacity: 0,
        connecting_stream_capacity: 0,
        num_active_streams: 0,
        is_draining_for_deletion: false,
        became_ready: false,
    };
    let rc = Rc::new(RefCell::new(core));
    let weak = Rc::downgrade(&rc);
    rc.borrow_mut().self_weak = weak.clone();
    let dispatcher = rc.borrow().dispatcher.clone();
    let cb = dispatcher.create_schedulable_callback(Box::new(move || {
        if let Some(pool) = weak.upgrade() {
            pool.borrow_mut().on_upstream_ready();
        }
    }));
    rc.borrow_mut().upstream_ready_cb = Some(cb);
    event::pool_created(&rc.borrow().host_id.clone());
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::dispatcher::LocalDispatcher;
    use crate::host::ClusterInfo;
    use crate::transport::{ClientConnection, CloseType, ConnectionState, ReadFilter};

    #[derive(Debug)]
    struct TestCluster {
        resource_manager: Arc<ResourceManager>,
        preconnect_ratio: f32,
    }

    impl ClusterInfo for TestCluster {
        fn max_requests_per_connection(&self) -> u64 {
            0
        }

        fn per_upstream_preconnect_ratio(&self) -> f32 {
            self.preconnect_ratio
        }

        fn resource_manager(&self, _priority: Priority) -> Arc<ResourceManager> {
            self.resource_manager.clone()
        }
    }

    #[derive(Debug)]
    struct TestHostDescription {
        cluster: TestCluster,
        address: String,
    }

    impl HostDescription for TestHostDescription {
        fn cluster(&self) -> &dyn ClusterInfo {
            &self.cluster
        }

        fn address(&self) -> &str {
            &self.address
        }
    }

    #[derive(Debug)]
    struct TestConnection;

    impl ClientConnection for TestConnection {
        fn state(&self) -> ConnectionState {
            ConnectionState::Open
        }

        fn read_disable(&mut self, _disable: bool) -> Result<()> {
            Ok(())
        }

        fn no_delay(&mut self, _enable: bool) {}

        fn close(&mut self, _close_type: CloseType) {}

        fn write(&mut self, _data: bytes::Bytes, _end_stream: bool) -> Result<()> {
            Ok(())
        }

        fn add_connection_callbacks(&mut self, _callbacks: Box<dyn ConnectionCallbacks>) {}

        fn add_read_filter(&mut self, _filter: Box<dyn ReadFilter>) {}

        fn set_requested_server_name(&mut self, _name: &str) {}
    }

    #[derive(Debug)]
    struct TestHost {
        host_description: Arc<dyn HostDescription>,
    }

    impl Host for TestHost {
        fn create_connection(
            &self,
            _dispatcher: &dyn Dispatcher,
        ) -> Result<(Box<dyn ClientConnection>, Arc<dyn HostDescription>)> {
            Ok((Box::new(TestConnection), self.host_description.clone()))
        }

        fn can_create_connection(&self, _priority: Priority) -> bool {
            true
        }
    }

    /// A generic fake client: wraps [`ActiveClientBase`] with one `active`-stream counter, enough
    /// to drive [`PoolCore`] end to end without any protocol-specific behavior.
    struct TestClient {
        base: ActiveClientBase,
        active: Cell<u32>,
    }

    impl ClientLifecycle for TestClient {
        fn base(&self) -> &ActiveClientBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ActiveClientBase {
            &mut self.base
        }

        fn supports_early_data(&self) -> bool {
            false
        }

        fn num_active_streams(&self) -> u32 {
            self.active.get()
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum TestEvent {
        PoolReady,
        PoolFailure(PoolFailureReason),
    }

    struct TestOps {
        log: Rc<RefCell<Vec<TestEvent>>>,
        concurrent_stream_limit: u32,
    }

    impl ActiveClientOps for TestOps {
        type Client = TestClient;
        type Context = ();

        fn instantiate_active_client(
            &mut self,
            host: &dyn Host,
            dispatcher: &Rc<dyn Dispatcher>,
        ) -> Result<(Self::Client, Arc<dyn HostDescription>)> {
            let (connection, host_description) = host.create_connection(dispatcher.as_ref())?;
            let base = ActiveClientBase::new(
                host_description.clone(),
                connection,
                0,
                self.concurrent_stream_limit,
            );
            Ok((
                TestClient {
                    base,
                    active: Cell::new(0),
                },
                host_description,
            ))
        }

        fn on_pool_ready(&mut self, client: &mut Self::Client, _context: Self::Context) {
            client.active.set(client.active.get() + 1);
            self.log.borrow_mut().push(TestEvent::PoolReady);
        }

        fn on_pool_failure(
            &mut self,
            _host_description: Arc<dyn HostDescription>,
            reason: PoolFailureReason,
            _context: Self::Context,
        ) {
            self.log.borrow_mut().push(TestEvent::PoolFailure(reason));
        }

        fn on_connected(&mut self, _client: &mut Self::Client) {}

        fn on_connect_failed(&mut self, _client: &mut Self::Client) {}
    }

    /// Builds a pool backed by the fake host/cluster above. `concurrent_stream_limit` is the
    /// per-connection stream cap each fake client is constructed with.
    fn build_pool(
        concurrent_stream_limit: u32,
        max_pending_requests: u64,
    ) -> (Rc<RefCell<PoolCore<TestOps>>>, Rc<RefCell<Vec<TestEvent>>>, Arc<ResourceManager>) {
        let resource_manager = Arc::new(ResourceManager::new(100, max_pending_requests, 100, 100, 100));
        let host_description: Arc<dyn HostDescription> = Arc::new(TestHostDescription {
            cluster: TestCluster {
                resource_manager: resource_manager.clone(),
                preconnect_ratio: 1.0,
            },
            address: "test-host:0".to_string(),
        });
        let host: Arc<dyn Host> = Arc::new(TestHost {
            host_description: host_description.clone(),
        });
        let dispatcher: Rc<dyn Dispatcher> = Rc::new(LocalDispatcher::new());
        let host_id = HostId {
            cluster: "test-cluster".to_string(),
            priority: Priority::Default,
        };
        let log = Rc::new(RefCell::new(Vec::new()));
        let ops = TestOps {
            log: log.clone(),
            concurrent_stream_limit,
        };
        let pool = new_pool(
            ops,
            host,
            host_description,
            host_id,
            Priority::Default,
            dispatcher,
            ConnectionPoolOptions::default(),
        );
        (pool, log, resource_manager)
    }

    /// S1: a single request against an empty pool creates a connecting client; firing `Connected`
    /// attaches the queued stream and moves that client to `Busy`. With `concurrent_stream_limit ==
    /// 1` the preconnect loop's anticipate term (§4.5.2) creates a second connecting client
    /// alongside the one that gets attached to, which is expected and left untouched here.
    #[test]
    fn s1_single_request_happy_path() {
        let (pool, log, resource_manager) = build_pool(1, 100);

        let handle = pool.borrow_mut().new_stream((), false);
        assert!(handle.is_some());
        assert_eq!(pool.borrow().pending_stream_count(), 1);
        assert!(!pool.borrow().list(ClientListKind::Connecting).is_empty());

        let id = pool.borrow().list(ClientListKind::Connecting)[0];
        pool.borrow_mut().on_connection_event(id, ConnectionEvent::Connected);

        assert_eq!(*log.borrow(), vec![TestEvent::PoolReady]);
        assert_eq!(pool.borrow().pending_stream_count(), 0);
        assert_eq!(resource_manager.pending_requests().count(), 0);
        assert_eq!(resource_manager.requests().count(), 1);
        assert!(pool.borrow().list(ClientListKind::BusyOrDraining).contains(&id));
    }

    /// S2: a request enqueued while `pending_requests` is already at capacity fails synchronously,
    /// without ever attempting a connection.
    #[test]
    fn s2_overflow_fails_synchronously_without_connecting() {
        let (pool, log, resource_manager) = build_pool(1, 0);

        let handle = pool.borrow_mut().new_stream((), false);
        assert!(handle.is_none());
        assert_eq!(*log.borrow(), vec![TestEvent::PoolFailure(PoolFailureReason::Overflow)]);
        assert!(pool.borrow().list(ClientListKind::Connecting).is_empty());
        assert_eq!(resource_manager.pending_requests().count(), 0);
    }

    /// S4: a connecting client that observes a remote close purges every pending stream queued
    /// behind it and leaves the pool idle. `concurrent_stream_limit == 2` keeps the preconnect
    /// loop's anticipate term from creating a second connecting client, so exactly one client is
    /// in play here.
    #[test]
    fn s4_remote_close_during_connecting_purges_pending_and_goes_idle() {
        let (pool, log, resource_manager) = build_pool(2, 100);

        let went_idle = Rc::new(Cell::new(false));
        let went_idle_clone = went_idle.clone();
        pool.borrow_mut()
            .add_idle_callback(Box::new(move || went_idle_clone.set(true)));

        pool.borrow_mut().new_stream((), false);
        assert_eq!(pool.borrow().list(ClientListKind::Connecting).len(), 1);
        let id = pool.borrow().list(ClientListKind::Connecting)[0];

        pool.borrow_mut().on_connection_event(id, ConnectionEvent::RemoteClose);

        assert_eq!(
            *log.borrow(),
            vec![TestEvent::PoolFailure(PoolFailureReason::RemoteConnectionFailure)]
        );
        assert!(pool.borrow().list(ClientListKind::Connecting).is_empty());
        assert_eq!(pool.borrow().pending_stream_count(), 0);
        assert_eq!(resource_manager.pending_requests().count(), 0);
        assert!(pool.borrow().is_idle());
        assert!(went_idle.get());
    }
}
