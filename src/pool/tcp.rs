//! TCP specialization: a raw bidirectional tunnel with CONNECT-style downstream synthesis and
//! upstream half-close handling.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::Bytes;

use crate::dispatcher::Dispatcher;
use crate::error::{PoolFailureReason, Result};
use crate::host::{Host, HostDescription, HostId, Priority};
use crate::options::ConnectionPoolOptions;
use crate::transport::{CloseType, ReadFilter};

use super::client::{ActiveClientBase, ClientListKind, ClientState};
use super::core::{ActiveClientOps, ClientId, ClientLifecycle, DrainBehavior, PoolCore};
use super::pending::CancelHandle;
use super::{ConnectionPool, TcpConnectionPool};

/// The downstream-facing half of a TCP tunnel, handed to the caller's [`TcpUpstreamCallbacks`]
/// once the tunnel is ready. Dropping it clears the client's callbacks, matching the
/// `TcpConnectionData` destructor semantics.
pub trait TcpUpstream {
    /// A CONNECT-style `encode_headers`: synthesizes a `:status: 200` response downstream and
    /// writes nothing to the upstream connection.
    fn encode_headers(&mut self) -> http::HeaderMap;

    /// Writes raw bytes to the upstream connection.
    fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<()>;

    /// Closes the upstream connection with [`CloseType::NoFlush`].
    fn reset_stream(&mut self);
}

/// Receives the outcome of a [`TcpConnectionPool::new_connection`] call and the upstream data
/// that follows.
pub trait TcpUpstreamCallbacks {
    /// The tunnel is established.
    fn on_pool_ready(&mut self, upstream: Box<dyn TcpUpstream>, host_description: Arc<dyn HostDescription>);

    /// The tunnel could not be established.
    fn on_pool_failure(&mut self, reason: PoolFailureReason, host_description: Arc<dyn HostDescription>);

    /// Data arrived from the upstream connection.
    fn on_upstream_data(&mut self, data: Bytes, end_stream: bool);

    /// Whether the downstream side of the tunnel has already observed its own `end_stream`.
    /// Consulted on an upstream half-close to decide whether to force a full reset.
    fn downstream_complete(&self) -> bool;

    /// The upstream half-closed before downstream did, and `force_reset_on_upstream_half_close`
    /// is set: the downstream stream should be reset with reason `ConnectionTermination`, detail
    /// `half_close_initiated_full_close`.
    fn on_upstream_half_close_reset(&mut self);
}

struct TcpUpstreamHandle {
    pool: Weak<RefCell<PoolCore<TcpOps>>>,
    id: ClientId<TcpOps>,
}

/// The downstream header map synthesized once a tunnel is ready, standing in for the CONNECT
/// response a real proxy would otherwise have to hand-assemble per call site.
fn tunnel_ready_headers() -> http::HeaderMap {
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::HeaderName::from_static("x-tunnel-status"),
        http::HeaderValue::from_static("200"),
    );
    headers
}

impl TcpUpstream for TcpUpstreamHandle {
    fn encode_headers(&mut self) -> http::HeaderMap {
        tunnel_ready_headers()
    }

    fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<()> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        let mut pool = pool.borrow_mut();
        let Some(client) = pool.client_mut(self.id) else {
            return Ok(());
        };
        client.base_mut().connection.write(data, end_stream)
    }

    fn reset_stream(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut pool = pool.borrow_mut();
        if let Some(client) = pool.client_mut(self.id) {
            client.base_mut().connection.close(CloseType::NoFlush);
        }
    }
}

impl Drop for TcpUpstreamHandle {
    /// `clear_callbacks`, §4.7: if the client is `Busy` and pending streams exist, schedule
    /// `on_upstream_ready`; null the callbacks; run the idle-close sweep.
    fn drop(&mut self) {
        let Some(pool_rc) = self.pool.upgrade() else {
            return;
        };
        let mut pool = pool_rc.borrow_mut();
        let was_busy = pool
            .client(self.id)
            .map(|c| c.base().state == ClientState::Busy)
            .unwrap_or(false);
        if let Some(client) = pool.client_mut(self.id) {
            client.callbacks = None;
        }
        if was_busy && pool.pending_stream_count() > 0 {
            pool.schedule_on_upstream_ready();
        }
        pool.idle_close_sweep();
    }
}

/// A raw TCP upstream connection: at most one tunnel attached at a time.
pub struct TcpClient {
    base: ActiveClientBase,
    dispatcher: Rc<dyn Dispatcher>,
    callbacks: Option<Box<dyn TcpUpstreamCallbacks>>,
    self_pool: Weak<RefCell<PoolCore<TcpOps>>>,
    self_id: Option<ClientId<TcpOps>>,
}

impl ClientLifecycle for TcpClient {
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
        if self.callbacks.is_some() {
            1
        } else {
            0
        }
    }

    fn release_resources(&mut self) {
        if self.base.release_resources_once() {
            self.base.connection.close(CloseType::NoFlush);
            if let Some(callbacks) = self.callbacks.take() {
                self.dispatcher.deferred_delete(Box::new(CallbacksDropBox(callbacks)));
            }
        }
    }
}

/// Lets a boxed [`TcpUpstreamCallbacks`] be deferred-deleted alongside everything else the
/// dispatcher defers, matching how [`super::http1::Http1Client`] defers its stream wrapper.
struct CallbacksDropBox(Box<dyn TcpUpstreamCallbacks>);

/// Whether an upstream `end_stream` should force a downstream reset rather than a clean
/// half-close: only when downstream hasn't already finished its own side and the policy is
/// enabled. See §4.7 "TCP upstream (the half-close tunnel)".
fn should_force_reset(end_stream: bool, downstream_complete: bool, force_reset_on_upstream_half_close: bool) -> bool {
    end_stream && !downstream_complete && force_reset_on_upstream_half_close
}

/// Forwards raw upstream reads to [`TcpUpstreamCallbacks::on_upstream_data`], applying the
/// force-reset-on-half-close policy. See §4.7 "TCP upstream (the half-close tunnel)".
struct TcpReadFilter {
    pool: Weak<RefCell<PoolCore<TcpOps>>>,
    id: ClientId<TcpOps>,
    force_reset_on_upstream_half_close: bool,
}

impl ReadFilter for TcpReadFilter {
    fn on_data(&mut self, data: Bytes, end_stream: bool) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut pool = pool.borrow_mut();
        let Some(client) = pool.client_mut(self.id) else {
            return;
        };
        let Some(callbacks) = client.callbacks.as_deref_mut() else {
            drop(pool);
            if let Some(pool) = self.pool.upgrade() {
                if let Some(client) = pool.borrow_mut().client_mut(self.id) {
                    client.base_mut().connection.close(CloseType::NoFlush);
                }
            }
            return;
        };
        let downstream_complete = callbacks.downstream_complete();
        callbacks.on_upstream_data(data, end_stream);
        if should_force_reset(end_stream, downstream_complete, self.force_reset_on_upstream_half_close) {
            if let Some(callbacks) = client.callbacks.as_deref_mut() {
                callbacks.on_upstream_half_close_reset();
            }
        }
    }
}

/// Binds the upstream-connection factory to [`PoolCore`] via [`ActiveClientOps`].
pub struct TcpOps {
    force_reset_on_upstream_half_close: bool,
}

impl TcpOps {
    pub fn new(force_reset_on_upstream_half_close: bool) -> Self {
        Self {
            force_reset_on_upstream_half_close,
        }
    }
}

impl ActiveClientOps for TcpOps {
    type Client = TcpClient;
    type Context = Box<dyn TcpUpstreamCallbacks>;

    fn instantiate_active_client(
        &mut self,
        host: &dyn Host,
        dispatcher: &Rc<dyn Dispatcher>,
    ) -> Result<(Self::Client, Arc<dyn HostDescription>)> {
        let (connection, host_description) = host.create_connection(dispatcher.as_ref())?;
        let base = ActiveClientBase::new(host_description.clone(), connection, 0, 1);
        Ok((
            TcpClient {
                base,
                dispatcher: dispatcher.clone(),
                callbacks: None,
                self_pool: Weak::new(),
                self_id: None,
            },
            host_description,
        ))
    }

    fn on_pool_ready(&mut self, client: &mut Self::Client, mut context: Self::Context) {
        let id = client.self_id.expect("client has an id by the time a stream attaches");
        client.base_mut().connection.read_disable(false).ok();
        let handle = TcpUpstreamHandle {
            pool: client.self_pool.clone(),
            id,
        };
        context.on_pool_ready(Box::new(handle), client.base.real_host_description.clone());
        client.callbacks = Some(context);
    }

    fn on_pool_failure(
        &mut self,
        host_description: Arc<dyn HostDescription>,
        reason: PoolFailureReason,
        mut context: Self::Context,
    ) {
        context.on_pool_failure(reason, host_description);
    }

    fn on_connected(&mut self, client: &mut Self::Client) {
        client.base_mut().connection.read_disable(true).ok();
    }

    fn on_connect_failed(&mut self, _client: &mut Self::Client) {}

    fn on_client_instantiated(
        &mut self,
        client: &mut Self::Client,
        pool: Weak<RefCell<PoolCore<Self>>>,
        id: ClientId<Self>,
    ) {
        client.self_pool = pool.clone();
        client.self_id = Some(id);
        client.base_mut().connection.add_read_filter(Box::new(TcpReadFilter {
            pool,
            id,
            force_reset_on_upstream_half_close: self.force_reset_on_upstream_half_close,
        }));
    }
}

/// Router-facing TCP pool: owns a [`PoolCore<TcpOps>`].
pub struct TcpPool {
    core: Rc<RefCell<PoolCore<TcpOps>>>,
}

impl TcpPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: Arc<dyn Host>,
        host_description: Arc<dyn HostDescription>,
        host_id: HostId,
        priority: Priority,
        dispatcher: Rc<dyn Dispatcher>,
        options: ConnectionPoolOptions,
    ) -> Self {
        let force_reset = options.force_reset_on_upstream_half_close;
        let core = super::core::new_pool(
            TcpOps::new(force_reset),
            host,
            host_description,
            host_id,
            priority,
            dispatcher,
            options,
        );
        Self { core }
    }
}

impl ConnectionPool for TcpPool {
    fn add_idle_callback(&self, cb: Box<dyn FnOnce()>) {
        self.core.borrow_mut().add_idle_callback(cb);
    }

    fn is_idle(&self) -> bool {
        self.core.borrow().is_idle()
    }

    fn drain_connections(&self, behavior: DrainBehavior) {
        self.core.borrow_mut().drain_connections(behavior);
    }

    fn host(&self) -> Arc<dyn HostDescription> {
        self.core.borrow().host_description().clone()
    }

    fn maybe_preconnect(&self, ratio: f32) -> bool {
        self.core.borrow_mut().maybe_preconnect(ratio)
    }
}

impl TcpConnectionPool for TcpPool {
    fn new_connection(&self, callbacks: Box<dyn TcpUpstreamCallbacks>) -> Option<CancelHandle> {
        // TCP has no early-data concept: `new_stream`'s second argument is always `false`.
        self.core.borrow_mut().new_stream(callbacks, false)
    }

    fn close_connections(&self) {
        let ids: Vec<_> = {
            let core = self.core.borrow();
            core.list(ClientListKind::Connecting)
                .iter()
                .chain(core.list(ClientListKind::EarlyData).iter())
                .chain(core.list(ClientListKind::Ready).iter())
                .chain(core.list(ClientListKind::BusyOrDraining).iter())
                .copied()
                .collect()
        };
        for id in ids {
            self.core.borrow_mut().on_connect_timeout(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_ready_headers_synthesizes_status() {
        let headers = tunnel_ready_headers();
        assert_eq!(headers.get("x-tunnel-status").unwrap(), "200");
    }

    #[test]
    fn half_close_with_complete_downstream_does_not_force_reset() {
        assert!(!should_force_reset(true, true, true));
    }

    #[test]
    fn half_close_with_incomplete_downstream_forces_reset_when_enabled() {
        assert!(should_force_reset(true, false, true));
    }

    #[test]
    fn half_close_does_not_force_reset_when_policy_disabled() {
        assert!(!should_force_reset(true, false, false));
    }

    #[test]
    fn non_final_data_never_forces_reset() {
        assert!(!should_force_reset(false, false, true));
    }
}
