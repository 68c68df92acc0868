//! Boundary contracts consumed from the cluster/host layer.
//!
//! Everything in this module is implemented by the embedding router, not by this crate; the pool
//! only calls through these traits. Concrete cluster configuration, address resolution, and
//! load-balancer selection all live on the other side of this boundary.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::resource::ResourceManager;
use crate::transport::ClientConnection;

/// Request priority, mirrored from the embedding router's routing tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Priority {
    Default,
    High,
}

/// A cheap, loggable identifier for a (cluster, priority) pool scope. Used only for events; it is
/// not part of the pool's addressing.
#[derive(Clone, Debug)]
pub struct HostId {
    pub cluster: String,
    pub priority: Priority,
}

/// Static description of the host a pool is bound to.
///
/// `cluster().resource_manager(priority)` must be stable for the host's lifetime: the pool caches
/// nothing about it beyond holding this description, so a `ClusterInfo` implementation that
/// returns a different `ResourceManager` on each call would silently fragment the cap accounting.
pub trait HostDescription: fmt::Debug + Send + Sync {
    /// The host's cluster.
    fn cluster(&self) -> &dyn ClusterInfo;

    /// The host's address, as a display string (`host:port` or similar). Opaque to the pool.
    fn address(&self) -> &str;
}

/// Per-cluster configuration consumed by the pool.
pub trait ClusterInfo: fmt::Debug + Send + Sync {
    /// Caps the number of requests (in the Envoy sense: attached streams) a single connection may
    /// serve over its lifetime. `0` means unlimited.
    fn max_requests_per_connection(&self) -> u64;

    /// The preconnect ratio used when `try_create_new_connection` is invoked with a zero ratio
    /// (i.e. not an explicit caller-supplied value).
    fn per_upstream_preconnect_ratio(&self) -> f32;

    /// The shared resource manager for this cluster at the given priority.
    fn resource_manager(&self, priority: Priority) -> Arc<ResourceManager>;
}

/// The host a pool connects to.
pub trait Host: fmt::Debug + Send + Sync {
    /// Creates an unconnected transport-backed connection bound to the given dispatcher.
    ///
    /// Returns the connection handle plus the description of the specific host instance that was
    /// selected (load-balancer output), which may differ in address detail from the logical host
    /// this trait object represents.
    fn create_connection(
        &self,
        dispatcher: &dyn crate::dispatcher::Dispatcher,
    ) -> Result<(Box<dyn ClientConnection>, Arc<dyn HostDescription>)>;

    /// Soft admission check consulted before opening a new connection. When this returns `false`
    /// and the pool already has at least one client of any kind, the pool backs off; when it
    /// returns `false` and the pool is completely empty, the pool creates the connection anyway
    /// to avoid deadlocking on an empty pool that can never become non-empty.
    fn can_create_connection(&self, priority: Priority) -> bool;
}
