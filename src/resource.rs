//! Counted, capped resource limits shared across clients and pools at the same
//! (cluster, priority) scope.

use std::sync::atomic::{AtomicU64, Ordering};

/// A counted, capped counter. Semantics are plain arithmetic with no compare-and-swap
/// arbitration: callers at the same scope may transiently push `current` above `max`, and this
/// type does not try to prevent that. It only answers "do we still have room" and tracks the
/// count.
///
/// Uses atomics rather than requiring `&mut self` because a [`ResourceManager`] is shared (via
/// `Arc`) across every pool at the same cluster/priority scope: each pool is single-threaded
/// internally, but distinct pools at the same scope may live on distinct dispatcher threads, so
/// the counter itself must be `Sync`. Ordering is `Relaxed` throughout; nothing here establishes
/// happens-before relationships with other memory, it is purely an admission-control tally.
#[derive(Debug, Default)]
pub struct ResourceLimit {
    current: AtomicU64,
    max: AtomicU64,
}

impl ResourceLimit {
    /// Creates a new limit with the given cap.
    pub fn new(max: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            max: AtomicU64::new(max),
        }
    }

    /// Whether another unit can be allocated without exceeding `max`.
    pub fn can_create(&self) -> bool {
        self.current.load(Ordering::Relaxed) < self.max.load(Ordering::Relaxed)
    }

    /// The configured cap.
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// The current count.
    pub fn count(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Replaces the cap. Does not retroactively validate `current` against the new cap.
    pub fn set_max(&self, max: u64) {
        self.max.store(max, Ordering::Relaxed);
    }

    /// Increments the count by one.
    pub fn inc(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the count by one. See [`Self::dec_by`].
    pub fn dec(&self) {
        self.dec_by(1);
    }

    /// Decrements the count by `n`. `n` exceeding the current count is a programming error: the
    /// caller released more units than it ever acquired.
    pub fn dec_by(&self, n: u64) {
        let previous = self.current.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(n))
        });
        let previous = previous.expect("update closure always returns Some");
        debug_assert!(n <= previous, "dec_by({n}) exceeds current count {previous}");
    }
}

/// Four [`ResourceLimit`]s bundled under one cluster/priority scope, plus the scalar cap on
/// connections per host.
///
/// This is a plain bundle: no behavior beyond exposing its members by name, matching a named
/// group of runtime-overridable limits rather than a single struct field.
#[derive(Debug)]
pub struct ResourceManager {
    connections: ResourceLimit,
    pending_requests: ResourceLimit,
    requests: ResourceLimit,
    connection_pools: ResourceLimit,
    max_connections_per_host: u64,
}

impl ResourceManager {
    /// Creates a new manager with the given caps.
    pub fn new(
        max_connections: u64,
        max_pending_requests: u64,
        max_requests: u64,
        max_connection_pools: u64,
        max_connections_per_host: u64,
    ) -> Self {
        Self {
            connections: ResourceLimit::new(max_connections),
            pending_requests: ResourceLimit::new(max_pending_requests),
            requests: ResourceLimit::new(max_requests),
            connection_pools: ResourceLimit::new(max_connection_pools),
            max_connections_per_host,
        }
    }

    pub fn connections(&self) -> &ResourceLimit {
        &self.connections
    }

    pub fn pending_requests(&self) -> &ResourceLimit {
        &self.pending_requests
    }

    pub fn requests(&self) -> &ResourceLimit {
        &self.requests
    }

    pub fn connection_pools(&self) -> &ResourceLimit {
        &self.connection_pools
    }

    pub fn max_connections_per_host(&self) -> u64 {
        self.max_connections_per_host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn can_create_reflects_current_vs_max() {
        let limit = ResourceLimit::new(2);
        assert!(limit.can_create());
        limit.inc();
        assert!(limit.can_create());
        limit.inc();
        assert!(!limit.can_create());
    }

    #[test]
    fn dec_by_saturates_and_tracks_count() {
        let limit = ResourceLimit::new(5);
        limit.inc();
        limit.inc();
        limit.dec_by(2);
        assert_eq!(limit.count(), 0);
    }

    #[test]
    fn transient_overshoot_is_tolerated() {
        let limit = ResourceLimit::new(1);
        limit.inc();
        limit.inc();
        assert_eq!(limit.count(), 2);
        assert!(!limit.can_create());
    }

    #[test]
    fn shared_via_arc_mutates_through_shared_reference() {
        use std::sync::Arc;
        let manager = Arc::new(ResourceManager::new(10, 10, 10, 10, 10));
        let other = manager.clone();
        manager.requests().inc();
        assert_eq!(other.requests().count(), 1);
    }

    #[test]
    fn shared_across_threads() {
        use std::sync::Arc;
        use std::thread;

        let manager = Arc::new(ResourceManager::new(1_000, 0, 0, 0, 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        manager.connections().inc();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.connections().count(), 800);
    }
}
