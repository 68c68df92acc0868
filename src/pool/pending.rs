//! A queued downstream request awaiting a client.

use std::cell::Cell;
use std::rc::Rc;

/// How a pending stream's cancellation should affect the rest of the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CancelPolicy {
    /// Simply dequeue the pending stream.
    Default,
    /// Dequeue the pending stream, then additionally close one excess connecting or
    /// early-data client, if one exists (see [`super::core::PoolCore::cancel`]).
    CloseExcess,
}

/// A downstream request that has not yet been attached to a client.
///
/// `context` is opaque to the pool core: HTTP carries `(response_decoder, pool_callbacks)`, TCP
/// carries `(tcp_pool_callbacks)`. It is handed back unchanged to `on_pool_ready` /
/// `on_pool_failure`.
pub struct PendingStream<Ctx> {
    pub context: Ctx,
    pub can_send_early_data: bool,
    cancelled: Rc<Cell<bool>>,
}

/// A handle a caller can use to cancel a [`PendingStream`] it no longer wants served, returned
/// from `new_stream`.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Rc<Cell<bool>>,
}

impl CancelHandle {
    /// Marks the owning pending stream cancelled. The pool observes this the next time it walks
    /// the pending-stream queue and removes the entry with the policy supplied to
    /// [`super::core::PoolCore::cancel`]; calling this alone does not immediately run the
    /// excess-client-close side effect of [`CancelPolicy::CloseExcess`].
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

impl<Ctx> PendingStream<Ctx> {
    pub fn new(context: Ctx, can_send_early_data: bool) -> (Self, CancelHandle) {
        let cancelled = Rc::new(Cell::new(false));
        (
            Self {
                context,
                can_send_early_data,
                cancelled: cancelled.clone(),
            },
            CancelHandle { cancelled },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Returns another handle that can cancel this same pending stream.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: self.cancelled.clone(),
        }
    }
}
