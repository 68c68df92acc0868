//! Boundary contract consumed from the embedding event loop.
//!
//! The pool is single-threaded and cooperative: every method on a pool's
//! [`crate::pool::core::PoolCore`] must be called from the same thread, and the pool never blocks
//! or awaits internally. The only
//! deferred mechanisms it needs from its host event loop are "run this once before you next block
//! on I/O" (a schedulable callback) and "destroy this object later, not while I'm still inside the
//! call that closed it" (deferred delete). Both are modeled as plain trait objects rather than
//! spawned tasks, because the pool must not be touched from a different task or thread than the
//! one driving it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A callback scheduled to run once, at the latest before the owning dispatcher returns control
/// to its event loop. Repeated calls coalesce: scheduling an already-pending callback is a no-op.
pub trait ScheduledCallback {
    /// Arranges for the callback to run on the next drain. Idempotent while already pending.
    fn schedule(&self);
}

/// The event-loop boundary the pool runs on top of.
pub trait Dispatcher {
    /// Wraps `callback` so it can be scheduled to run exactly once per `schedule()` call, at the
    /// latest before the dispatcher next returns to waiting on I/O. Used for `upstream_ready_cb`
    /// so a connection event handler can post `on_upstream_ready` without re-entering the pool
    /// from inside its own completion handler.
    fn create_schedulable_callback(&self, callback: Box<dyn Fn()>) -> Rc<dyn ScheduledCallback>;

    /// Hands ownership of `obj` to the dispatcher, to be dropped at the next
    /// [`Dispatcher::clear_deferred_delete_list`] call rather than inline. Used when closing a
    /// client: by the time `close` returns, nothing may still hold a live reference to it, but
    /// the caller may still be unwinding out of a callback invoked *by* that client.
    fn deferred_delete(&self, obj: Box<dyn Any>);

    /// Drops every object handed to [`Dispatcher::deferred_delete`] since the last call. A host
    /// event loop calls this once at the top of each iteration, before dispatching new events.
    fn clear_deferred_delete_list(&self);
}

type Queue = Rc<RefCell<VecDeque<Rc<PendingCallback>>>>;

struct PendingCallback {
    callback: Box<dyn Fn()>,
    scheduled: RefCell<bool>,
}

struct LocalScheduledCallback {
    queue: Queue,
    inner: Rc<PendingCallback>,
}

impl ScheduledCallback for LocalScheduledCallback {
    fn schedule(&self) {
        if *self.inner.scheduled.borrow() {
            return;
        }
        *self.inner.scheduled.borrow_mut() = true;
        self.queue.borrow_mut().push_back(self.inner.clone());
    }
}

/// A minimal single-threaded [`Dispatcher`] suitable for embedding the pool directly inside an
/// existing event loop: the owner polls [`LocalDispatcher::run_ready`] and calls
/// [`Dispatcher::clear_deferred_delete_list`] once per iteration.
#[derive(Default)]
pub struct LocalDispatcher {
    pending: Queue,
    deferred: RefCell<Vec<Box<dyn Any>>>,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every callback scheduled since the last drain, in order. A callback that reschedules
    /// itself (directly or transitively) is not re-run in the same drain pass.
    pub fn run_ready(&self) {
        loop {
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some(pending) => {
                    *pending.scheduled.borrow_mut() = false;
                    (pending.callback)();
                }
                None => break,
            }
        }
    }

    /// Whether any deferred-delete objects are queued.
    pub fn has_deferred(&self) -> bool {
        !self.deferred.borrow().is_empty()
    }
}

impl Dispatcher for LocalDispatcher {
    fn create_schedulable_callback(&self, callback: Box<dyn Fn()>) -> Rc<dyn ScheduledCallback> {
        Rc::new(LocalScheduledCallback {
            queue: self.pending.clone(),
            inner: Rc::new(PendingCallback {
                callback,
                scheduled: RefCell::new(false),
            }),
        })
    }

    fn deferred_delete(&self, obj: Box<dyn Any>) {
        self.deferred.borrow_mut().push(obj);
    }

    fn clear_deferred_delete_list(&self) {
        self.deferred.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn schedule_coalesces_and_runs_once() {
        let dispatcher = LocalDispatcher::new();
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let cb = dispatcher.create_schedulable_callback(Box::new(move || {
            calls_clone.set(calls_clone.get() + 1);
        }));
        cb.schedule();
        cb.schedule();
        dispatcher.run_ready();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn deferred_delete_runs_on_clear() {
        let dispatcher = LocalDispatcher::new();
        let dropped = Rc::new(Cell::new(false));
        struct Guard(Rc<Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }
        dispatcher.deferred_delete(Box::new(Guard(dropped.clone())));
        assert!(!dropped.get());
        dispatcher.clear_deferred_delete_list();
        assert!(dropped.get());
    }
}
