//! Deferred callbacks.
//!
//! The [`CallbackQueue`] is the only part of an event loop that may be touched
//! from other threads. Callbacks are drained once per loop iteration, on the
//! loop thread, in the order they were added.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::{debug, error};

use crate::io::event_loop::EventLoop;
use crate::io::timeout::Timeout;

/// A zero-argument task run exactly once on the owning loop's thread.
pub type DeferredCallback = Box<dyn FnOnce() + Send + 'static>;

/// Multi-producer, single-consumer queue of deferred callbacks.
#[derive(Default)]
pub struct CallbackQueue {
    callbacks: SegQueue<DeferredCallback>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a callback. Safe to call from any thread.
    pub fn add(&self, callback: DeferredCallback) {
        self.callbacks.push(callback);
        debug!("callback added");
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Runs every callback queued before this call.
    ///
    /// Callbacks added while draining are left for the next drain. Returns
    /// `true` when such callbacks are pending.
    pub fn drain(&self) -> bool {
        let pending = self.callbacks.len();
        let snapshot: Vec<DeferredCallback> =
            (0..pending).filter_map(|_| self.callbacks.pop()).collect();
        for callback in snapshot {
            run_isolated("deferred callback", callback);
        }
        !self.callbacks.is_empty()
    }
}

/// Runs `f`, logging instead of propagating a panic.
pub(crate) fn run_isolated<F: FnOnce()>(what: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(kind = what, "callback panicked");
    }
}

/// Runs a callback on a fixed period until cancelled.
///
/// Each run re-arms a fresh [`Timeout`] on the loop, so the period is measured
/// from the end of one run to the start of the next sweep that finds it due.
#[derive(Clone)]
pub struct PeriodicCallback {
    inner: Rc<Periodic>,
}

struct Periodic {
    event_loop: EventLoop,
    period: Duration,
    active: Cell<bool>,
    callback: Box<dyn Fn()>,
}

impl PeriodicCallback {
    pub fn new(event_loop: &EventLoop, period: Duration, callback: impl Fn() + 'static) -> Self {
        Self {
            inner: Rc::new(Periodic {
                event_loop: event_loop.clone(),
                period,
                active: Cell::new(true),
                callback: Box::new(callback),
            }),
        }
    }

    pub fn start(&self) {
        schedule(&self.inner);
    }

    /// Stops future runs. A run already scheduled becomes a no-op.
    pub fn cancel(&self) {
        self.inner.active.set(false);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }
}

fn schedule(periodic: &Rc<Periodic>) {
    let next = Rc::clone(periodic);
    periodic
        .event_loop
        .add_timeout(Timeout::after(periodic.period, move || {
            if next.active.get() {
                (next.callback)();
                schedule(&next);
            }
        }));
}
