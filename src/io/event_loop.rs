//! The reactor.
//!
//! An [`EventLoop`] owns a `mio` poller, the table of registered handlers,
//! a [`TimeoutQueue`] and a [`CallbackQueue`]. It runs on exactly one thread;
//! the only way in from another thread is a [`LoopRemote`].
//!
//! # Loop iteration
//!
//! ```text
//!   poll (bounded wait)
//!     │
//!     ├─ dispatch every ready handle:
//!     │     acceptable → connectable → readable → writable
//!     │
//!     ├─ sweep due timeouts
//!     │
//!     └─ drain deferred callbacks
//!          next wait = min(next deadline, poll timeout), or 1ms
//!          when callbacks were queued during the drain
//! ```
//!
//! Handle readiness from `mio` is edge-triggered: handlers must consume
//! until `WouldBlock`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, warn};

use crate::io::callback::{CallbackQueue, DeferredCallback};
use crate::io::timeout::{MIN_DELAY, Timeout, TimeoutHandle, TimeoutQueue};

/// Upper bound on a single wait for readiness.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

const WAKER: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

static LOOP_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Readiness a handler is interested in.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const ACCEPT: Ops = Ops(1);
    pub const CONNECT: Ops = Ops(1 << 1);
    pub const READ: Ops = Ops(1 << 2);
    pub const WRITE: Ops = Ops(1 << 3);

    pub fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn without(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn interest(self) -> Option<Interest> {
        let readable = self.contains(Ops::ACCEPT) || self.contains(Ops::READ);
        let writable = self.contains(Ops::CONNECT) || self.contains(Ops::WRITE);
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Ops::ACCEPT, "ACCEPT"),
            (Ops::CONNECT, "CONNECT"),
            (Ops::READ, "READ"),
            (Ops::WRITE, "WRITE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(op, _)| self.contains(*op))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Ops({})", set.join("|"))
    }
}

/// Readiness callbacks of a registered handle.
///
/// Errors returned from a callback are logged by the loop and never stop it.
pub trait IoHandler {
    fn on_acceptable(&self, _token: Token) -> io::Result<()> {
        Ok(())
    }

    fn on_connectable(&self, _token: Token) -> io::Result<()> {
        Ok(())
    }

    fn on_readable(&self, _token: Token) -> io::Result<()> {
        Ok(())
    }

    fn on_writable(&self, _token: Token) -> io::Result<()> {
        Ok(())
    }
}

/// Notified when a loop starts running and after it has stopped.
pub trait LoopObserver {
    fn on_start(&self, event_loop: &EventLoop);
    fn on_stop(&self, event_loop: &EventLoop);
}

/// Point-in-time view of a loop, taken on its own thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub id: usize,
    pub running: bool,
    pub handlers: usize,
    pub timeouts: usize,
    pub keep_alive_timeouts: usize,
    pub pending_callbacks: usize,
}

struct Registration {
    handler: Rc<dyn IoHandler>,
    ops: Ops,
    armed: bool,
}

/// State reachable from other threads.
struct Shared {
    id: usize,
    running: AtomicBool,
    callbacks: CallbackQueue,
    waker: Waker,
}

struct Inner {
    shared: Arc<Shared>,
    poll: RefCell<Poll>,
    registry: Registry,
    handlers: RefCell<HashMap<Token, Registration>>,
    timeouts: RefCell<TimeoutQueue>,
    observer: RefCell<Option<Box<dyn LoopObserver>>>,
    next_token: Cell<usize>,
    poll_timeout: Duration,
}

/// Handle to a single-threaded reactor. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl EventLoop {
    /// Opens the poller. Failure here is fatal for whoever owns the loop.
    pub fn new() -> io::Result<Self> {
        Self::with_poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_poll_timeout(poll_timeout: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let id = LOOP_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Self {
            inner: Rc::new(Inner {
                shared: Arc::new(Shared {
                    id,
                    running: AtomicBool::new(false),
                    callbacks: CallbackQueue::new(),
                    waker,
                }),
                poll: RefCell::new(poll),
                registry,
                handlers: RefCell::new(HashMap::new()),
                timeouts: RefCell::new(TimeoutQueue::new()),
                observer: RefCell::new(None),
                next_token: Cell::new(0),
                poll_timeout,
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.inner.shared.id
    }

    pub fn set_observer(&self, observer: Box<dyn LoopObserver>) {
        *self.inner.observer.borrow_mut() = Some(observer);
    }

    /// Handle usable from other threads.
    pub fn remote(&self) -> LoopRemote {
        LoopRemote {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Adds `source` to the handler table and subscribes it for `ops`.
    ///
    /// Returns `None`, after logging, if the source cannot be registered
    /// (typically because it is already closed).
    pub fn register<S>(&self, source: &mut S, handler: Rc<dyn IoHandler>, ops: Ops) -> Option<Token>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);

        let armed = match ops.interest() {
            Some(interest) => match self.inner.registry.register(source, token, interest) {
                Ok(()) => true,
                Err(e) => {
                    error!(loop_id = self.id(), error = %e, "could not register handle");
                    return None;
                }
            },
            None => false,
        };

        self.inner
            .handlers
            .borrow_mut()
            .insert(token, Registration { handler, ops, armed });
        debug!(loop_id = self.id(), token = token.0, ?ops, "handler registered");
        Some(token)
    }

    /// Replaces the interest set of a registered handle.
    pub fn update_interest<S>(&self, source: &mut S, token: Token, ops: Ops)
    where
        S: Source + ?Sized,
    {
        let mut handlers = self.inner.handlers.borrow_mut();
        let Some(registration) = handlers.get_mut(&token) else {
            warn!(token = token.0, "tried to update interest of an unknown handle");
            return;
        };
        if registration.ops == ops && registration.armed == ops.interest().is_some() {
            return;
        }

        let result = match (ops.interest(), registration.armed) {
            (Some(interest), true) => self.inner.registry.reregister(source, token, interest),
            (Some(interest), false) => self.inner.registry.register(source, token, interest),
            (None, true) => self.inner.registry.deregister(source),
            (None, false) => Ok(()),
        };
        match result {
            Ok(()) => {
                registration.ops = ops;
                registration.armed = ops.interest().is_some();
            }
            Err(e) => warn!(token = token.0, error = %e, "could not update interest"),
        }
    }

    /// Forgets the handler of `token`. The handle itself is left alone.
    pub fn unregister(&self, token: Token) {
        if self.inner.handlers.borrow_mut().remove(&token).is_none() {
            warn!(token = token.0, "tried to unregister an unknown handle");
        }
    }

    /// Unsubscribes `source` from the poller and forgets its handler.
    pub fn deregister<S>(&self, source: &mut S, token: Token)
    where
        S: Source + ?Sized,
    {
        let removed = self.inner.handlers.borrow_mut().remove(&token);
        if let Some(registration) = removed {
            if registration.armed {
                if let Err(e) = self.inner.registry.deregister(source) {
                    debug!(token = token.0, error = %e, "deregister failed");
                }
            }
        }
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.inner.handlers.borrow().contains_key(&token)
    }

    pub fn interest(&self, token: Token) -> Option<Ops> {
        self.inner.handlers.borrow().get(&token).map(|r| r.ops)
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    pub fn add_timeout(&self, timeout: Timeout) -> TimeoutHandle {
        self.inner.timeouts.borrow_mut().schedule(timeout)
    }

    pub fn add_keep_alive_timeout(&self, token: Token, timeout: Timeout) -> TimeoutHandle {
        self.inner
            .timeouts
            .borrow_mut()
            .schedule_keep_alive(token, timeout)
    }

    pub fn has_keep_alive_timeout(&self, token: Token) -> bool {
        self.inner.timeouts.borrow().has_keep_alive(token)
    }

    pub fn cancel_keep_alive_timeout(&self, token: Token) -> bool {
        self.inner.timeouts.borrow_mut().cancel_keep_alive(token)
    }

    pub fn timeout_count(&self) -> usize {
        self.inner.timeouts.borrow().len()
    }

    pub fn stats(&self) -> LoopStats {
        let timeouts = self.inner.timeouts.borrow();
        LoopStats {
            id: self.id(),
            running: self.is_running(),
            handlers: self.handler_count(),
            timeouts: timeouts.len(),
            keep_alive_timeouts: timeouts.keep_alive_len(),
            pending_callbacks: self.inner.shared.callbacks.len(),
        }
    }

    /// Queues a callback for the next drain.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.shared.callbacks.add(Box::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.running.load(Ordering::Acquire)
    }

    /// Asks the loop to stop. Observed when the current wait returns.
    pub fn stop(&self) {
        debug!(loop_id = self.id(), "stopping event loop");
        self.inner.shared.running.store(false, Ordering::Release);
    }

    /// Runs the loop on the calling thread until [`EventLoop::stop`].
    pub fn run(&self) {
        self.inner.shared.running.store(true, Ordering::Release);
        debug!(loop_id = self.id(), "event loop started");
        self.notify(|observer, el| observer.on_start(el));

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut wait = self.inner.poll_timeout;

        while self.is_running() {
            let polled = self.inner.poll.borrow_mut().poll(&mut events, Some(wait));
            if let Err(e) = polled {
                self.poll_failed(&e);
                events.clear();
            }

            for event in events.iter() {
                if event.token() != WAKER {
                    self.dispatch(event);
                }
            }

            wait = self.run_timeouts().map_or(self.inner.poll_timeout, |delay| {
                delay.min(self.inner.poll_timeout)
            });
            if self.inner.shared.callbacks.drain() {
                wait = MIN_DELAY;
            }
        }

        self.notify(|observer, el| observer.on_stop(el));
        self.teardown();
        debug!(loop_id = self.id(), "event loop stopped");
    }

    fn dispatch(&self, event: &Event) {
        let token = event.token();
        let handler = match self.inner.handlers.borrow().get(&token) {
            Some(registration) => Rc::clone(&registration.handler),
            None => return,
        };

        let result = (|| -> io::Result<()> {
            let ready = |ops: Ops| self.interest(token).is_some_and(|current| current.contains(ops));

            if ready(Ops::ACCEPT) && event.is_readable() {
                handler.on_acceptable(token)?;
            }
            if ready(Ops::CONNECT) && (event.is_writable() || event.is_error()) {
                handler.on_connectable(token)?;
                return Ok(());
            }
            if ready(Ops::READ) && (event.is_readable() || event.is_read_closed() || event.is_error()) {
                handler.on_readable(token)?;
            }
            if ready(Ops::WRITE) && (event.is_writable() || event.is_error()) {
                handler.on_writable(token)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            error!(loop_id = self.id(), token = token.0, error = %e, "i/o error during dispatch");
        }
    }

    /// Logs a failed poll and backs off so a persistent error cannot spin.
    /// Timeouts and callbacks still run for the iteration.
    fn poll_failed(&self, e: &io::Error) {
        if e.kind() == io::ErrorKind::Interrupted {
            return;
        }
        error!(loop_id = self.id(), error = %e, "poll failed");
        std::thread::sleep(MIN_DELAY);
    }

    fn run_timeouts(&self) -> Option<Duration> {
        let due = self.inner.timeouts.borrow_mut().expire(Instant::now());
        for timeout in due {
            timeout.fire();
        }
        self.inner.timeouts.borrow().next_delay(Instant::now())
    }

    fn notify(&self, f: impl FnOnce(&dyn LoopObserver, &EventLoop)) {
        let observer = self.inner.observer.borrow_mut().take();
        if let Some(observer) = observer {
            f(observer.as_ref(), self);
            *self.inner.observer.borrow_mut() = Some(observer);
        }
    }

    // Handlers and timeouts hold clones of the loop; dropping them here
    // releases those cycles.
    fn teardown(&self) {
        let handlers: Vec<Registration> = self
            .inner
            .handlers
            .borrow_mut()
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        drop(handlers);
        let timeouts = std::mem::take(&mut *self.inner.timeouts.borrow_mut());
        drop(timeouts);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id())
            .field("running", &self.is_running())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Cross-thread handle to an [`EventLoop`].
///
/// Work injected here runs on the loop thread during its next drain; the
/// poller is woken so that happens promptly.
#[derive(Clone)]
pub struct LoopRemote {
    shared: Arc<Shared>,
}

impl LoopRemote {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.add_boxed(Box::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the loop from its own thread via a deferred callback.
    pub fn stop(&self) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        self.add_callback(move || {
            if let Some(shared) = shared.upgrade() {
                debug!(loop_id = shared.id, "stop requested");
                shared.running.store(false, Ordering::Release);
            }
        });
    }

    fn add_boxed(&self, callback: DeferredCallback) {
        self.shared.callbacks.add(callback);
        if let Err(e) = self.shared.waker.wake() {
            warn!(loop_id = self.shared.id, error = %e, "could not wake event loop");
        }
    }
}

impl fmt::Debug for LoopRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRemote").field("id", &self.shared.id).finish()
    }
}
