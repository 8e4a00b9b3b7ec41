//! Timers for the event loop.
//!
//! Two ordered sets are kept: ad hoc timeouts, and keep-alive timeouts of
//! which each connection has at most one. Entries are ordered by deadline and
//! then by a sequence number taken at scheduling time, so equal deadlines
//! never collide.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::Token;
use tracing::debug;

use crate::io::callback::run_isolated;

/// Lower bound on the delay returned by a sweep.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

type Key = (Instant, u64);

/// A callback due at an absolute deadline.
///
/// Cancellation is cooperative: a cancelled timeout still fires at its
/// deadline, but runs nothing.
pub struct Timeout {
    deadline: Instant,
    callback: Box<dyn FnOnce()>,
    cancelled: Rc<Cell<bool>>,
}

impl Timeout {
    pub fn new(deadline: Instant, callback: impl FnOnce() + 'static) -> Self {
        Self {
            deadline,
            callback: Box::new(callback),
            cancelled: Rc::new(Cell::new(false)),
        }
    }

    /// A timeout due `delay` from now.
    pub fn after(delay: Duration, callback: impl FnOnce() + 'static) -> Self {
        Self::new(Instant::now() + delay, callback)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Handle that can cancel this timeout after it has been scheduled.
    pub fn handle(&self) -> TimeoutHandle {
        TimeoutHandle {
            cancelled: Rc::clone(&self.cancelled),
        }
    }

    pub(crate) fn fire(self) {
        if self.cancelled.get() {
            return;
        }
        run_isolated("timeout", self.callback);
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimeoutHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

#[derive(Debug, Default)]
pub struct TimeoutQueue {
    timeouts: BTreeMap<Key, Timeout>,
    keep_alive: BTreeMap<Key, (Token, Timeout)>,
    index: HashMap<Token, Key>,
    sequence: u64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, timeout: Timeout) -> TimeoutHandle {
        debug!(?timeout, "added generic timeout");
        let handle = timeout.handle();
        let key = self.next_key(timeout.deadline);
        self.timeouts.insert(key, timeout);
        handle
    }

    /// Schedules the keep-alive timeout of `connection`, replacing any
    /// existing one.
    pub fn schedule_keep_alive(&mut self, connection: Token, timeout: Timeout) -> TimeoutHandle {
        debug!(?timeout, token = connection.0, "added keep-alive timeout");
        if let Some(old) = self.index.remove(&connection) {
            self.keep_alive.remove(&old);
        }
        let handle = timeout.handle();
        let key = self.next_key(timeout.deadline);
        self.keep_alive.insert(key, (connection, timeout));
        self.index.insert(connection, key);
        handle
    }

    pub fn has_keep_alive(&self, connection: Token) -> bool {
        self.index.contains_key(&connection)
    }

    /// Drops the keep-alive timeout of `connection` without firing it.
    pub fn cancel_keep_alive(&mut self, connection: Token) -> bool {
        match self.index.remove(&connection) {
            Some(key) => self.keep_alive.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.timeouts.len() + self.keep_alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty() && self.keep_alive.is_empty()
    }

    pub fn keep_alive_len(&self) -> usize {
        self.index.len()
    }

    /// Removes every entry due at `now` and returns them in firing order.
    ///
    /// The caller fires them; anything scheduled meanwhile is left for the
    /// next sweep.
    pub fn expire(&mut self, now: Instant) -> Vec<Timeout> {
        let mut due: Vec<(Key, Timeout)> = Vec::new();

        while let Some(entry) = self.keep_alive.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (key, (connection, timeout)) = entry.remove_entry();
            self.index.remove(&connection);
            debug!(token = connection.0, "keep-alive timeout triggered");
            due.push((key, timeout));
        }

        while let Some(entry) = self.timeouts.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove_entry());
        }

        due.sort_by_key(|(key, _)| *key);
        due.into_iter().map(|(_, timeout)| timeout).collect()
    }

    /// Delay until the earliest pending deadline, floored at [`MIN_DELAY`].
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        let earliest = [self.timeouts.keys().next(), self.keep_alive.keys().next()]
            .into_iter()
            .flatten()
            .map(|(deadline, _)| *deadline)
            .min()?;
        Some(earliest.saturating_duration_since(now).max(MIN_DELAY))
    }

    /// Fires every entry due at `now` and returns the delay until the next.
    pub fn sweep(&mut self, now: Instant) -> Option<Duration> {
        for timeout in self.expire(now) {
            timeout.fire();
        }
        self.next_delay(now)
    }

    fn next_key(&mut self, deadline: Instant) -> Key {
        self.sequence += 1;
        (deadline, self.sequence)
    }
}
