//! Reconnection grace timers.
//!
//! A [`GraceScheduler`] holds at most one pending timer per key. Arming a
//! key supersedes its previous timer; cancelling aborts the task.
//!
//! Aborting a task cannot stop a callback that has already started, so each
//! timer also carries a [`TimerToken`]. The callback must redeem its token
//! with [`GraceScheduler::complete`] while holding the same lock that guards
//! the scheduler. A superseded or cancelled timer finds its token gone and
//! does nothing.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Identifies one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

struct PendingTimer {
    token: TimerToken,
    handle: JoinHandle<()>,
}

/// Keyed deferred callbacks with cancellation.
pub struct GraceScheduler<K> {
    timers: HashMap<K, PendingTimer>,
    next_token: u64,
}

impl<K> GraceScheduler<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            next_token: 0,
        }
    }

    /// Schedule `on_fire` to run after `delay`, replacing any timer already
    /// armed for `key`.
    ///
    /// `on_fire` receives the token of this arming and builds the future to
    /// run when the delay elapses. Must be called within a Tokio runtime.
    pub fn arm<F, Fut>(&mut self, key: K, delay: Duration, on_fire: F) -> TimerToken
    where
        F: FnOnce(TimerToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(&key);

        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let callback = on_fire(token);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback.await;
        });

        debug!(key = %key, delay_ms = delay.as_millis() as u64, "Grace timer armed");
        self.timers.insert(key, PendingTimer { token, handle });
        token
    }

    /// Cancel the timer for `key`.
    ///
    /// Returns `true` if a timer was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                debug!(key = %key, "Grace timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer.
    ///
    /// Returns the number of timers cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.timers.len();
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        if count > 0 {
            debug!(count, "Cancelled all grace timers");
        }
        count
    }

    /// Redeem a fired timer's token.
    ///
    /// Returns `true` and discards the timer if `token` is still the
    /// current arming for `key`; returns `false` if it was superseded or
    /// cancelled in the meantime.
    pub fn complete(&mut self, key: &K, token: TimerToken) -> bool {
        match self.timers.get(key) {
            Some(timer) if timer.token == token => {
                self.timers.remove(key);
                true
            }
            _ => {
                trace!(key = %key, "Stale grace timer ignored");
                false
            }
        }
    }

    /// Check if a timer is pending for `key`.
    #[must_use]
    pub fn is_armed(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Check if no timers are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<K> Default for GraceScheduler<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for GraceScheduler<K> {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.handle.abort();
        }
    }
}
