//! One-shot latch.
//!
//! A `Latch` starts open-circuit and is set exactly once. Any number of
//! threads can wait on it with a deadline. The pools use it for two
//! things: a worker's exit notification (shared with whoever shuts the
//! pool down) and the dispatcher's "accepted" signal.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake every waiter. Idempotent.
    pub fn set(&self) {
        let mut set = self.lock();
        if !*set {
            *set = true;
            self.cond.notify_all();
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Wait up to `timeout`. Returns true if the latch is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now().checked_add(timeout))
    }

    /// Wait until `deadline` (`None` = forever). Returns true if set.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut set = self.lock();
        while !*set {
            match deadline {
                None => {
                    set = self.cond.wait(set).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    set = self
                        .cond
                        .wait_timeout(set, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
        true
    }

    // A poisoned latch still holds a valid bool.
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }
}
