//! Backlog accounting for `AdaptiveWorkerService`.
//!
//! `queued` counts items accepted by `submit` that no execution thread
//! has picked up yet; `in_progress` counts items currently running.
//! Both are read lock-free. The mutex and condvar exist only so that
//! shutdown can sleep until the backlog drains; whoever brings the sum
//! to one or zero notifies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Default)]
pub(crate) struct Backlog {
    queued: AtomicUsize,
    in_progress: AtomicUsize,
    lock: Mutex<()>,
    drained: Condvar,
}

impl Backlog {
    #[inline]
    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub(crate) fn enqueue(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo an `enqueue` whose post failed.
    pub(crate) fn cancel(&self) {
        self.discard(1);
    }

    /// Items that will never run (dropped with a closed queue).
    pub(crate) fn discard(&self, n: usize) {
        if n == 0 {
            return;
        }
        let prev = self.queued.fetch_sub(n, Ordering::SeqCst);
        debug_assert!(prev >= n);
        self.notify_if_drained();
    }

    /// An execution thread picked up an item: in-progress first, then
    /// un-queue, so the sum never transiently reads zero.
    pub(crate) fn begin(&self) -> InProgress<'_> {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_sub(1, Ordering::SeqCst);
        InProgress { backlog: self }
    }

    #[inline]
    fn total(&self) -> usize {
        self.queued() + self.in_progress()
    }

    #[inline]
    pub(crate) fn is_drained(&self) -> bool {
        self.total() == 0
    }

    /// Block until at most `reserve` items (0 or 1) are queued or
    /// running. A shutdown issued from inside a work item reserves its
    /// own.
    pub(crate) fn wait_drained(&self, reserve: usize) {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.total() > reserve.min(1) {
            guard = self
                .drained
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn notify_if_drained(&self) {
        if self.total() <= 1 {
            // Taking the lock orders this notify after a waiter's check.
            let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.drained.notify_all();
        }
    }
}

/// Decrements `in_progress` on drop, including during a panic unwind.
pub(crate) struct InProgress<'a> {
    backlog: &'a Backlog,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.backlog.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.backlog.notify_if_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_counts() {
        let b = Backlog::default();
        b.enqueue();
        b.enqueue();
        assert_eq!(b.queued(), 2);
        let g = b.begin();
        assert_eq!((b.queued(), b.in_progress()), (1, 1));
        drop(g);
        b.cancel();
        assert!(b.is_drained());
    }

    #[test]
    fn test_guard_survives_panic() {
        let b = Backlog::default();
        b.enqueue();
        let r = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _g = b.begin();
            panic!("item failed");
        }));
        assert!(r.is_err());
        assert!(b.is_drained());
    }

    #[test]
    fn test_wait_drained_wakes() {
        let b = Arc::new(Backlog::default());
        b.enqueue();
        b.enqueue();
        let b2 = b.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let g = b2.begin();
            thread::sleep(Duration::from_millis(20));
            drop(g);
            b2.discard(1);
        });
        b.wait_drained(0);
        assert!(b.is_drained());
        t.join().unwrap();
    }

    #[test]
    fn test_wait_with_reserve() {
        let b = Backlog::default();
        b.enqueue();
        let _self_item = b.begin();
        // The caller's own item is the only thing left
        b.wait_drained(1);
        assert_eq!(b.in_progress(), 1);
    }
}
