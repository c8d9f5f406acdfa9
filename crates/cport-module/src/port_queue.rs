//! `PortQueue`: default `CompletionQueue` implementation.
//!
//! Producers push into a lock-free `SegQueue`; consumers dequeue under
//! a small gate mutex that also enforces the concurrency limit.
//!
//! Concurrency gate: a thread that dequeues a packet holds one active
//! slot until it calls `wait()` again or `leave()`. `wait()` hands out a
//! packet only while `active < concurrency`. There is no kernel
//! scheduler feedback: a consumer about to block calls `leave()` so the
//! next waiter can run, otherwise it still counts as active.
//!
//! Close: `closed` is raised, then `close()` waits for in-flight
//! `post()` calls to finish before draining, so every packet either
//! failed to post or is counted in the drained total.

use crate::reactor::{Reactor, ReadinessSink};

use cport_core::error::{PoolError, Result};
use cport_core::packet::{Completion, Context, Packet, Wait};
use cport_core::queue::CompletionQueue;

use crossbeam_queue::SegQueue;
use std::cell::Cell;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the queue whose concurrency slot this thread holds (0 = none).
    /// A thread consumes from one queue at a time.
    static HELD_SLOT: Cell<u64> = const { Cell::new(0) };
}

struct Gate {
    active: usize,
}

struct QueueInner<P> {
    id: u64,
    concurrency: usize,
    packets: SegQueue<Packet<P>>,
    gate: Mutex<Gate>,
    cond: Condvar,
    closed: AtomicBool,
    /// Consumers parked (or about to park) on `cond`.
    sleepers: AtomicUsize,
    /// `post()` calls between their closed-check and their push.
    posting: AtomicUsize,
    reactor: Mutex<Reactor>,
}

/// Cloning a `PortQueue` yields another handle to the same queue.
pub struct PortQueue<P> {
    inner: Arc<QueueInner<P>>,
}

impl<P> Clone for PortQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Send + 'static> PortQueue<P> {
    /// Create a queue letting at most `concurrency` threads run at once.
    /// Zero means "number of CPUs".
    pub fn new(concurrency: usize) -> Result<Self> {
        let concurrency = if concurrency == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            concurrency
        };
        Ok(Self {
            inner: Arc::new(QueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                concurrency,
                packets: SegQueue::new(),
                gate: Mutex::new(Gate { active: 0 }),
                cond: Condvar::new(),
                closed: AtomicBool::new(false),
                sleepers: AtomicUsize::new(0),
                posting: AtomicUsize::new(0),
                reactor: Mutex::new(Reactor::new()?),
            }),
        })
    }

    /// Threads currently holding a concurrency slot.
    pub fn active(&self) -> usize {
        self.inner.lock_gate().active
    }

    /// Descriptors bound with `associate`.
    pub fn associations(&self) -> usize {
        self.inner.lock_reactor().registrations()
    }

    fn readiness_sink(&self) -> ReadinessSink {
        let weak: Weak<QueueInner<P>> = Arc::downgrade(&self.inner);
        Box::new(move |key, readiness| match weak.upgrade() {
            Some(inner) => inner
                .post(Packet::Completion(Completion {
                    key,
                    bytes: 0,
                    context: Context::Ready(readiness),
                }))
                .is_ok(),
            None => false,
        })
    }
}

impl<P> QueueInner<P> {
    // Gate and reactor state stay consistent across a panic elsewhere.
    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reactor(&self) -> MutexGuard<'_, Reactor> {
        self.reactor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn post(&self, packet: Packet<P>) -> Result<()> {
        self.posting.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.posting.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::QueueClosed);
        }
        self.packets.push(packet);
        self.posting.fetch_sub(1, Ordering::SeqCst);

        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _gate = self.lock_gate();
            self.cond.notify_one();
        }
        Ok(())
    }

    fn release_current(&self) {
        let held = HELD_SLOT.with(|slot| {
            if slot.get() == self.id {
                slot.set(0);
                true
            } else {
                false
            }
        });
        if held {
            let mut gate = self.lock_gate();
            gate.active = gate.active.saturating_sub(1);
            self.cond.notify_one();
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Wait<P> {
        self.release_current();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let mut gate = self.lock_gate();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Wait::Closed;
            }
            if gate.active < self.concurrency {
                if let Some(packet) = self.packets.pop() {
                    gate.active += 1;
                    HELD_SLOT.with(|slot| slot.set(self.id));
                    return Wait::Packet(packet);
                }
            }

            // Announce before the final check so a concurrent post
            // either sees us or we see its packet.
            self.sleepers.fetch_add(1, Ordering::SeqCst);
            if gate.active < self.concurrency && !self.packets.is_empty() {
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            let timed_out = match deadline {
                None => {
                    gate = self.cond.wait(gate).unwrap_or_else(|e| e.into_inner());
                    false
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        true
                    } else {
                        gate = self
                            .cond
                            .wait_timeout(gate, deadline - now)
                            .map(|(g, _)| g)
                            .unwrap_or_else(|e| e.into_inner().0);
                        false
                    }
                }
            };
            self.sleepers.fetch_sub(1, Ordering::SeqCst);
            if timed_out {
                return Wait::Timeout;
            }
        }
    }

    fn close(&self) -> usize {
        {
            let _gate = self.lock_gate();
            if self.closed.swap(true, Ordering::SeqCst) {
                return 0;
            }
            self.cond.notify_all();
        }

        while self.posting.load(Ordering::SeqCst) > 0 {
            std::hint::spin_loop();
            thread::yield_now();
        }

        self.lock_reactor().stop();

        let mut dropped = 0;
        while let Some(packet) = self.packets.pop() {
            if !packet.is_exit() {
                dropped += 1;
            }
        }
        dropped
    }
}

impl<P: Send + 'static> CompletionQueue<P> for PortQueue<P> {
    fn post(&self, packet: Packet<P>) -> Result<()> {
        self.inner.post(packet)
    }

    fn wait(&self, timeout: Option<Duration>) -> Wait<P> {
        self.inner.wait(timeout)
    }

    fn associate(&self, fd: BorrowedFd<'_>, key: usize) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::QueueClosed);
        }
        self.inner
            .lock_reactor()
            .add(fd, key, || self.readiness_sink())
    }

    fn leave(&self) {
        self.inner.release_current();
    }

    fn close(&self) -> usize {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    fn pending(&self) -> usize {
        self.inner.packets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::os::fd::AsFd;

    fn expect_payload(w: Wait<u32>) -> u32 {
        match w {
            Wait::Packet(Packet::Completion(c)) => c.into_payload().expect("payload"),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_order() {
        let q = PortQueue::<u32>::new(4).unwrap();
        for i in 0..3 {
            q.post(Packet::post(0, 0, i)).unwrap();
        }
        assert_eq!(q.pending(), 3);
        for i in 0..3 {
            assert_eq!(expect_payload(q.wait(Some(Duration::ZERO))), i);
        }
        q.leave();
        assert_eq!(q.active(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let q = PortQueue::<u32>::new(1).unwrap();
        let start = Instant::now();
        assert!(matches!(q.wait(Some(Duration::from_millis(20))), Wait::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_concurrency_gate_blocks_second_consumer() {
        let q = PortQueue::<u32>::new(1).unwrap();
        q.post(Packet::post(0, 0, 1)).unwrap();
        q.post(Packet::post(0, 0, 2)).unwrap();

        // This thread takes the only slot
        assert_eq!(expect_payload(q.wait(Some(Duration::ZERO))), 1);
        assert_eq!(q.active(), 1);

        let other = {
            let q = q.clone();
            thread::spawn(move || {
                let first = q.wait(Some(Duration::from_millis(30)));
                let blocked = matches!(first, Wait::Timeout);
                let second = q.wait(Some(Duration::from_secs(5)));
                q.leave();
                (blocked, second)
            })
        };

        thread::sleep(Duration::from_millis(60));
        // Releasing our slot lets the other consumer through
        q.leave();
        let (blocked, second) = other.join().unwrap();
        assert!(blocked);
        assert_eq!(expect_payload(second), 2);
    }

    #[test]
    fn test_post_wakes_sleeper() {
        let q = PortQueue::<u32>::new(2).unwrap();
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let got = q.wait(None);
                q.leave();
                got
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.post(Packet::post(9, 0, 77)).unwrap();
        assert_eq!(expect_payload(consumer.join().unwrap()), 77);
    }

    #[test]
    fn test_close_wakes_and_counts() {
        let q = PortQueue::<u32>::new(2).unwrap();
        let waiter = {
            let q = q.clone();
            thread::spawn(move || matches!(q.wait(None), Wait::Closed))
        };
        thread::sleep(Duration::from_millis(20));

        q.post(Packet::Exit).unwrap();
        q.post(Packet::post(0, 0, 1)).unwrap();
        // The waiter may or may not grab the Exit first; only the
        // completion is counted either way.
        let dropped = q.close();
        assert_eq!(dropped, 1);
        assert!(q.is_closed());
        assert!(matches!(q.post(Packet::post(0, 0, 2)), Err(PoolError::QueueClosed)));
        assert!(matches!(q.wait(None), Wait::Closed));
        // Second close is a no-op
        assert_eq!(q.close(), 0);
        let _ = waiter.join().unwrap();
    }

    #[test]
    fn test_associate_posts_readiness() {
        let q = PortQueue::<u32>::new(1).unwrap();
        let ev = Event::manual().unwrap();
        q.associate(ev.as_fd(), 5).unwrap();
        assert_eq!(q.associations(), 1);

        match q.wait(Some(Duration::from_secs(5))) {
            Wait::Packet(Packet::Completion(c)) => {
                assert_eq!(c.key, 5);
                match c.context {
                    Context::Ready(r) => assert_eq!(r.fd, std::os::fd::AsRawFd::as_raw_fd(&ev)),
                    other => panic!("expected readiness, got {:?}", other),
                }
            }
            other => panic!("expected completion, got {:?}", other),
        }
        q.leave();
        q.close();
        assert!(matches!(
            q.associate(ev.as_fd(), 6),
            Err(PoolError::QueueClosed)
        ));
    }
}
