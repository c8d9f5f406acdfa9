//! `CompletionPortPool`: a completion queue plus a resizable set of
//! worker threads running one pluggable handler.
//!
//! Structural state (registry, queue slot, target size) lives behind
//! one mutex. Everything a caller polls (`is_running`, `num_threads`,
//! `is_shutting_down`, `is_current_thread_in_pool`) is an atomic or a
//! thread-local and never takes the lock.
//!
//! Resizing is cooperative. Growth spawns threads; shrinking posts exit
//! sentinels. A thread that reads a sentinel exits only while the pool
//! is above its target, so surplus sentinels (several shrinks racing,
//! a queue shared with another pool) are harmless.

use crate::config::PoolConfig;
use crate::registry::{PoolThread, ThreadRegistry};
use crate::worker::{current_pool_id, worker_loop};

use cport_core::error::{PoolError, Result};
use cport_core::handler::CompletionHandler;
use cport_core::packet::Packet;
use cport_core::queue::CompletionQueue;
use cport_core::Latch;
use cport_module::PortQueue;

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Result of `CompletionPortPool::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker exited before the wait expired.
    pub exited_in_time: bool,
    /// Workers still alive when the wait expired, now detached.
    pub abandoned: usize,
    /// Completions dropped from the queue without being handled.
    pub discarded: usize,
}

impl ShutdownReport {
    pub(crate) const STOPPED: ShutdownReport = ShutdownReport {
        exited_in_time: true,
        abandoned: 0,
        discarded: 0,
    };

    /// All threads exited in time.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.exited_in_time
    }
}

struct QueueSlot<P> {
    queue: Arc<dyn CompletionQueue<P>>,
    /// Created by this pool (closed on shutdown) or attached.
    owned: bool,
}

struct PoolState<P> {
    queue: Option<QueueSlot<P>>,
    registry: ThreadRegistry,
    /// Size the pool is converging to.
    target: usize,
}

pub(crate) struct PoolShared<P> {
    pub(crate) id: u64,
    pub(crate) config: PoolConfig,
    pub(crate) handler: Arc<dyn CompletionHandler<P>>,
    state: Mutex<PoolState<P>>,
    /// Serialises whole shutdowns.
    shutdown_lock: Mutex<()>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    num_threads: AtomicUsize,
    abandoned: AtomicUsize,
    next_thread: AtomicU64,
}

impl<P: Send + 'static> PoolShared<P> {
    fn lock(&self) -> MutexGuard<'_, PoolState<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn one worker and register it. Caller holds the state lock.
    fn spawn_worker(
        self: &Arc<Self>,
        state: &mut PoolState<P>,
        queue: Arc<dyn CompletionQueue<P>>,
    ) -> Result<()> {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let exited = Arc::new(Latch::new());
        let shared = Arc::clone(self);
        let worker_exited = exited.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.config.name, id))
            .spawn(move || worker_loop(shared, queue, id, worker_exited))
            .map_err(PoolError::Spawn)?;

        let os_id = handle.thread().id();
        state.registry.insert(
            id,
            PoolThread {
                os_id,
                exited,
                _handle: handle,
            },
        );
        self.num_threads.store(state.registry.len(), Ordering::SeqCst);
        Ok(())
    }

    /// Converge on `n` threads. Caller holds the state lock.
    fn resize_locked(self: &Arc<Self>, state: &mut PoolState<P>, n: usize) -> Result<()> {
        let queue = match &state.queue {
            Some(slot) => slot.queue.clone(),
            None => return Err(PoolError::NotRunning),
        };
        let target = n.min(self.config.max_threads);
        let current = state.registry.len();
        // Threads above the old target already have a sentinel in flight.
        let effective = current.min(state.target);

        if target > current && self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        state.target = target;

        if target > current {
            for _ in current..target {
                self.spawn_worker(state, queue.clone())?;
            }
        } else {
            for _ in target..effective {
                queue.post(Packet::Exit)?;
            }
        }
        Ok(())
    }

    /// A worker read an exit sentinel. Retire it if the pool is above
    /// target.
    pub(crate) fn claim_exit(&self, id: u64) -> bool {
        let mut state = self.lock();
        if state.registry.len() > state.target && state.registry.remove(id) {
            self.num_threads.store(state.registry.len(), Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Remove a worker from the registry on its way out. No-op if it
    /// already retired or was detached by a timed-out shutdown.
    pub(crate) fn retire(&self, id: u64) {
        let mut state = self.lock();
        if state.registry.remove(id) {
            self.num_threads.store(state.registry.len(), Ordering::SeqCst);
        }
    }
}

/// A completion queue and the threads draining it.
pub struct CompletionPortPool<P: Send + 'static> {
    shared: Arc<PoolShared<P>>,
}

impl<P: Send + 'static> CompletionPortPool<P> {
    pub fn new(config: PoolConfig, handler: Arc<dyn CompletionHandler<P>>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                config,
                handler,
                state: Mutex::new(PoolState {
                    queue: None,
                    registry: ThreadRegistry::default(),
                    target: 0,
                }),
                shutdown_lock: Mutex::new(()),
                running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                num_threads: AtomicUsize::new(0),
                abandoned: AtomicUsize::new(0),
                next_thread: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_handler<H>(config: PoolConfig, handler: H) -> Self
    where
        H: CompletionHandler<P> + 'static,
    {
        Self::new(config, Arc::new(handler))
    }

    /// Create (or attach) the queue and spawn `initial_threads` workers.
    ///
    /// `concurrency_hint` caps concurrently running workers on a created
    /// queue (0 = CPU count); it is ignored for an attached queue.
    /// On failure the pool is left stopped.
    pub fn start(
        &self,
        concurrency_hint: usize,
        initial_threads: usize,
        external_queue: Option<Arc<dyn CompletionQueue<P>>>,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if shared.running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }

        let slot = match external_queue {
            Some(queue) => {
                if queue.is_closed() {
                    return Err(PoolError::QueueClosed);
                }
                QueueSlot { queue, owned: false }
            }
            None => QueueSlot {
                queue: Arc::new(PortQueue::<P>::new(concurrency_hint)?),
                owned: true,
            },
        };
        let queue = slot.queue.clone();
        let owned = slot.owned;
        state.queue = Some(slot);
        shared.shutting_down.store(false, Ordering::SeqCst);

        if let Err(e) = shared.resize_locked(&mut state, initial_threads) {
            // Roll back: whatever was spawned leaves through the queue.
            let spawned = state.registry.len();
            state.target = 0;
            state.queue = None;
            if owned {
                queue.close();
            } else {
                for _ in 0..spawned {
                    let _ = queue.post(Packet::Exit);
                }
            }
            return Err(e);
        }

        shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resize to `n` threads (clamped to `max_threads`). Growth is
    /// immediate; shrinking completes as workers read their sentinels.
    pub fn set_num_threads(&self, n: usize) -> Result<()> {
        let mut state = self.shared.lock();
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        self.shared.resize_locked(&mut state, n)
    }

    /// Bind a descriptor; readiness on it arrives as completions tagged
    /// with `key`.
    pub fn associate_handle(&self, fd: BorrowedFd<'_>, key: usize) -> Result<()> {
        self.queue()?.associate(fd, key)
    }

    /// Inject a synthetic completion.
    pub fn post_completion(&self, key: usize, bytes: u32, payload: P) -> Result<()> {
        self.queue()?.post(Packet::post(key, bytes, payload))
    }

    /// The live queue, for attaching another pool or posting directly.
    pub fn queue(&self) -> Result<Arc<dyn CompletionQueue<P>>> {
        let state = self.shared.lock();
        match &state.queue {
            Some(slot) if self.shared.running.load(Ordering::SeqCst) => Ok(slot.queue.clone()),
            _ => Err(PoolError::NotRunning),
        }
    }

    /// Stop every worker and release the queue.
    ///
    /// Waits at most `max_wait` for workers to exit (the calling thread
    /// is never waited on). Threads still running afterwards are
    /// detached: they leave the registry and exit by themselves once
    /// their handler returns to the closed queue. An owned queue is
    /// closed even when the wait expires. Idempotent.
    pub fn shutdown(&self, max_wait: Duration) -> ShutdownReport {
        let shared = &self.shared;
        let _serial = shared.shutdown_lock.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now().checked_add(max_wait);
        let me = thread::current().id();

        let latches = {
            let mut state = shared.lock();
            if !shared.running.load(Ordering::SeqCst) {
                return ShutdownReport::STOPPED;
            }
            shared.shutting_down.store(true, Ordering::SeqCst);
            if current_pool_id() == shared.id {
                // Free our concurrency slot so peers can read their sentinels.
                if let Some(slot) = &state.queue {
                    slot.queue.leave();
                }
            }
            let latches = state.registry.exit_latches_except(me);
            // Posting can only fail on an externally closed queue, whose
            // workers are already on their way out.
            let _ = shared.resize_locked(&mut state, 0);
            latches
        };

        for latch in &latches {
            if !latch.wait_until(deadline) {
                break;
            }
        }

        let mut state = shared.lock();
        let caller_is_worker = state.registry.contains_os_thread(me);
        let abandoned = state
            .registry
            .detach_all()
            .saturating_sub(caller_is_worker as usize);
        shared.num_threads.store(0, Ordering::SeqCst);

        let discarded = match state.queue.take() {
            Some(QueueSlot { queue, owned: true }) => queue.close(),
            _ => 0,
        };
        state.target = 0;
        shared.running.store(false, Ordering::SeqCst);
        shared.shutting_down.store(false, Ordering::SeqCst);
        drop(state);

        let observer = &shared.config.observer;
        if abandoned > 0 {
            shared.abandoned.fetch_add(abandoned, Ordering::Relaxed);
            observer.shutdown_timed_out(&shared.config.name, abandoned);
        }
        if discarded > 0 {
            observer.discarded(&shared.config.name, discarded);
        }

        ShutdownReport {
            exited_in_time: abandoned == 0,
            abandoned,
            discarded,
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.shared.num_threads.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_current_thread_in_pool(&self) -> bool {
        current_pool_id() == self.shared.id
    }

    /// Threads detached by timed-out shutdowns over the pool's lifetime.
    pub fn abandoned_threads(&self) -> usize {
        self.shared.abandoned.load(Ordering::Relaxed)
    }

    pub fn max_threads(&self) -> usize {
        self.shared.config.max_threads
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }
}

impl<P: Send + 'static> Drop for CompletionPortPool<P> {
    fn drop(&mut self) {
        // Close the queue so workers do not outlive the pool blocked on it.
        if self.is_running() {
            self.shutdown(Duration::ZERO);
        }
    }
}
