//! # AdaptiveWorkerService: autoscaling execution over two pools
//!
//! ```text
//!  submit(item) ──▶ DispatchPool (1 thread)
//!                     │  forward item + "accepted" latch
//!                     ▼
//!                   ExecutionPool (min..max threads) ──▶ item.run()
//!                     │
//!  dispatcher waits ≤ accept_threshold for the latch
//!    set in time  → nothing
//!    timed out    → needed = min(in_progress + queued, max)
//!                   grow to min(needed + increment, max) if short
//! ```
//!
//! The single dispatch thread keeps submission order into the execution
//! queue. The latch wait only feeds the scaling decision; a slow
//! acceptance never loses or reorders an item.
//!
//! Shutdown order: stop event (wait registrations leave), dispatch pool
//! (items still queued there are discarded), drain the execution
//! backlog, execution pool.

use crate::backlog::Backlog;
use crate::config::{PanicPolicy, PoolConfig, ServiceConfig};
use crate::pool::{CompletionPortPool, ShutdownReport};
use crate::scaling::ScalingDecision;
use crate::wait::{spawn_wait, WaitSpec, WaitToken};
use crate::work_item::WorkItem;

use cport_core::error::{PoolError, Result};
use cport_core::handler::{CompletionHandler, HandlerAction};
use cport_core::packet::Completion;
use cport_core::{Clock, Latch, PoolObserver};
use cport_module::Event;

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DISPATCH_POOL: &str = "cport-dispatch";
pub const EXECUTION_POOL: &str = "cport-exec";

/// Service lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    NotStarted = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::ShuttingDown,
            3 => Self::Stopped,
            _ => Self::NotStarted,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    pub state: ServiceState,
    pub total_workers: usize,
    pub in_queue: usize,
    pub in_progress: usize,
    pub active_registrations: usize,
}

/// A work item on its way from the dispatcher to an execution thread.
pub(crate) struct Dispatched {
    item: WorkItem,
    accepted: Arc<Latch>,
}

/// Execution pool handler: account, acknowledge, run.
///
/// Items block freely, so the worker gives up its concurrency slot
/// before running one; the gate only paces dequeueing.
struct Executor {
    backlog: Arc<Backlog>,
}

impl CompletionHandler<Dispatched> for Executor {
    fn handle(&self, completion: Completion<Dispatched>) -> HandlerAction {
        if let Some(Dispatched { item, accepted }) = completion.into_payload() {
            let _running = self.backlog.begin();
            accepted.set();
            item.run();
        }
        HandlerAction::Continue
    }

    fn releases_slot(&self) -> bool {
        true
    }
}

/// Dispatch pool handler: forward, time the acceptance, maybe grow.
struct Dispatcher {
    exec: Arc<CompletionPortPool<Dispatched>>,
    backlog: Arc<Backlog>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn PoolObserver>,
    accept_threshold: Duration,
    growth_increment: usize,
    max_threads: usize,
}

impl Dispatcher {
    fn grow(&self, latency: Duration) {
        let current = self.exec.num_threads();
        let decision = ScalingDecision::evaluate(
            current,
            self.backlog.in_progress(),
            self.backlog.queued(),
            self.max_threads,
            self.growth_increment,
        );
        let Some(target) = decision.grow_to else {
            return;
        };
        match self.exec.set_num_threads(target) {
            Ok(()) => self.observer.scaled(EXECUTION_POOL, current, target, latency),
            Err(e) => self.observer.scale_failed(EXECUTION_POOL, target, &e.to_string()),
        }
    }
}

impl CompletionHandler<WorkItem> for Dispatcher {
    fn handle(&self, completion: Completion<WorkItem>) -> HandlerAction {
        let Some(item) = completion.into_payload() else {
            return HandlerAction::Continue;
        };

        let accepted = Arc::new(Latch::new());
        let started = self.clock.now();
        let forwarded = Dispatched {
            item,
            accepted: accepted.clone(),
        };
        if self.exec.post_completion(0, 0, forwarded).is_err() {
            // Execution pool already gone; the item is dropped.
            self.backlog.cancel();
            self.observer.discarded(EXECUTION_POOL, 1);
            return HandlerAction::Continue;
        }

        if !accepted.wait_timeout(self.accept_threshold) {
            self.grow(self.clock.since(started));
        }
        HandlerAction::Continue
    }
}

/// Everything that exists only between `start` and `shutdown`.
struct Runtime {
    config: ServiceConfig,
    dispatch: CompletionPortPool<WorkItem>,
    exec: Arc<CompletionPortPool<Dispatched>>,
    stop: Arc<Event>,
}

/// Self-scaling worker service. See the module docs.
pub struct AdaptiveWorkerService {
    state: AtomicU8,
    /// Serialises `start` and `shutdown`.
    lifecycle: Mutex<()>,
    runtime: Mutex<Option<Arc<Runtime>>>,
    backlog: Arc<Backlog>,
    registrations: Arc<AtomicUsize>,
    next_wait: AtomicU64,
}

impl Default for AdaptiveWorkerService {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveWorkerService {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ServiceState::NotStarted as u8),
            lifecycle: Mutex::new(()),
            runtime: Mutex::new(None),
            backlog: Arc::new(Backlog::default()),
            registrations: Arc::new(AtomicUsize::new(0)),
            next_wait: AtomicU64::new(1),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Option<Arc<Runtime>>> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Start both pools. Valid from `NotStarted` or `Stopped`.
    pub fn start(&self, config: ServiceConfig) -> Result<()> {
        config.validate()?;
        let _life = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match self.state() {
            ServiceState::NotStarted | ServiceState::Stopped => {}
            ServiceState::Running => return Err(PoolError::AlreadyStarted),
            ServiceState::ShuttingDown => return Err(PoolError::ShuttingDown),
        }

        let stop = Arc::new(Event::manual()?);

        let exec = Arc::new(CompletionPortPool::with_handler(
            PoolConfig::new(EXECUTION_POOL)
                .max_threads(config.max_threads)
                .panic_policy(config.panic_policy)
                .observer(config.observer.clone()),
            Executor {
                backlog: self.backlog.clone(),
            },
        ));
        exec.start(config.concurrency_hint, config.min_threads, None)?;

        let dispatch = CompletionPortPool::with_handler(
            PoolConfig::new(DISPATCH_POOL)
                .max_threads(1)
                .panic_policy(PanicPolicy::Continue)
                .observer(config.observer.clone()),
            Dispatcher {
                exec: exec.clone(),
                backlog: self.backlog.clone(),
                clock: config.clock.clone(),
                observer: config.observer.clone(),
                accept_threshold: config.accept_threshold,
                growth_increment: config.growth_increment,
                max_threads: config.max_threads,
            },
        );
        if let Err(e) = dispatch.start(1, 1, None) {
            exec.shutdown(config.execution_shutdown_wait);
            return Err(e);
        }

        *self.runtime() = Some(Arc::new(Runtime {
            config,
            dispatch,
            exec,
            stop,
        }));
        self.set_state(ServiceState::Running);
        Ok(())
    }

    /// `start` with `ServiceConfig::default()`.
    pub fn start_default(&self) -> Result<()> {
        self.start(ServiceConfig::default())
    }

    /// Queue `item` for execution. Only accepted while `Running`.
    pub fn submit(&self, item: impl Into<WorkItem>) -> Result<()> {
        let runtime = self.runtime();
        let rt = match runtime.as_ref() {
            Some(rt) if self.state() == ServiceState::Running => rt,
            _ => return Err(self.not_running()),
        };
        self.backlog.enqueue();
        if let Err(e) = rt.dispatch.post_completion(0, 0, item.into()) {
            self.backlog.cancel();
            return Err(e);
        }
        Ok(())
    }

    /// Run `callback` on a dedicated thread whenever `handle` is signalled
    /// (`callback(false)`) or `timeout` passes without a signal
    /// (`callback(true)`). With `execute_once` the thread exits after the
    /// first call. Service shutdown or `unregister_wait` end the thread
    /// without a further call.
    ///
    /// The handle is duplicated; the caller may drop its own copy.
    /// `timeout: None` waits forever and then requires a handle.
    pub fn register_wait<F>(
        &self,
        handle: Option<&Event>,
        callback: F,
        timeout: Option<Duration>,
        execute_once: bool,
    ) -> Result<WaitToken>
    where
        F: FnMut(bool) + Send + 'static,
    {
        let (stop, observer) = {
            let runtime = self.runtime();
            match runtime.as_ref() {
                Some(rt) if self.state() == ServiceState::Running => {
                    (rt.stop.clone(), rt.config.observer.clone())
                }
                _ => return Err(self.not_running()),
            }
        };
        let handle = handle.map(Event::try_clone).transpose()?;
        spawn_wait(
            WaitSpec {
                id: self.next_wait.fetch_add(1, Ordering::Relaxed),
                handle,
                timeout,
                execute_once,
                callback: Box::new(callback),
            },
            stop,
            self.registrations.clone(),
            observer,
        )
    }

    /// Ask a registration's thread to exit. See `WaitToken::unregister`.
    pub fn unregister_wait(&self, token: &WaitToken) -> Result<()> {
        token.unregister()
    }

    /// Stop the service.
    ///
    /// Waits (without bound) for every accepted item to finish; items
    /// still queued in the dispatch pool are dropped unexecuted. The
    /// per-pool waits from `ServiceConfig` bound only the thread exits.
    /// Idempotent. Called from inside a work item, it waits for
    /// everything except that item.
    pub fn shutdown(&self) -> ShutdownReport {
        let _life = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let rt = {
            let mut runtime = self.runtime();
            if self.state() != ServiceState::Running {
                return ShutdownReport::STOPPED;
            }
            self.set_state(ServiceState::ShuttingDown);
            match runtime.take() {
                Some(rt) => rt,
                None => {
                    self.set_state(ServiceState::Stopped);
                    return ShutdownReport::STOPPED;
                }
            }
        };

        // Registration threads watch this; a failure leaves them to
        // their own timeouts or kill events.
        let _ = rt.stop.set();

        let dispatch = rt.dispatch.shutdown(rt.config.dispatch_shutdown_wait);
        self.backlog.discard(dispatch.discarded);

        let reserve = rt.exec.is_current_thread_in_pool() as usize;
        if reserve > 0 {
            if let Ok(queue) = rt.exec.queue() {
                queue.leave();
            }
        }
        self.backlog.wait_drained(reserve);

        let exec = rt.exec.shutdown(rt.config.execution_shutdown_wait);
        self.set_state(ServiceState::Stopped);

        ShutdownReport {
            exited_in_time: dispatch.exited_in_time && exec.exited_in_time,
            abandoned: dispatch.abandoned + exec.abandoned,
            discarded: dispatch.discarded + exec.discarded,
        }
    }

    fn not_running(&self) -> PoolError {
        match self.state() {
            ServiceState::ShuttingDown => PoolError::ShuttingDown,
            _ => PoolError::NotRunning,
        }
    }

    #[inline]
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Live execution threads.
    pub fn total_workers(&self) -> usize {
        self.runtime()
            .as_ref()
            .map(|rt| rt.exec.num_threads())
            .unwrap_or(0)
    }

    /// Items accepted but not yet picked up by an execution thread.
    #[inline]
    pub fn in_queue(&self) -> usize {
        self.backlog.queued()
    }

    #[inline]
    pub fn in_progress(&self) -> usize {
        self.backlog.in_progress()
    }

    #[inline]
    pub fn active_registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            state: self.state(),
            total_workers: self.total_workers(),
            in_queue: self.in_queue(),
            in_progress: self.in_progress(),
            active_registrations: self.active_registrations(),
        }
    }
}

impl Drop for AdaptiveWorkerService {
    fn drop(&mut self) {
        if self.state() == ServiceState::Running {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cport_core::NoopObserver;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn quiet(min: usize, max: usize) -> ServiceConfig {
        ServiceConfig::with_max_threads(max)
            .min_threads(min)
            .observer(Arc::new(NoopObserver))
    }

    #[test]
    fn test_lifecycle_states() {
        let svc = AdaptiveWorkerService::new();
        assert_eq!(svc.state(), ServiceState::NotStarted);
        assert!(matches!(svc.submit(|| {}), Err(PoolError::NotRunning)));

        svc.start(quiet(2, 8)).unwrap();
        assert_eq!(svc.state(), ServiceState::Running);
        assert!(matches!(svc.start(quiet(2, 8)), Err(PoolError::AlreadyStarted)));

        assert!(svc.shutdown().is_complete());
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(svc.shutdown(), ShutdownReport::STOPPED);
        assert!(matches!(svc.submit(|| {}), Err(PoolError::NotRunning)));

        // Restart from Stopped
        svc.start(quiet(1, 2)).unwrap();
        assert_eq!(svc.total_workers(), 1);
        svc.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let svc = AdaptiveWorkerService::new();
        let r = svc.start(quiet(9, 4));
        assert!(matches!(r, Err(PoolError::InvalidConfig(_))));
        assert_eq!(svc.state(), ServiceState::NotStarted);
    }

    #[test]
    fn test_fast_item_keeps_min_threads() {
        let svc = AdaptiveWorkerService::new();
        svc.start(quiet(2, 8)).unwrap();
        let (tx, rx) = mpsc::channel();
        svc.submit(move || {
            let _ = tx.send(42);
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(svc.total_workers(), 2);
        svc.shutdown();
    }

    #[test]
    fn test_blocking_burst_grows_pool() {
        let svc = AdaptiveWorkerService::new();
        svc.start(
            quiet(1, 4)
                .concurrency_hint(1)
                .accept_threshold(Duration::from_millis(50)),
        )
        .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let began = Instant::now();
        for _ in 0..4 {
            let ran = ran.clone();
            svc.submit(move || {
                thread::sleep(Duration::from_millis(400));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(eventually(Duration::from_secs(3), || svc.total_workers() > 1));
        assert!(svc.total_workers() <= 4);

        // Blocked items do not hold the single concurrency slot, so the
        // grown threads run side by side rather than one at a time.
        assert!(eventually(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 4));
        assert!(began.elapsed() < Duration::from_millis(1400), "{:?}", began.elapsed());

        let report = svc.shutdown();
        assert!(report.is_complete());
        // Shutdown drains: each item ran exactly once
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(svc.in_queue(), 0);
        assert_eq!(svc.in_progress(), 0);
    }

    #[test]
    fn test_panicking_item_does_not_leak_counts() {
        let svc = AdaptiveWorkerService::new();
        svc.start(quiet(2, 4)).unwrap();
        svc.submit(|| panic!("bad item")).unwrap();
        let (tx, rx) = mpsc::channel();
        svc.submit(move || {
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(eventually(Duration::from_secs(5), || svc.in_progress() == 0));
        svc.shutdown();
        assert_eq!(svc.in_queue(), 0);
    }

    #[test]
    fn test_register_wait_once() {
        let svc = AdaptiveWorkerService::new();
        svc.start(quiet(2, 4)).unwrap();
        let ev = Event::manual().unwrap();
        let (tx, rx) = mpsc::channel();
        let token = svc
            .register_wait(Some(&ev), move |t| { let _ = tx.send(t); }, None, true)
            .unwrap();
        assert_eq!(svc.active_registrations(), 1);

        ev.set().unwrap();
        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(token.wait_finished(Some(Duration::from_secs(5))));
        assert!(eventually(Duration::from_secs(1), || svc.active_registrations() == 0));
        svc.shutdown();
    }

    #[test]
    fn test_shutdown_stops_registrations() {
        let svc = AdaptiveWorkerService::new();
        svc.start(quiet(1, 2)).unwrap();
        let ev = Event::manual().unwrap();
        let token = svc.register_wait(Some(&ev), |_| {}, None, false).unwrap();
        svc.shutdown();
        assert!(token.wait_finished(Some(Duration::from_secs(5))));
        assert!(matches!(
            svc.register_wait(Some(&ev), |_| {}, None, true),
            Err(PoolError::NotRunning)
        ));
    }

    #[test]
    fn test_unregister_wait() {
        let svc = AdaptiveWorkerService::new();
        svc.start(quiet(1, 2)).unwrap();
        let ev = Event::manual().unwrap();
        let token = svc
            .register_wait(Some(&ev), |_| panic!("must not run"), None, true)
            .unwrap();
        svc.unregister_wait(&token).unwrap();
        assert!(token.wait_finished(Some(Duration::from_secs(5))));
        ev.set().unwrap();
        svc.shutdown();
    }

    #[test]
    fn test_shutdown_from_work_item() {
        let svc = Arc::new(AdaptiveWorkerService::new());
        svc.start(quiet(2, 4).concurrency_hint(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        let ran = Arc::new(AtomicUsize::new(0));
        let inner = svc.clone();
        let counter = ran.clone();
        svc.submit(move || {
            // Queue a second item behind this one, then shut down
            // while it is still pending.
            let second = counter.clone();
            let _ = inner.submit(move || {
                second.fetch_add(1, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(200));
            let report = inner.shutdown();
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(report);
        })
        .unwrap();
        let report = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(report.is_complete());
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(svc.in_queue(), 0);
    }

    #[test]
    fn test_nested_submit_runs_while_outer_blocks() {
        let svc = Arc::new(AdaptiveWorkerService::new());
        svc.start(quiet(2, 4).concurrency_hint(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = svc.clone();
        svc.submit(move || {
            let (done_tx, done_rx) = mpsc::channel();
            let _ = inner.submit(move || {
                let _ = done_tx.send(());
            });
            let _ = tx.send(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
        })
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        assert!(svc.shutdown().is_complete());
    }

    #[test]
    fn test_large_burst_stays_under_max_and_runs_each_once() {
        const ITEMS: usize = 50;
        const MAX: usize = 4;

        let svc = Arc::new(AdaptiveWorkerService::new());
        svc.start(quiet(1, MAX).accept_threshold(Duration::from_millis(10)))
            .unwrap();

        let peak = Arc::new(AtomicUsize::new(0));
        let sampling = Arc::new(AtomicBool::new(true));
        let sampler = {
            let (svc, peak, sampling) = (svc.clone(), peak.clone(), sampling.clone());
            thread::spawn(move || {
                while sampling.load(Ordering::SeqCst) {
                    peak.fetch_max(svc.total_workers(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..ITEMS).map(|_| AtomicUsize::new(0)).collect());
        for i in 0..ITEMS {
            let runs = runs.clone();
            svc.submit(move || {
                thread::sleep(Duration::from_millis(20));
                runs[i].fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert!(eventually(Duration::from_secs(20), || {
            runs.iter().all(|r| r.load(Ordering::SeqCst) > 0)
        }));
        let report = svc.shutdown();
        sampling.store(false, Ordering::SeqCst);
        sampler.join().unwrap();

        assert!(report.is_complete());
        assert!(peak.load(Ordering::SeqCst) <= MAX, "peak {}", peak.load(Ordering::SeqCst));
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
        assert_eq!((svc.in_queue(), svc.in_progress()), (0, 0));
    }

    #[test]
    fn test_stats_snapshot() {
        let svc = AdaptiveWorkerService::new();
        svc.start(quiet(3, 6)).unwrap();
        let s = svc.stats();
        assert_eq!(s.state, ServiceState::Running);
        assert_eq!(s.total_workers, 3);
        assert_eq!((s.in_queue, s.in_progress, s.active_registrations), (0, 0, 0));
        svc.shutdown();
    }
}
