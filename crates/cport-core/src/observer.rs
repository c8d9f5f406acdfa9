//! Observability hooks.
//!
//! Pools and the service never log through a process-wide global. They
//! report lifecycle events to an injected `PoolObserver`; the default
//! `TracingObserver` (cport-module) turns them into `tracing` events.
//! Every method has an empty default so observers implement only what
//! they care about.

use std::time::Duration;

/// Why a worker thread left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Consumed an exit sentinel.
    Sentinel,
    /// The handler returned `HandlerAction::Exit`.
    Handler,
    /// The queue was closed under it.
    QueueClosed,
    /// The handler panicked and the panic policy ends the worker.
    Panicked,
}

pub trait PoolObserver: Send + Sync {
    fn thread_started(&self, _pool: &str, _thread: u64) {}

    fn thread_exited(&self, _pool: &str, _thread: u64, _reason: ExitReason) {}

    /// A handler panicked on `thread`. `message` is the panic payload if
    /// it was a string.
    fn handler_panicked(&self, _pool: &str, _thread: u64, _message: &str) {}

    /// The autoscaler grew the execution pool.
    fn scaled(&self, _pool: &str, _from: usize, _to: usize, _latency: Duration) {}

    /// A growth attempt failed (thread creation refused).
    fn scale_failed(&self, _pool: &str, _target: usize, _error: &str) {}

    /// `shutdown` gave up waiting; `abandoned` threads were still alive.
    fn shutdown_timed_out(&self, _pool: &str, _abandoned: usize) {}

    /// Work items dropped unexecuted at teardown.
    fn discarded(&self, _pool: &str, _count: usize) {}

    fn wait_registered(&self, _id: u64) {}

    /// Waiting on a registration's descriptors failed; its thread exits.
    fn wait_failed(&self, _id: u64, _error: &str) {}

    /// A wait registration thread finished after `invocations` callbacks.
    fn wait_finished(&self, _id: u64, _invocations: u64) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {}
