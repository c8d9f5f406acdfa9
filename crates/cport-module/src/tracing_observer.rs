//! `TracingObserver`: default `PoolObserver`, emits `tracing` events.
//!
//! Targets: `cport::pool` for worker lifecycle, `cport::service` for
//! scaling and teardown, `cport::wait` for wait registrations. Filter
//! them with the subscriber's `EnvFilter`, e.g.
//! `RUST_LOG=cport::service=debug`.

use cport_core::observer::{ExitReason, PoolObserver};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn thread_started(&self, pool: &str, thread: u64) {
        trace!(target: "cport::pool", pool, thread, "worker started");
    }

    fn thread_exited(&self, pool: &str, thread: u64, reason: ExitReason) {
        trace!(target: "cport::pool", pool, thread, ?reason, "worker exited");
    }

    fn handler_panicked(&self, pool: &str, thread: u64, message: &str) {
        error!(target: "cport::pool", pool, thread, panic = message, "handler panicked");
    }

    fn scaled(&self, pool: &str, from: usize, to: usize, latency: Duration) {
        info!(
            target: "cport::service",
            pool,
            from,
            to,
            latency_ms = latency.as_millis() as u64,
            "grew execution pool"
        );
    }

    fn scale_failed(&self, pool: &str, target: usize, error: &str) {
        warn!(target: "cport::service", pool, to = target, reason = error, "growth failed");
    }

    fn shutdown_timed_out(&self, pool: &str, abandoned: usize) {
        warn!(target: "cport::service", pool, abandoned, "shutdown wait expired, threads abandoned");
    }

    fn discarded(&self, pool: &str, count: usize) {
        debug!(target: "cport::service", pool, count, "discarded unexecuted items");
    }

    fn wait_registered(&self, id: u64) {
        debug!(target: "cport::wait", id, "wait registered");
    }

    fn wait_failed(&self, id: u64, error: &str) {
        warn!(target: "cport::wait", id, reason = error, "wait failed");
    }

    fn wait_finished(&self, id: u64, invocations: u64) {
        debug!(target: "cport::wait", id, invocations, "wait finished");
    }
}
