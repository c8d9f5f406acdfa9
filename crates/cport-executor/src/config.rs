//! Pool and service configuration

use cport_core::env::{env_get, env_get_bool, env_get_millis};
use cport_core::error::{PoolError, Result};
use cport_core::observer::PoolObserver;
use cport_core::Clock;
use cport_module::{MonotonicClock, TracingObserver};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default ceiling on execution threads.
pub const DEFAULT_MAX_THREADS: usize = 40;

/// Default time the dispatcher waits for an execution worker to pick
/// up a forwarded item before it considers growing the pool.
pub const DEFAULT_ACCEPT_THRESHOLD: Duration = Duration::from_millis(100);

/// Extra threads added on top of the measured need when growing.
pub const DEFAULT_GROWTH_INCREMENT: usize = 2;

/// Hard per-pool thread capacity when nothing lower is configured.
pub const POOL_THREAD_CAPACITY: usize = 1024;

/// What a worker does after its handler panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicPolicy {
    /// Report, run cleanup, and end only that worker. The pool runs one
    /// thread short until growth or an explicit resize restores it.
    #[default]
    ExitWorker,
    /// Report and keep the worker looping.
    Continue,
}

/// Configuration for a single `CompletionPortPool`
#[derive(Clone)]
pub struct PoolConfig {
    /// Name used for thread names and observer events
    pub name: String,

    /// Upper bound for `set_num_threads`
    pub max_threads: usize,

    pub panic_policy: PanicPolicy,

    pub observer: Arc<dyn PoolObserver>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "cport".to_string(),
            max_threads: POOL_THREAD_CAPACITY,
            panic_policy: PanicPolicy::default(),
            observer: Arc::new(TracingObserver),
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("name", &self.name)
            .field("max_threads", &self.max_threads)
            .field("panic_policy", &self.panic_policy)
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Configuration for `AdaptiveWorkerService`
#[derive(Clone)]
pub struct ServiceConfig {
    /// Execution threads started up front (default: max(max/4, 2))
    pub min_threads: usize,

    /// Execution thread ceiling (default: 40)
    pub max_threads: usize,

    /// Execution queue concurrency (default: CPU count, clamped to max)
    pub concurrency_hint: usize,

    /// How long the dispatcher waits for an item to be accepted
    pub accept_threshold: Duration,

    /// Threads added beyond the measured need on each growth
    pub growth_increment: usize,

    /// Bound on waiting for the dispatch thread at shutdown
    pub dispatch_shutdown_wait: Duration,

    /// Bound on waiting for execution threads at shutdown
    pub execution_shutdown_wait: Duration,

    pub panic_policy: PanicPolicy,

    pub observer: Arc<dyn PoolObserver>,

    pub clock: Arc<dyn Clock>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::with_max_threads(DEFAULT_MAX_THREADS)
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("concurrency_hint", &self.concurrency_hint)
            .field("accept_threshold", &self.accept_threshold)
            .field("growth_increment", &self.growth_increment)
            .field("panic_policy", &self.panic_policy)
            .finish_non_exhaustive()
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults derived from a thread ceiling: min = max(max/4, 2),
    /// concurrency = CPU count clamped to max.
    pub fn with_max_threads(max_threads: usize) -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            min_threads: (max_threads / 4).max(2),
            max_threads,
            concurrency_hint: num_cpus.min(max_threads).max(1),
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
            dispatch_shutdown_wait: Duration::from_secs(5),
            execution_shutdown_wait: Duration::from_secs(30),
            panic_policy: PanicPolicy::default(),
            observer: Arc::new(TracingObserver),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Defaults overlaid with `CPORT_*` environment variables:
    ///
    /// - `CPORT_MAX_THREADS`, `CPORT_MIN_THREADS`, `CPORT_CONCURRENCY`
    /// - `CPORT_ACCEPT_THRESHOLD_MS`, `CPORT_GROWTH_INCREMENT`
    /// - `CPORT_PANIC_CONTINUE` (bool)
    pub fn from_env() -> Self {
        let base = Self::with_max_threads(env_get("CPORT_MAX_THREADS", DEFAULT_MAX_THREADS));
        let panic_policy = if env_get_bool("CPORT_PANIC_CONTINUE", false) {
            PanicPolicy::Continue
        } else {
            PanicPolicy::ExitWorker
        };
        Self {
            min_threads: env_get("CPORT_MIN_THREADS", base.min_threads),
            concurrency_hint: env_get("CPORT_CONCURRENCY", base.concurrency_hint),
            accept_threshold: env_get_millis("CPORT_ACCEPT_THRESHOLD_MS", base.accept_threshold),
            growth_increment: env_get("CPORT_GROWTH_INCREMENT", base.growth_increment),
            panic_policy,
            ..base
        }
    }

    pub fn min_threads(mut self, n: usize) -> Self {
        self.min_threads = n;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn concurrency_hint(mut self, n: usize) -> Self {
        self.concurrency_hint = n;
        self
    }

    pub fn accept_threshold(mut self, d: Duration) -> Self {
        self.accept_threshold = d;
        self
    }

    pub fn growth_increment(mut self, n: usize) -> Self {
        self.growth_increment = n;
        self
    }

    pub fn dispatch_shutdown_wait(mut self, d: Duration) -> Self {
        self.dispatch_shutdown_wait = d;
        self
    }

    pub fn execution_shutdown_wait(mut self, d: Duration) -> Self {
        self.execution_shutdown_wait = d;
        self
    }

    pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(PoolError::InvalidConfig("max_threads must be at least 1".into()));
        }
        if self.max_threads > POOL_THREAD_CAPACITY {
            return Err(PoolError::InvalidConfig(format!(
                "max_threads exceeds {}",
                POOL_THREAD_CAPACITY
            )));
        }
        if self.min_threads == 0 {
            return Err(PoolError::InvalidConfig("min_threads must be at least 1".into()));
        }
        if self.min_threads > self.max_threads {
            return Err(PoolError::InvalidConfig(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.accept_threshold.is_zero() {
            return Err(PoolError::InvalidConfig("accept_threshold must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_max() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.max_threads, 40);
        assert_eq!(cfg.min_threads, 10);
        assert!(cfg.concurrency_hint >= 1 && cfg.concurrency_hint <= 40);
        assert_eq!(cfg.accept_threshold, Duration::from_millis(100));
        assert!(cfg.validate().is_ok());

        // Small ceilings still get two threads
        let small = ServiceConfig::with_max_threads(4);
        assert_eq!(small.min_threads, 2);
        assert!(small.concurrency_hint <= 4);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let cfg = ServiceConfig::new().min_threads(8).max_threads(4);
        assert!(matches!(cfg.validate(), Err(PoolError::InvalidConfig(_))));

        let cfg = ServiceConfig::new().min_threads(0);
        assert!(cfg.validate().is_err());

        let cfg = ServiceConfig::new().max_threads(POOL_THREAD_CAPACITY + 1);
        assert!(cfg.validate().is_err());

        let cfg = ServiceConfig::new().accept_threshold(Duration::ZERO);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("CPORT_MAX_THREADS", "12");
        std::env::set_var("CPORT_GROWTH_INCREMENT", "5");
        std::env::set_var("CPORT_PANIC_CONTINUE", "yes");
        let cfg = ServiceConfig::from_env();
        std::env::remove_var("CPORT_MAX_THREADS");
        std::env::remove_var("CPORT_GROWTH_INCREMENT");
        std::env::remove_var("CPORT_PANIC_CONTINUE");

        assert_eq!(cfg.max_threads, 12);
        assert_eq!(cfg.min_threads, 3);
        assert_eq!(cfg.growth_increment, 5);
        assert_eq!(cfg.panic_policy, PanicPolicy::Continue);
    }

    #[test]
    fn test_pool_config_builder() {
        let cfg = PoolConfig::new("exec").max_threads(3).panic_policy(PanicPolicy::Continue);
        assert_eq!(cfg.name, "exec");
        assert_eq!(cfg.max_threads, 3);
        assert!(format!("{:?}", cfg).contains("exec"));
    }
}
