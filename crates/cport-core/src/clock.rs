//! Monotonic tick source.
//!
//! The dispatcher measures acceptance latency through a `Clock` so the
//! measurement can be replaced in tests.

use std::time::Duration;

/// Monotonic clock. `now()` never goes backwards.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    /// Time elapsed since `earlier` (a previous `now()`), saturating.
    fn since(&self, earlier: Duration) -> Duration {
        self.now().saturating_sub(earlier)
    }
}
