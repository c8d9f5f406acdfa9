//! # cport-module: Default implementations
//!
//! One default implementation for every trait in `cport-core`.
//!
//! | Trait             | Default Impl      |
//! |-------------------|-------------------|
//! | CompletionQueue   | PortQueue         |
//! | Clock             | MonotonicClock    |
//! | PoolObserver      | TracingObserver   |
//!
//! Plus `Event`, the eventfd wait handle used by wait registrations.
//! Linux only: the queue's readiness reactor is epoll, events are
//! eventfds.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod reactor;
        pub mod event;
        pub mod port_queue;
    } else {
        compile_error!("cport-module requires Linux (epoll + eventfd)");
    }
}

pub mod monotonic_clock;
pub mod tracing_observer;

pub use event::{Event, ResetMode};
pub use monotonic_clock::MonotonicClock;
pub use port_queue::PortQueue;
pub use tracing_observer::TracingObserver;
