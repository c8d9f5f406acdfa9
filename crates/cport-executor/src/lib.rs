//! # cport-executor: pools, the autoscaling service, wait registrations
//!
//! ```text
//!   AdaptiveWorkerService
//!     ├── DispatchPool   CompletionPortPool<WorkItem>    1 thread
//!     ├── ExecutionPool  CompletionPortPool<Dispatched>  min..max threads
//!     └── wait registrations (one thread each, outside both pools)
//!
//!   CompletionPortPool<P>
//!     ├── CompletionQueue<P>   (PortQueue, or attached)
//!     ├── ThreadRegistry       worker id → join handle + exit latch
//!     └── worker_loop × N      wait → handler → loop / exit
//! ```
//!
//! Everything here is generic over the `cport-core` traits; the
//! defaults come from `cport-module`.

pub mod config;
pub mod pool;
pub mod scaling;
pub mod service;
pub mod wait;
pub mod work_item;

mod backlog;
mod registry;
mod worker;

pub use config::{PanicPolicy, PoolConfig, ServiceConfig};
pub use pool::{CompletionPortPool, ShutdownReport};
pub use scaling::ScalingDecision;
pub use service::{AdaptiveWorkerService, ServiceState, ServiceStats};
pub use wait::WaitToken;
pub use work_item::WorkItem;
