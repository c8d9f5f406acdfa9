//! # cport-core: Trait definitions for cport
//!
//! This crate defines the seams of the worker-pool system. Each trait
//! models one collaborator the pools talk to; default implementations
//! live in `cport-module`, the pools themselves in `cport-executor`.
//!
//! | Trait               | Default impl (cport-module) |
//! |---------------------|-----------------------------|
//! | `CompletionQueue`   | `PortQueue`                 |
//! | `CompletionHandler` | closures / executor handlers |
//! | `Clock`             | `MonotonicClock`            |
//! | `PoolObserver`      | `TracingObserver`           |
//!
//! No OS code lives here. Everything in this crate is plain data,
//! traits, and the small `Latch` primitive the pools share.

pub mod clock;
pub mod env;
pub mod error;
pub mod handler;
pub mod latch;
pub mod observer;
pub mod packet;
pub mod queue;

pub use clock::Clock;
pub use error::{PoolError, Result};
pub use handler::{CompletionHandler, HandlerAction};
pub use latch::Latch;
pub use observer::{ExitReason, NoopObserver, PoolObserver};
pub use packet::{Completion, Context, Packet, Readiness, Wait};
pub use queue::CompletionQueue;
