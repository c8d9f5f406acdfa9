//! Completion queue abstraction.
//!
//! A `CompletionQueue` lets many threads block waiting for the next
//! packet. Producers post synthetic completions (or exit sentinels);
//! associated descriptors produce readiness completions.
//!
//! # Implementors
//!
//! - `PortQueue` (default, cport-module): in-process FIFO with an
//!   IOCP-style concurrency gate and an epoll readiness reactor.

use crate::error::Result;
use crate::packet::{Packet, Wait};
use std::os::fd::BorrowedFd;
use std::time::Duration;

/// Multi-producer, multi-consumer queue of packets.
///
/// **Contract:**
/// - `post()` never blocks.
/// - `wait()` returns `Wait::Closed` once `close()` has been called,
///   for every waiter, present and future.
/// - A thread that received a packet from `wait()` holds one
///   concurrency slot until it calls `wait()` again or `leave()`.
/// - Packets are delivered FIFO.
pub trait CompletionQueue<P>: Send + Sync {
    /// Enqueue a packet. Fails with `QueueClosed` after `close()`.
    fn post(&self, packet: Packet<P>) -> Result<()>;

    /// Block until a packet is available, the timeout expires or the
    /// queue closes. `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> Wait<P>;

    /// Bind a descriptor; readiness on it is delivered as completions
    /// tagged with `key`. The queue keeps its own duplicate of `fd`.
    fn associate(&self, fd: BorrowedFd<'_>, key: usize) -> Result<()>;

    /// The calling thread stops consuming: release its concurrency slot.
    fn leave(&self);

    /// Close the queue, wake every waiter and drop pending packets.
    /// Returns the number of dropped completions (sentinels not counted).
    fn close(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// Maximum number of threads allowed to run concurrently.
    fn concurrency(&self) -> usize;

    /// Packets waiting to be dequeued.
    fn pending(&self) -> usize;
}
