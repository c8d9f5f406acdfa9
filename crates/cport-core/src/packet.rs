//! Packets carried by a completion queue.
//!
//! Every worker loop reads `Packet`s. A `Completion` is either a
//! synthetic message posted by the application or a readiness event
//! produced for an associated descriptor. `Exit` is the sentinel that
//! tells exactly one consumer to leave its loop.

use std::os::fd::RawFd;

/// Message read by a worker loop.
#[derive(Debug)]
pub enum Packet<P> {
    /// A completion to dispatch to the pool's handler.
    Completion(Completion<P>),
    /// Sentinel: the consumer that reads it exits.
    Exit,
}

impl<P> Packet<P> {
    /// Synthetic completion carrying `payload`.
    pub fn post(key: usize, bytes: u32, payload: P) -> Self {
        Packet::Completion(Completion {
            key,
            bytes,
            context: Context::Payload(payload),
        })
    }

    #[inline]
    pub fn is_exit(&self) -> bool {
        matches!(self, Packet::Exit)
    }
}

/// A single completion: application key, byte count and context.
#[derive(Debug)]
pub struct Completion<P> {
    pub key: usize,
    pub bytes: u32,
    pub context: Context<P>,
}

impl<P> Completion<P> {
    /// Take the payload out of the context, if there is one.
    pub fn into_payload(self) -> Option<P> {
        match self.context {
            Context::Payload(p) => Some(p),
            _ => None,
        }
    }
}

/// What a completion carries besides its key.
#[derive(Debug)]
pub enum Context<P> {
    Empty,
    Payload(P),
    /// Readiness on an associated descriptor.
    Ready(Readiness),
}

/// Readiness event for a descriptor bound with `associate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The descriptor the caller associated (not the queue's duplicate).
    pub fd: RawFd,
    /// Raw epoll event bits.
    pub events: u32,
}

/// Outcome of a blocking wait on a completion queue.
#[derive(Debug)]
pub enum Wait<P> {
    Packet(Packet<P>),
    Timeout,
    /// The queue was closed while (or before) waiting. Consumers treat
    /// this as an exit signal.
    Closed,
}
