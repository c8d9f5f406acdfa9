//! Thread registry: the live workers of one pool.
//!
//! Mutated only under the pool's state mutex. Each entry carries an
//! exit latch shared with the worker, so shutdown can wait on a
//! worker's lifetime without touching the (concurrently mutated) entry.

use cport_core::Latch;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

pub(crate) struct PoolThread {
    pub(crate) os_id: ThreadId,
    pub(crate) exited: Arc<Latch>,
    // Dropped (detached) when the worker retires itself.
    pub(crate) _handle: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct ThreadRegistry {
    threads: HashMap<u64, PoolThread>,
}

impl ThreadRegistry {
    pub(crate) fn insert(&mut self, id: u64, thread: PoolThread) {
        self.threads.insert(id, thread);
    }

    /// Remove `id`. False if it was already gone (retired or detached).
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.threads.remove(&id).is_some()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn contains_os_thread(&self, os_id: ThreadId) -> bool {
        self.threads.values().any(|t| t.os_id == os_id)
    }

    /// Exit latches of every thread except `skip` (the caller).
    pub(crate) fn exit_latches_except(&self, skip: ThreadId) -> Vec<Arc<Latch>> {
        self.threads
            .values()
            .filter(|t| t.os_id != skip)
            .map(|t| t.exited.clone())
            .collect()
    }

    /// Forget every entry. The threads keep running and retire on their
    /// own; their `remove` then finds nothing.
    pub(crate) fn detach_all(&mut self) -> usize {
        let n = self.threads.len();
        self.threads.clear();
        n
    }
}
