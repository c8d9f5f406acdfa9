//! Pool worker loop
//!
//! ```text
//! Waiting ──completion──▶ Dispatching ──Continue──▶ Waiting
//!    │                        │
//!    │ Exit sentinel           │ Exit / panic (ExitWorker)
//!    │ (pool above target)     ▼
//!    ├──────────────────────▶ Exiting ◀── queue closed
//! ```
//!
//! Cleanup runs from a drop guard, so it happens on every exit path:
//! leave the queue's concurrency gate, retire from the registry,
//! signal the exit latch, notify the observer.

use crate::config::PanicPolicy;
use crate::pool::PoolShared;

use cport_core::handler::HandlerAction;
use cport_core::observer::ExitReason;
use cport_core::packet::{Packet, Wait};
use cport_core::queue::CompletionQueue;
use cport_core::Latch;

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

thread_local! {
    /// Id of the pool this thread works for (0 = none)
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

/// Id of the pool the calling thread belongs to, 0 if none
#[inline]
pub(crate) fn current_pool_id() -> u64 {
    CURRENT_POOL.with(|c| c.get())
}

struct ExitGuard<'a, P: Send + 'static> {
    shared: &'a PoolShared<P>,
    queue: &'a Arc<dyn CompletionQueue<P>>,
    id: u64,
    exited: &'a Latch,
    reason: ExitReason,
}

impl<P: Send + 'static> Drop for ExitGuard<'_, P> {
    fn drop(&mut self) {
        self.queue.leave();
        self.shared.retire(self.id);
        self.exited.set();
        self.shared
            .config
            .observer
            .thread_exited(&self.shared.config.name, self.id, self.reason);
        CURRENT_POOL.with(|c| c.set(0));
    }
}

pub(crate) fn worker_loop<P: Send + 'static>(
    shared: Arc<PoolShared<P>>,
    queue: Arc<dyn CompletionQueue<P>>,
    id: u64,
    exited: Arc<Latch>,
) {
    CURRENT_POOL.with(|c| c.set(shared.id));
    let observer = shared.config.observer.clone();
    let name = shared.config.name.as_str();
    observer.thread_started(name, id);

    let mut guard = ExitGuard {
        shared: &shared,
        queue: &queue,
        id,
        exited: &exited,
        reason: ExitReason::QueueClosed,
    };

    loop {
        match queue.wait(None) {
            Wait::Packet(Packet::Exit) => {
                // Sentinels only end a thread while the pool is above
                // its target; extras are ignored.
                if shared.claim_exit(id) {
                    guard.reason = ExitReason::Sentinel;
                    break;
                }
            }
            Wait::Packet(Packet::Completion(completion)) => {
                let handler = &shared.handler;
                if handler.releases_slot() {
                    queue.leave();
                }
                match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(completion))) {
                    Ok(HandlerAction::Continue) => {}
                    Ok(HandlerAction::Exit) => {
                        guard.reason = ExitReason::Handler;
                        break;
                    }
                    Err(payload) => {
                        observer.handler_panicked(name, id, &panic_message(&payload));
                        if shared.config.panic_policy == PanicPolicy::ExitWorker {
                            guard.reason = ExitReason::Panicked;
                            break;
                        }
                    }
                }
            }
            Wait::Timeout => {}
            Wait::Closed => {
                guard.reason = ExitReason::QueueClosed;
                break;
            }
        }
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let p = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&p), "static");

        let p = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(&p), "formatted 7");

        let p = panic::catch_unwind(|| std::panic::panic_any(13u8)).unwrap_err();
        assert_eq!(panic_message(&p), "non-string panic payload");
    }

    #[test]
    fn test_outside_pool() {
        assert_eq!(current_pool_id(), 0);
    }
}
