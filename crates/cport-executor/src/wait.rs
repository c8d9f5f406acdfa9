//! Wait registrations.
//!
//! Each registration owns one thread, outside both pools, that polls
//! three descriptors:
//!
//! ```text
//!   [0] service stop event   ──▶ exit, no callback
//!   [1] private kill event   ──▶ exit, no callback   (unregister)
//!   [2] caller's handle      ──▶ callback(false)
//!   timeout                  ──▶ callback(true)
//! ```
//!
//! Stop and kill win over the handle when several are ready at once.
//! One-shot registrations exit after their first callback.

use cport_core::error::{PoolError, Result};
use cport_core::observer::PoolObserver;
use cport_core::Latch;
use cport_module::event::wait_any;
use cport_module::Event;

use crate::worker::panic_message;

use std::os::fd::{AsFd, BorrowedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(crate) type WaitCallback = Box<dyn FnMut(bool) + Send + 'static>;

/// Handle to a registered wait, returned by `register_wait`.
#[derive(Debug, Clone)]
pub struct WaitToken {
    id: u64,
    kill: Arc<Event>,
    finished: Arc<Latch>,
}

impl WaitToken {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the registration thread to exit. It does so on its next wake
    /// without invoking the callback again. Idempotent.
    pub fn unregister(&self) -> Result<()> {
        self.kill.set()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_set()
    }

    /// Block until the registration thread has exited. `None` waits
    /// forever. Returns whether it exited.
    pub fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(t) => self.finished.wait_timeout(t),
            None => self.finished.wait_until(None),
        }
    }
}

/// Parameters of one registration.
pub(crate) struct WaitSpec {
    pub(crate) id: u64,
    pub(crate) handle: Option<Event>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) execute_once: bool,
    pub(crate) callback: WaitCallback,
}

/// Spawn the thread for `spec`. `active` counts live registrations.
pub(crate) fn spawn_wait(
    spec: WaitSpec,
    stop: Arc<Event>,
    active: Arc<AtomicUsize>,
    observer: Arc<dyn PoolObserver>,
) -> Result<WaitToken> {
    if spec.timeout.is_none() && spec.handle.is_none() {
        return Err(PoolError::InvalidArgument(
            "a wait without a handle needs a finite timeout",
        ));
    }

    let kill = Arc::new(Event::manual()?);
    let finished = Arc::new(Latch::new());
    let token = WaitToken {
        id: spec.id,
        kill: kill.clone(),
        finished: finished.clone(),
    };

    active.fetch_add(1, Ordering::SeqCst);
    let thread_active = active.clone();
    let thread_observer = observer.clone();
    let spawned = thread::Builder::new()
        .name(format!("cport-wait-{}", spec.id))
        .spawn(move || {
            let mut done = Finished {
                id: spec.id,
                invocations: 0,
                active: thread_active,
                finished,
                observer: thread_observer,
            };
            run(spec, &stop, &kill, &mut done);
        });

    match spawned {
        Ok(_detached) => {
            observer.wait_registered(token.id);
            Ok(token)
        }
        Err(e) => {
            active.fetch_sub(1, Ordering::SeqCst);
            Err(PoolError::Spawn(e))
        }
    }
}

/// Exit bookkeeping, run on every path out of the registration thread.
struct Finished {
    id: u64,
    invocations: u64,
    active: Arc<AtomicUsize>,
    finished: Arc<Latch>,
    observer: Arc<dyn PoolObserver>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.set();
        self.observer.wait_finished(self.id, self.invocations);
    }
}

fn run(spec: WaitSpec, stop: &Event, kill: &Event, done: &mut Finished) {
    let outcome = watch(spec, stop, kill, done);
    settle(done, outcome);
}

/// Report a failed wait before the exit bookkeeping runs.
fn settle(done: &Finished, outcome: Result<()>) {
    if let Err(e) = outcome {
        done.observer.wait_failed(done.id, &e.to_string());
    }
}

fn watch(mut spec: WaitSpec, stop: &Event, kill: &Event, done: &mut Finished) -> Result<()> {
    let mut fds: Vec<BorrowedFd<'_>> = vec![stop.as_fd(), kill.as_fd()];
    if let Some(handle) = &spec.handle {
        fds.push(handle.as_fd());
    }

    loop {
        let timed_out = match wait_any(&fds, spec.timeout)? {
            Some(0) | Some(1) => return Ok(()),
            Some(_) => match spec.handle.as_ref() {
                Some(handle) => {
                    // Another waiter took the auto-reset signal
                    if !handle.consume()? {
                        continue;
                    }
                    false
                }
                None => return Ok(()),
            },
            None => true,
        };

        done.invocations += 1;
        let callback = &mut spec.callback;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(timed_out))) {
            done.observer
                .handler_panicked("cport-wait", spec.id, &panic_message(&payload));
            return Ok(());
        }
        if spec.execute_once {
            return Ok(());
        }
    }
}
