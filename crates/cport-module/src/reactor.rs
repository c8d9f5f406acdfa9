//! Readiness reactor backing `PortQueue::associate`.
//!
//! One epoll set per queue plus a wake eventfd. The reactor thread is
//! spawned on the first association and turns every readiness edge on
//! an associated descriptor into a completion posted to the queue.
//!
//! ```text
//! loop {
//!     epoll_wait(-1)
//!     wake token?        → exit
//!     registration[tok]  → sink(key, Readiness { fd, events })
//!     sink says closed?  → exit
//! }
//! ```

use cport_core::error::{PoolError, Result};
use cport_core::packet::Readiness;
use nix::errno::Errno;

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

/// epoll token reserved for the wake eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 64;

/// Called by the reactor thread for each readiness edge.
/// Returning `false` stops the reactor (the queue is gone or closed).
pub(crate) type ReadinessSink = Box<dyn Fn(usize, Readiness) -> bool + Send>;

struct Registration {
    key: usize,
    /// Descriptor as the caller knows it.
    fd: RawFd,
    /// Our duplicate; keeps the open file description registered.
    _owned: OwnedFd,
}

struct ReactorShared {
    epoll: OwnedFd,
    wake: OwnedFd,
    registrations: Mutex<Vec<Registration>>,
}

pub(crate) struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Option<(JoinHandle<()>, ThreadId)>,
}

impl Reactor {
    /// Create the epoll set and wake eventfd. No thread yet.
    pub(crate) fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(PoolError::Os(Errno::last()));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        let wfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wfd < 0 {
            return Err(PoolError::Os(Errno::last()));
        }
        let wake = unsafe { OwnedFd::from_raw_fd(wfd) };

        epoll_add(&epoll, wake.as_raw_fd(), libc::EPOLLIN as u32, WAKE_TOKEN)?;

        Ok(Self {
            shared: Arc::new(ReactorShared {
                epoll,
                wake,
                registrations: Mutex::new(Vec::new()),
            }),
            thread: None,
        })
    }

    /// Register `fd` for edge-triggered read/write readiness under `key`.
    /// Starts the reactor thread on first use, handing it `sink`.
    pub(crate) fn add(
        &mut self,
        fd: BorrowedFd<'_>,
        key: usize,
        sink: impl FnOnce() -> ReadinessSink,
    ) -> Result<()> {
        let owned = fd
            .try_clone_to_owned()
            .map_err(|e| PoolError::Os(Errno::from_raw(e.raw_os_error().unwrap_or(0))))?;
        let dup_raw = owned.as_raw_fd();

        let token = {
            let mut regs = self
                .shared
                .registrations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            regs.push(Registration {
                key,
                fd: fd.as_raw_fd(),
                _owned: owned,
            });
            (regs.len() - 1) as u64
        };

        let interest = libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET;
        epoll_add(&self.shared.epoll, dup_raw, interest as u32, token)?;

        if self.thread.is_none() {
            let shared = self.shared.clone();
            let sink = sink();
            let handle = thread::Builder::new()
                .name("cport-reactor".into())
                .spawn(move || reactor_loop(shared, sink))
                .map_err(PoolError::Spawn)?;
            let id = handle.thread().id();
            self.thread = Some((handle, id));
        }
        Ok(())
    }

    pub(crate) fn registrations(&self) -> usize {
        self.shared
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stop the reactor thread and wait for it, unless called from the
    /// reactor thread itself.
    pub(crate) fn stop(&mut self) {
        let Some((handle, id)) = self.thread.take() else {
            return;
        };
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.shared.wake.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
        if thread::current().id() != id {
            let _ = handle.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn epoll_add(epoll: &OwnedFd, fd: RawFd, events: u32, token: u64) -> Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    let ret = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) };
    Errno::result(ret).map(drop).map_err(PoolError::Os)
}

fn reactor_loop(shared: Arc<ReactorShared>, sink: ReadinessSink) {
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    loop {
        let n = unsafe {
            libc::epoll_wait(
                shared.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                -1,
            )
        };
        let n = match Errno::result(n) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        };

        for ev in &events[..n] {
            // epoll_event is packed on x86_64: copy fields out by value.
            let token = ev.u64;
            let bits = ev.events;
            if token == WAKE_TOKEN {
                return;
            }
            let target = {
                let regs = shared
                    .registrations
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                regs.get(token as usize).map(|r| (r.key, r.fd))
            };
            if let Some((key, fd)) = target {
                if !sink(key, Readiness { fd, events: bits }) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_readiness_reaches_sink() {
        let mut reactor = Reactor::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(efd >= 0);
        let efd = unsafe { OwnedFd::from_raw_fd(efd) };

        reactor
            .add(efd.as_fd(), 42, move || {
                Box::new(move |key, r| tx.send((key, r)).is_ok())
            })
            .unwrap();
        assert_eq!(reactor.registrations(), 1);

        // An eventfd is writable from the start: expect an initial edge
        let (key, ready) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(key, 42);
        assert_eq!(ready.fd, efd.as_raw_fd());

        reactor.stop();
    }

    #[test]
    fn test_registrations_survive_poisoned_lock() {
        let mut reactor = Reactor::new().unwrap();
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(efd >= 0);
        let efd = unsafe { OwnedFd::from_raw_fd(efd) };
        reactor
            .add(efd.as_fd(), 7, || Box::new(|_, _| true))
            .unwrap();

        let shared = reactor.shared.clone();
        let poisoned = thread::spawn(move || {
            let _regs = shared.registrations.lock().unwrap();
            panic!("poison the registration lock");
        })
        .join();
        assert!(poisoned.is_err());
        assert!(reactor.shared.registrations.is_poisoned());
        assert_eq!(reactor.registrations(), 1);

        reactor.stop();
    }
}
