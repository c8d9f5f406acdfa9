//! `Event`: an eventfd-backed wait handle.
//!
//! Models a manual- or auto-reset event. "Set" means the eventfd
//! counter is non-zero, so the descriptor polls readable while set and
//! can be handed to any poll/epoll based waiter (wait registrations,
//! `CompletionQueue::associate`).
//!
//! - Manual reset: stays set until `reset()`; every waiter sees it.
//! - Auto reset: `consume()` takes the signal; exactly one consumer
//!   wins per `set()` burst.

use cport_core::error::{PoolError, Result};
use nix::errno::Errno;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Manual,
    Auto,
}

#[derive(Debug)]
pub struct Event {
    fd: OwnedFd,
    mode: ResetMode,
}

impl Event {
    /// Create a new event, optionally already set.
    pub fn new(mode: ResetMode, initially_set: bool) -> Result<Self> {
        let fd = unsafe {
            libc::eventfd(
                initially_set as libc::c_uint,
                libc::EFD_NONBLOCK | libc::EFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(PoolError::Os(Errno::last()));
        }
        // Safety: eventfd just returned a fresh descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd, mode })
    }

    pub fn manual() -> Result<Self> {
        Self::new(ResetMode::Manual, false)
    }

    pub fn auto() -> Result<Self> {
        Self::new(ResetMode::Auto, false)
    }

    #[inline]
    pub fn mode(&self) -> ResetMode {
        self.mode
    }

    /// Signal the event.
    pub fn set(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            Ok(_) => Ok(()),
            // Counter saturated: the event is set already.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the event. Returns whether it was set.
    pub fn reset(&self) -> Result<bool> {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            Ok(_) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(wait_any(&[self.fd.as_fd()], Some(Duration::ZERO)), Ok(Some(_)))
    }

    /// Called after a waiter saw the descriptor readable. An auto-reset
    /// event is cleared and `true` returned only to the waiter that
    /// actually took the signal; a manual-reset event reports its state.
    pub fn consume(&self) -> Result<bool> {
        match self.mode {
            ResetMode::Auto => self.reset(),
            ResetMode::Manual => Ok(self.is_set()),
        }
    }

    /// Block until the event is set (and consumed, for auto reset) or
    /// the timeout expires. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if wait_any(&[self.fd.as_fd()], remaining)?.is_none() {
                return Ok(false);
            }
            if self.consume()? {
                return Ok(true);
            }
        }
    }

    /// Duplicate the descriptor. Both handles refer to the same event.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = self
            .fd
            .try_clone()
            .map_err(|e| PoolError::Os(Errno::from_raw(e.raw_os_error().unwrap_or(0))))?;
        Ok(Self { fd, mode: self.mode })
    }
}

impl AsFd for Event {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Poll `fds` for readability. Returns the index of the first readable
/// descriptor (lowest index wins when several are ready), or `None` on
/// timeout. `None` timeout waits forever. Interrupted polls resume with
/// the remaining time.
pub fn wait_any(fds: &[BorrowedFd<'_>], timeout: Option<Duration>) -> Result<Option<usize>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(d) => millis_ceil(d.saturating_duration_since(Instant::now())),
        };
        let ret = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
        };
        match Errno::result(ret) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                // POLLHUP/POLLERR count as a wake as well: the waiter
                // must not spin on a dead descriptor.
                return Ok(pollfds.iter().position(|p| p.revents != 0));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn millis_ceil(d: Duration) -> libc::c_int {
    let ms = d.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_manual_stays_set() {
        let ev = Event::manual().unwrap();
        assert!(!ev.is_set());
        ev.set().unwrap();
        assert!(ev.is_set());
        assert!(ev.consume().unwrap());
        // Manual reset: consuming does not clear it
        assert!(ev.is_set());
        assert!(ev.reset().unwrap());
        assert!(!ev.is_set());
    }

    #[test]
    fn test_auto_single_consumer() {
        let ev = Event::auto().unwrap();
        ev.set().unwrap();
        ev.set().unwrap();
        assert!(ev.consume().unwrap());
        // Both sets collapse into one signal
        assert!(!ev.consume().unwrap());
    }

    #[test]
    fn test_clone_shares_state() {
        let ev = Event::manual().unwrap();
        let dup = ev.try_clone().unwrap();
        assert_ne!(ev.as_raw_fd(), dup.as_raw_fd());
        ev.set().unwrap();
        assert!(dup.is_set());
        assert_eq!(dup.mode(), ResetMode::Manual);
    }

    #[test]
    fn test_wait_timeout_and_wake() {
        let ev = Arc::new(Event::auto().unwrap());
        assert!(!ev.wait(Some(Duration::from_millis(10))).unwrap());

        let setter = {
            let ev = ev.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ev.set().unwrap();
            })
        };
        assert!(ev.wait(Some(Duration::from_secs(5))).unwrap());
        setter.join().unwrap();
    }

    #[test]
    fn test_wait_any_priority() {
        let a = Event::manual().unwrap();
        let b = Event::manual().unwrap();
        b.set().unwrap();
        let fds = [a.as_fd(), b.as_fd()];
        assert_eq!(wait_any(&fds, Some(Duration::ZERO)).unwrap(), Some(1));
        a.set().unwrap();
        assert_eq!(wait_any(&fds, Some(Duration::ZERO)).unwrap(), Some(0));
    }

    #[test]
    fn test_millis_rounds_up() {
        assert_eq!(millis_ceil(Duration::from_micros(1)), 1);
        assert_eq!(millis_ceil(Duration::ZERO), 0);
        assert_eq!(millis_ceil(Duration::from_secs(u64::MAX)), libc::c_int::MAX);
    }
}
