use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::cmp;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP};
use libc::{EPOLLIN, EPOLLOUT, EPOLLPRI};
use libc::{EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD};

use crate::ready::Ready;
use crate::sys::syscall;

/// Thin wrapper over an `epoll(7)` instance.
///
/// Registrations are level triggered and carry the registered fd in the
/// event's user-data slot, so a wait result maps straight back to the
/// descriptor it fired for.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    /// Blocks until at least one registered fd is ready or `timeout` elapses.
    ///
    /// `evts` is filled with at most `evts.capacity()` events; `None` blocks
    /// indefinitely.
    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), i32::MAX as u128) as c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, op, fd, &mut info))?;

        Ok(())
    }
}

fn ready_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLPRI;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Grows the backing storage so the next `wait` can report twice as many
    /// events.
    pub fn double_capacity(&mut self) {
        let cap = self.events.capacity();
        self.events.reserve_exact(cap);
    }

    /// Returns the fd and readiness of the event at `idx`, or `None` if out
    /// of bounds.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<(RawFd, Ready)> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                kind = kind | Ready::readable();
            }

            if (epoll & EPOLLOUT) != 0 {
                kind = kind | Ready::writable();
            }

            // EPOLLERR usually means a socket error happened
            if (epoll & EPOLLERR) != 0 {
                kind = kind | Ready::error();
            }

            if (epoll & EPOLLHUP) != 0 {
                kind = kind | Ready::hup();
            }

            (event.u64 as RawFd, kind)
        })
    }
}
