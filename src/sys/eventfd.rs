use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::syscall;

pub const EFD_CLOEXEC: i32 = libc::EFD_CLOEXEC;
pub const EFD_NONBLOCK: i32 = libc::EFD_NONBLOCK;

/// Owned `eventfd(2)` descriptor, the wakeup primitive of an event loop.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create an eventfd with initval: 0 and flags: EFD_CLOEXEC | EFD_NONBLOCK
    /// view: http://man7.org/linux/man-pages/man2/eventfd.2.html
    pub fn new() -> io::Result<EventFd> {
        let flags = EFD_CLOEXEC | EFD_NONBLOCK;
        EventFd::with_options(0, flags)
    }

    pub fn with_options(initval: u32, flags: i32) -> io::Result<EventFd> {
        let fd = syscall!(eventfd(initval, flags))?;
        Ok(EventFd { fd })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = syscall!(read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8))?;
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eventfd read returned a short counter",
            ));
        }
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf: [u8; 8] = val.to_ne_bytes();
        let n = syscall!(write(self.fd, buf.as_ptr() as *const libc::c_void, 8))?;
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "eventfd write returned a short counter",
            ));
        }
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn read_would_block_when_empty() {
        let eventfd = EventFd::new().unwrap();
        let err = eventfd.read().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
