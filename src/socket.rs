use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{self, c_int, c_void, socklen_t};
use log::error;

use crate::inet_address::InetAddress;
use crate::sys::syscall;

const LISTEN_BACKLOG: c_int = 1024;

/// Exclusive owner of a TCP socket descriptor.
///
/// The fd is closed when the `Socket` is dropped; nothing else in the crate
/// ever closes an fd it did not create.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

fn setsockopt(fd: RawFd, level: c_int, opt: c_int, val: c_int) -> io::Result<()> {
    let payload = &val as *const c_int as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        opt,
        payload,
        mem::size_of::<c_int>() as socklen_t
    ))?;
    Ok(())
}

impl Socket {
    /// Creates a non-blocking, close-on-exec IPv4 stream socket.
    pub fn new_nonblocking() -> io::Result<Socket> {
        let fd = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP
        ))?;

        Ok(Socket { fd })
    }

    /// Adopts an already-created fd, typically one returned by `accept4`.
    pub(crate) fn from_raw(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind_address(&self, local_addr: &InetAddress) -> io::Result<()> {
        syscall!(bind(
            self.fd,
            local_addr.as_sockaddr_in() as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as socklen_t
        ))?;
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd, LISTEN_BACKLOG))?;
        Ok(())
    }

    /// Accepts one pending connection.
    ///
    /// The returned socket is non-blocking and close-on-exec. `WouldBlock`
    /// means the backlog is empty.
    pub fn accept(&self) -> io::Result<(Socket, InetAddress)> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;

        let fd = syscall!(accept4(
            self.fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;

        Ok((Socket::from_raw(fd), InetAddress::from_sockaddr_in(addr)))
    }

    /// Half-closes the write side, letting the peer drain what is in flight.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR))?;
        Ok(())
    }

    /// The locally bound address, resolved with `getsockname(2)`.
    pub fn local_addr(&self) -> io::Result<InetAddress> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;

        syscall!(getsockname(
            self.fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len
        ))?;

        Ok(InetAddress::from_sockaddr_in(addr))
    }

    /// The pending socket error, if any, cleared by the query.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut optval: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;

        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut c_int as *mut c_void,
            &mut len
        ))?;

        if optval == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(optval)))
        }
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Err(e) = syscall!(close(self.fd)) {
            error!("close fd={} failed: {}", self.fd, e);
        }
    }
}
