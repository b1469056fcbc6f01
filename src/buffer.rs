use std::io;
use std::os::unix::io::RawFd;

use libc::{self, c_void};

use crate::sys::syscall;

/// Size of the reserved head area, available to `prepend`.
pub const CHEAP_PREPEND: usize = 8;
/// Initial size of the writable area.
pub const INITIAL_SIZE: usize = 1024;

/// A resizable byte buffer shaped for non-blocking socket I/O.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=      reader_index   <=   writer_index    <=   size
/// ```
///
/// Data is appended at `writer_index` and consumed from `reader_index`. The
/// head area lets a protocol layer stamp a length field in front of content
/// that is already in place, without shifting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    buffer: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buffer: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buffer.len() - self.writer_index
    }

    /// Everything in front of `reader_index` counts as head slack.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buffer[self.reader_index..self.writer_index]
    }

    /// Consumes `len` bytes; consuming past the end resets the buffer.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes `len` bytes and returns them as a `String` (lossy for
    /// non-UTF-8 input).
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let ret = String::from_utf8_lossy(&self.buffer[self.reader_index..self.reader_index + len])
            .into_owned();
        self.retrieve(len);
        ret
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Appends `data` after the readable region, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buffer[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` into the head slack, directly in front of the readable
    /// region.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than `prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buffer[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    /// Drains the fd into the buffer with one `readv(2)`.
    ///
    /// Reads scatter into the writable tail and a 64 KiB stack spill; spill
    /// bytes are appended afterwards, so the buffer grows at most once per
    /// call no matter how much the kernel delivers.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; 65536];

        let writable = self.writable_bytes();
        let mut iovs = [
            libc::iovec {
                iov_base: unsafe { self.buffer.as_mut_ptr().add(self.writer_index) } as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut c_void,
                iov_len: extra_buf.len(),
            },
        ];

        let iov_cnt = if writable < extra_buf.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iovs.as_mut_ptr(), iov_cnt))? as usize;

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buffer.len();
            self.append(&extra_buf[..n - writable]);
        }

        Ok(n)
    }

    /// Writes the readable region to the fd; consumed bytes are NOT retired,
    /// the caller retires what the kernel accepted.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let n = syscall!(write(
            fd,
            self.buffer.as_ptr().wrapping_add(self.reader_index) as *const c_void,
            self.readable_bytes()
        ))?;

        Ok(n as usize)
    }

    // Growth policy: shift the readable region down onto the head slack when
    // that frees enough room, otherwise resize to writer_index + len.
    fn make_space(&mut self, len: usize) {
        if self.prependable_bytes() - CHEAP_PREPEND + self.writable_bytes() >= len {
            let readable = self.readable_bytes();
            self.buffer
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        } else {
            self.buffer.resize(self.writer_index + len, 0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello, world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.peek(), b"hello, world");

        assert_eq!(buf.retrieve_as_string(5), "hello");
        assert_eq!(buf.readable_bytes(), 7);
        assert_eq!(buf.retrieve_all_as_string(), ", world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grow_preserves_readable_region() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.retrieve(4);

        // Needs more than writable(6) + slack(4), so the vector resizes.
        let big = vec![b'x'; 64];
        buf.append(&big);

        assert_eq!(buf.readable_bytes(), 6 + 64);
        assert_eq!(&buf.peek()[..6], b"456789");
        assert!(buf.peek()[6..].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn shift_reuses_head_slack_without_resizing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'a'; 16]);
        buf.retrieve(10);

        // 6 writable after the shift + 10 reclaimed slack fits 12 more.
        buf.append(&[b'b'; 12]);
        assert_eq!(buf.readable_bytes(), 18);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(&buf.peek()[..6], &[b'a'; 6]);
    }

    #[test]
    fn prepend_uses_reserved_head() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());

        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn read_fd_spills_into_extra_buf() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let written = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(written as usize, payload.len());

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
