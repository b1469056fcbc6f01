use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::sys::EventFd;

/// Cross-thread wakeup handle for an event loop.
///
/// Writing to the eventfd makes the loop's poller return immediately; the
/// loop drains the counter through a no-op read channel. Both directions
/// treat `WouldBlock` as success, a saturated counter is still a wakeup.
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let eventfd = EventFd::new()?;

        Ok(Waker {
            inner: Arc::new(eventfd),
        })
    }

    pub fn wakeup(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
