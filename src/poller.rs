use std::io;
use std::os::unix::io::RawFd;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, error, warn};

use crate::channel::{Channel, Membership};
use crate::sys;
use crate::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;
// The result buffer doubles when a wait saturates it, up to this ceiling.
const MAX_EVENT_LIST_SIZE: usize = 65536;

/// I/O multiplexer: tracks every channel registered with one loop and blocks
/// for readiness on their behalf.
///
/// Registration failures against the OS multiplexer are unrecoverable
/// (`EPOLL_CTL_ADD`/`MOD` log and terminate); deregistration failures are
/// logged and ignored.
pub struct Poller {
    epoll: sys::Epoll,
    channels: Mutex<IndexMap<RawFd, Arc<Channel>>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        if std::env::var_os("MUDUO_USE_POOL").is_some() {
            warn!("MUDUO_USE_POOL is set but only the epoll backend is implemented");
        }

        Ok(Poller {
            epoll: sys::Epoll::new()?,
            channels: Mutex::new(IndexMap::new()),
        })
    }

    pub(crate) fn new_events() -> sys::Events {
        sys::Events::with_capacity(INIT_EVENT_LIST_SIZE)
    }

    /// Blocks until readiness or timeout; fills `active_channels` with every
    /// channel that has pending events and stamps their observed event sets.
    ///
    /// Returns the poll return time. An `EINTR` wakeup reports zero events.
    pub(crate) fn poll(
        &self,
        events: &mut sys::Events,
        timeout: Option<Duration>,
        active_channels: &mut Vec<Arc<Channel>>,
    ) -> Timestamp {
        match self.epoll.wait(events, timeout) {
            Ok(n) => {
                if n > 0 {
                    debug!("{} events happened", n);

                    let channels = self.channels.lock().unwrap();
                    for i in 0..n {
                        if let Some((fd, ready)) = events.get(i) {
                            if let Some(channel) = channels.get(&fd) {
                                channel.set_revents(ready);
                                active_channels.push(channel.clone());
                            }
                        }
                    }
                }

                if n == events.capacity() && events.capacity() < MAX_EVENT_LIST_SIZE {
                    events.double_capacity();
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!("poller wait error: {}", e),
        }

        Timestamp::now()
    }

    /// Applies the channel's current interest set to the OS multiplexer,
    /// registering, modifying or deregistering as its membership state
    /// dictates.
    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let index = channel.index();

        match index {
            Membership::New | Membership::Deleted => {
                if index == Membership::New {
                    self.channels.lock().unwrap().insert(fd, channel.clone());
                }

                channel.set_index(Membership::Added);
                if let Err(e) = self.epoll.add(fd, channel.events()) {
                    error!("epoll_ctl add fd={} error: {}", fd, e);
                    process::abort();
                }
            }
            Membership::Added => {
                if channel.is_none_event() {
                    if let Err(e) = self.epoll.delete(fd) {
                        error!("epoll_ctl del fd={} error: {}", fd, e);
                    }
                    channel.set_index(Membership::Deleted);
                } else if let Err(e) = self.epoll.modify(fd, channel.events()) {
                    error!("epoll_ctl mod fd={} error: {}", fd, e);
                    process::abort();
                }
            }
        }
    }

    /// Forgets the channel entirely; deregisters first when still registered.
    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        self.channels.lock().unwrap().swap_remove(&fd);

        if channel.index() == Membership::Added {
            if let Err(e) = self.epoll.delete(fd) {
                error!("epoll_ctl del fd={} error: {}", fd, e);
            }
        }

        channel.set_index(Membership::New);
    }

    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(&channel.fd())
            .map(|c| Arc::ptr_eq(c, channel))
            .unwrap_or(false)
    }
}
