use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::event_loop::LoopHandle;
use crate::ready::Ready;
use crate::timestamp::Timestamp;

/// Callback fired when a channel's fd turns readable; receives the poll
/// return time.
pub type ReadEventCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;
/// Callback fired for writable, peer-close and error events.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Registration state of a channel inside its poller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Membership {
    /// Never handed to the poller.
    New,
    /// Registered with the OS multiplexer.
    Added,
    /// Still known to the poller's map, deregistered from the OS.
    Deleted,
}

struct Inner {
    events: Ready,
    revents: Ready,
    index: Membership,
}

/// The pairing of one fd with its interest set and its event callbacks on a
/// specific loop.
///
/// A `Channel` does not own its fd; the higher-level object (socket, waker)
/// does. Every mutating call must happen on the owning loop's thread: the
/// mutation funnels through the loop, which asserts affinity before touching
/// the poller.
///
/// The *tie* is a weak back-reference to the object whose callbacks are
/// installed here. When set, event dispatch first promotes it to a strong
/// reference and skips all callbacks if the owner is already gone, so a
/// connection being torn down on another code path cannot be called back
/// into.
pub struct Channel {
    fd: RawFd,
    owner: LoopHandle,
    inner: Mutex<Inner>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    read_callback: Mutex<Option<ReadEventCallback>>,
    write_callback: Mutex<Option<EventCallback>>,
    close_callback: Mutex<Option<EventCallback>>,
    error_callback: Mutex<Option<EventCallback>>,
}

impl Channel {
    pub fn new(owner: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            owner,
            inner: Mutex::new(Inner {
                events: Ready::empty(),
                revents: Ready::empty(),
                index: Membership::New,
            }),
            tie: Mutex::new(None),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.owner
    }

    pub fn set_read_callback(&self, cb: ReadEventCallback) {
        *self.read_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        *self.write_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        *self.close_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        *self.error_callback.lock().unwrap() = Some(cb);
    }

    /// Ties callback dispatch to the liveness of `obj`.
    pub fn tie(&self, obj: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(obj));
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().events.insert(Ready::readable());
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().events.remove(Ready::readable());
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().events.insert(Ready::writable());
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().events.remove(Ready::writable());
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.inner.lock().unwrap().events = Ready::empty();
        self.update();
    }

    pub fn is_none_event(&self) -> bool {
        self.inner.lock().unwrap().events.is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.inner.lock().unwrap().events.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.inner.lock().unwrap().events.is_writable()
    }

    pub(crate) fn events(&self) -> Ready {
        self.inner.lock().unwrap().events
    }

    pub(crate) fn revents(&self) -> Ready {
        self.inner.lock().unwrap().revents
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.inner.lock().unwrap().revents = revents;
    }

    pub(crate) fn index(&self) -> Membership {
        self.inner.lock().unwrap().index
    }

    pub(crate) fn set_index(&self, index: Membership) {
        self.inner.lock().unwrap().index = index;
    }

    /// Unregisters this channel from its loop's poller.
    pub fn remove(self: &Arc<Self>) {
        self.owner.remove_channel(self);
    }

    fn update(self: &Arc<Self>) {
        self.owner.update_channel(self);
    }

    /// Dispatches the events observed by the last poll. Invoked only by the
    /// owning loop.
    pub(crate) fn handle_event(self: &Arc<Self>, receive_time: Timestamp) {
        let tied = self.tie.lock().unwrap().clone();

        if let Some(tie) = tied {
            // Keep the owner alive for the whole dispatch, or skip it
            // entirely when the owner is already gone.
            match tie.upgrade() {
                Some(_guard) => self.handle_event_with_guard(receive_time),
                None => {}
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let revents = self.revents();
        trace!("fd={} dispatch {:?}", self.fd, revents);

        // Callbacks are cloned out of their slot before the call, so none of
        // the locks is held while user code runs.

        // Peer hang-up with nothing left to read.
        if revents.is_hup() && !revents.is_readable() {
            let cb = self.close_callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb();
            }
        }

        if revents.is_error() {
            let cb = self.error_callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb();
            }
        }

        if revents.is_readable() {
            let cb = self.read_callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(receive_time);
            }
        }

        if revents.is_writable() {
            let cb = self.write_callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
    }
}
