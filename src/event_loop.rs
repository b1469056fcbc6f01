use std::cell::Cell;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{error, info, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys;
use crate::waker::Waker;

/// How long one poller wait may block before the loop re-checks its flags.
const POLL_TIME: Duration = Duration::from_secs(10);

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);

/// A unit of deferred work queued onto a loop from any thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct LoopInner {
    id: usize,
    thread_id: ThreadId,
    poller: Poller,
    waker: Waker,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
}

/// The cloneable, thread-safe face of an [`EventLoop`].
///
/// A handle is the only sanctioned bridge between threads: work submitted
/// through [`run_in_loop`]/[`queue_in_loop`] executes on the loop's own
/// thread, in submission order, between poller returns. Everything that
/// mutates loop-owned state (channels, connections, buffers) must travel this
/// bridge.
///
/// [`run_in_loop`]: LoopHandle::run_in_loop
/// [`queue_in_loop`]: LoopHandle::queue_in_loop
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<LoopInner>,
}

impl LoopHandle {
    /// Process-unique loop id, used in logs and for round-robin accounting.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// True when the calling thread is the one the loop was constructed on.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Panics unless called on the owning thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "event loop {} (owned by {:?}) touched from thread {:?}",
                self.inner.id,
                self.inner.thread_id,
                thread::current().id()
            );
        }
    }

    /// Runs `task` on the loop thread: inline when already there, queued
    /// otherwise.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue and wakes the loop when needed.
    ///
    /// The wakeup also fires when the loop is currently draining its queue,
    /// so a task enqueued *by* a pending task is picked up at the next
    /// iteration instead of stalling behind a full poll timeout.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.push(Box::new(task));
        }

        if !self.is_in_loop_thread() || self.inner.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Asks the loop to exit after the current iteration.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::Release);

        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Forces the loop's poller to return immediately.
    pub fn wakeup(&self) {
        if let Err(e) = self.inner.waker.wakeup() {
            error!("event loop {} wakeup error: {}", self.inner.id, e);
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.inner.poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.inner.poller.remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.inner.poller.has_channel(channel)
    }

    fn drain_pending(&self) {
        let mut tasks = Vec::new();
        self.inner.calling_pending.store(true, Ordering::Release);

        {
            // Swap-and-run: the lock covers only the swap, so a task is free
            // to queue more work without deadlocking.
            let mut pending = self.inner.pending.lock().unwrap();
            std::mem::swap(&mut tasks, &mut *pending);
        }

        for task in tasks {
            task();
        }

        self.inner.calling_pending.store(false, Ordering::Release);
    }
}

/// One reactor: a poller plus the wakeup descriptor, driven on a single
/// thread.
///
/// The loop is bound to the thread that constructed it; constructing a second
/// loop on the same thread is a fatal programming error. Cross-thread work
/// goes through [`LoopHandle`].
pub struct EventLoop {
    handle: LoopHandle,
    events: sys::Events,
    active_channels: Vec<Arc<Channel>>,
    wakeup_channel: Arc<Channel>,
    looping: bool,
}

impl EventLoop {
    /// Builds a loop bound to the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already hosts a live `EventLoop`.
    pub fn new() -> io::Result<EventLoop> {
        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!(
                    "another event loop already exists on thread {:?}",
                    thread::current().id()
                );
            }
        });

        let poller = Poller::new()?;
        let waker = Waker::new()?;
        let wakeup_fd = waker.as_raw_fd();

        let handle = LoopHandle {
            inner: Arc::new(LoopInner {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                thread_id: thread::current().id(),
                poller,
                waker: waker.clone(),
                pending: Mutex::new(Vec::new()),
                calling_pending: AtomicBool::new(false),
                quit: AtomicBool::new(false),
            }),
        };

        LOOP_IN_THIS_THREAD.with(|flag| flag.set(true));

        let wakeup_channel = Channel::new(handle.clone(), wakeup_fd);
        wakeup_channel.set_read_callback(Arc::new(move |_| {
            if let Err(e) = waker.drain() {
                error!("wakeup drain error: {}", e);
            }
        }));
        wakeup_channel.enable_reading();

        Ok(EventLoop {
            handle,
            events: Poller::new_events(),
            active_channels: Vec::new(),
            wakeup_channel,
            looping: false,
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Runs the reactor until [`LoopHandle::quit`] is observed.
    ///
    /// Each iteration waits on the poller, dispatches every active channel's
    /// events, then drains the pending-task queue.
    pub fn run(&mut self) {
        self.handle.assert_in_loop_thread();
        self.looping = true;

        info!("event loop {} start looping", self.handle.id());

        while !self.handle.inner.quit.load(Ordering::Acquire) {
            self.active_channels.clear();

            let receive_time = self.handle.inner.poller.poll(
                &mut self.events,
                Some(POLL_TIME),
                &mut self.active_channels,
            );

            for channel in &self.active_channels {
                trace!(
                    "event loop {} dispatch fd={}",
                    self.handle.id(),
                    channel.fd()
                );
                channel.handle_event(receive_time);
            }

            self.handle.drain_pending();
        }

        info!("event loop {} stop looping", self.handle.id());
        self.looping = false;
    }

    /// The poll return time of the most recent iteration is handed straight
    /// to read callbacks; this exposes whether the loop is inside `run`.
    pub fn is_looping(&self) -> bool {
        self.looping
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod test {
    use super::EventLoop;

    #[test]
    #[should_panic(expected = "another event loop already exists")]
    fn second_loop_on_one_thread_is_fatal() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new();
    }

    #[test]
    fn loop_slot_is_released_on_drop() {
        {
            let _a = EventLoop::new().unwrap();
        }
        // The previous loop is gone, the thread may host a new one.
        let _b = EventLoop::new().unwrap();
    }

    #[test]
    fn run_in_loop_is_inline_on_owner_thread() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        event_loop.handle().run_in_loop(move || {
            flag.store(true, Ordering::Release);
        });

        assert!(ran.load(Ordering::Acquire));
    }
}
