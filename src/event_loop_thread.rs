use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::error;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::{EventLoop, LoopHandle};

/// Hosts one [`EventLoop`] on a dedicated, named OS thread.
///
/// The loop lives on the worker's stack; the parent only ever sees its
/// [`LoopHandle`], published under a mutex + condvar so `start_loop` cannot
/// observe a half-built loop.
pub struct EventLoopThread {
    thread: Option<JoinHandle<()>>,
    shared: Arc<(Mutex<Option<LoopHandle>>, Condvar)>,
    init: Option<ThreadInitCallback>,
    name: String,
}

impl EventLoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: String) -> EventLoopThread {
        EventLoopThread {
            thread: None,
            shared: Arc::new((Mutex::new(None), Condvar::new())),
            init,
            name,
        }
    }

    /// Spawns the worker and blocks until its loop handle is published.
    pub fn start_loop(&mut self) -> LoopHandle {
        let shared = self.shared.clone();
        let init = self.init.take();
        let name = self.name.clone();

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    error!("thread {} failed to build its event loop: {}", name, e);
                    panic!("event loop construction failed: {}", e);
                }
            };

            if let Some(init) = init {
                init(event_loop.handle());
            }

            {
                let (lock, cvar) = &*shared;
                let mut slot = lock.lock().unwrap();
                *slot = Some(event_loop.handle().clone());
                cvar.notify_one();
            }

            event_loop.run();

            let (lock, _) = &*shared;
            *lock.lock().unwrap() = None;
        });

        match thread {
            Ok(thread) => self.thread = Some(thread),
            Err(e) => panic!("failed to spawn loop thread {}: {}", self.name, e),
        }

        let (lock, cvar) = &*self.shared;
        let mut slot = lock.lock().unwrap();
        loop {
            if let Some(handle) = slot.as_ref() {
                return handle.clone();
            }
            slot = cvar.wait(slot).unwrap();
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let handle = self.shared.0.lock().unwrap().clone();
        if let Some(handle) = handle {
            handle.quit();
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::EventLoopThread;

    #[test]
    fn start_loop_publishes_a_live_handle() {
        let inits = Arc::new(AtomicUsize::new(0));
        let counter = inits.clone();

        let mut thread = EventLoopThread::new(
            Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            })),
            "loop-under-test".to_string(),
        );

        let handle = thread.start_loop();
        assert_eq!(inits.load(Ordering::Acquire), 1);
        assert!(!handle.is_in_loop_thread());

        let (tx, rx) = std::sync::mpsc::channel();
        handle.run_in_loop(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    }
}
