use crate::callbacks::ThreadInitCallback;
use crate::event_loop::LoopHandle;
use crate::event_loop_thread::EventLoopThread;

/// A fixed set of loop threads with round-robin selection.
///
/// With zero threads everything runs on the base loop (single reactor); with
/// `n` threads the base loop keeps accepting while connections are dealt out
/// to the sub-loops in arrival order.
pub struct EventLoopThreadPool {
    base_loop: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: LoopHandle, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name,
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawns the loop threads; with zero threads the init callback runs on
    /// the base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        self.started = true;

        for i in 0..self.num_threads {
            let thread_name = format!("{}{}", self.name, i);
            let mut thread = EventLoopThread::new(init.clone(), thread_name);
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
    }

    /// The loop that should own the next accepted connection.
    pub fn next_loop(&mut self) -> LoopHandle {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }

        let handle = self.loops[self.next].clone();
        self.next += 1;
        if self.next >= self.loops.len() {
            self.next = 0;
        }

        handle
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use super::EventLoopThreadPool;
    use crate::event_loop::EventLoop;

    #[test]
    fn round_robin_is_fair_and_deterministic() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(base.handle().clone(), "pool".to_string());
        pool.set_thread_num(3);
        pool.start(None);

        let ids: Vec<usize> = pool.all_loops().iter().map(|l| l.id()).collect();
        assert_eq!(ids.len(), 3);

        // Twelve picks spread 4/4/4 over the three loops, in cycle order.
        let picks: Vec<usize> = (0..12).map(|_| pool.next_loop().id()).collect();
        for (i, picked) in picks.iter().enumerate() {
            assert_eq!(*picked, ids[i % 3]);
        }
    }

    #[test]
    fn empty_pool_hands_out_the_base_loop() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(base.handle().clone(), "solo".to_string());
        pool.start(None);

        assert_eq!(pool.next_loop().id(), base.handle().id());
        assert_eq!(pool.all_loops().len(), 1);
    }
}
