use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};
use slab::Slab;

const DEFAULT_TASK_QUEUE_CAP: usize = 1024;
const DEFAULT_MAX_THREADS: usize = 300;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long `submit` waits for queue room before refusing.
const SUBMIT_WAIT: Duration = Duration::from_secs(1);
/// Cached-mode workers re-check their idle age at this cadence.
const WORKER_WAIT: Duration = Duration::from_secs(1);

/// Worker management strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolMode {
    /// The worker count is fixed at start time.
    Fixed,
    /// Workers are added under load and reaped after sitting idle.
    Cached,
}

/// Why a submission was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubmitError {
    NotRunning,
    QueueFull,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubmitError::NotRunning => fmt.write_str("thread pool is not running"),
            SubmitError::QueueFull => fmt.write_str("task queue is full"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// One-shot handle to a submitted task's return value.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: mpsc::Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task finishes. `None` means the task panicked.
    pub fn get(self) -> Option<R> {
        self.rx.recv().ok()
    }

    /// Like `get`, but gives up after `timeout`.
    pub fn get_timeout(self, timeout: Duration) -> Option<R> {
        self.rx.recv_timeout(timeout).ok()
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    // Dropping the handle detaches the thread; workers remove themselves
    // from the slab before exiting.
    _thread: Option<JoinHandle<()>>,
}

struct PoolState {
    tasks: VecDeque<Task>,
    workers: Slab<Worker>,
    mode: PoolMode,
    init_threads: usize,
    max_threads: usize,
    queue_cap: usize,
    idle_timeout: Duration,
}

struct PoolShared {
    state: Mutex<PoolState>,
    not_empty: Condvar,
    not_full: Condvar,
    exit: Condvar,
    running: AtomicBool,
    current_threads: AtomicUsize,
    idle_threads: AtomicUsize,
}

/// A bounded-queue worker pool for arbitrary blocking work.
///
/// Configure before [`start`]; configuration calls are ignored once running.
/// `submit` hands back a [`TaskHandle`] carrying the task's return value, or
/// refuses outright when the pool is stopped or the queue stays full for a
/// second. Callers always see the refusal, never a silent drop.
///
/// [`start`]: ThreadPool::start
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl Default for ThreadPool {
    fn default() -> ThreadPool {
        ThreadPool::new()
    }
}

impl ThreadPool {
    pub fn new() -> ThreadPool {
        ThreadPool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    tasks: VecDeque::new(),
                    workers: Slab::new(),
                    mode: PoolMode::Fixed,
                    init_threads: 0,
                    max_threads: DEFAULT_MAX_THREADS,
                    queue_cap: DEFAULT_TASK_QUEUE_CAP,
                    idle_timeout: DEFAULT_IDLE_TIMEOUT,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                exit: Condvar::new(),
                running: AtomicBool::new(false),
                current_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_mode(&self, mode: PoolMode) {
        if self.is_running() {
            return;
        }
        self.shared.state.lock().unwrap().mode = mode;
    }

    pub fn set_task_queue_cap(&self, cap: usize) {
        if self.is_running() {
            return;
        }
        self.shared.state.lock().unwrap().queue_cap = cap;
    }

    pub fn set_max_threads(&self, max: usize) {
        if self.is_running() {
            return;
        }
        self.shared.state.lock().unwrap().max_threads = max;
    }

    /// How long a cached-mode worker may sit idle before self-terminating.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        if self.is_running() {
            return;
        }
        self.shared.state.lock().unwrap().idle_timeout = timeout;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn current_threads(&self) -> usize {
        self.shared.current_threads.load(Ordering::Acquire)
    }

    pub fn idle_threads(&self) -> usize {
        self.shared.idle_threads.load(Ordering::Acquire)
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.state.lock().unwrap().tasks.len()
    }

    /// Spawns the initial workers. A second call is a no-op.
    pub fn start(&self, init_threads: usize) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.shared.state.lock().unwrap();
        state.init_threads = init_threads.min(state.max_threads);

        for _ in 0..state.init_threads {
            spawn_worker(&self.shared, &mut state);
        }
    }

    /// Queues `func` and returns a handle to its result.
    ///
    /// Waits up to one second for queue room; a full queue or a stopped pool
    /// refuses with a [`SubmitError`]. In cached mode a submission that finds
    /// every worker busy also spawns a new worker, up to the cap.
    pub fn submit<F, R>(&self, func: F) -> Result<TaskHandle<R>, SubmitError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_running() {
            error!("thread pool is not running, submit failed");
            return Err(SubmitError::NotRunning);
        }

        let (tx, rx) = mpsc::channel();
        let task: Task = Box::new(move || {
            let _ = tx.send(func());
        });

        let state = self.shared.state.lock().unwrap();
        let (mut state, timeout) = self
            .shared
            .not_full
            .wait_timeout_while(state, SUBMIT_WAIT, |s| s.tasks.len() >= s.queue_cap)
            .unwrap();

        if timeout.timed_out() && state.tasks.len() >= state.queue_cap {
            error!("task queue is full, submit failed");
            return Err(SubmitError::QueueFull);
        }

        state.tasks.push_back(task);
        self.shared.not_empty.notify_one();

        if state.mode == PoolMode::Cached
            && state.tasks.len() > self.shared.idle_threads.load(Ordering::Acquire)
            && self.shared.current_threads.load(Ordering::Acquire) < state.max_threads
        {
            debug!("task backlog exceeds idle workers, growing the pool");
            spawn_worker(&self.shared, &mut state);
        }

        Ok(TaskHandle { rx })
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, state: &mut PoolState) {
    let entry = state.workers.vacant_entry();
    let id = entry.key();
    let pool = shared.clone();

    let thread = thread::Builder::new()
        .name(format!("pool-worker-{}", id))
        .spawn(move || worker_loop(pool, id));

    match thread {
        Ok(handle) => {
            entry.insert(Worker {
                _thread: Some(handle),
            });
            shared.current_threads.fetch_add(1, Ordering::AcqRel);
            shared.idle_threads.fetch_add(1, Ordering::AcqRel);
        }
        Err(e) => error!("failed to spawn worker {}: {}", id, e),
    }
}

fn worker_loop(shared: Arc<PoolShared>, id: usize) {
    let mut last_active = Instant::now();

    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();

            let task = loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }

                // The queue drains completely before workers honor shutdown.
                if !shared.running.load(Ordering::Acquire) {
                    let _ = state.workers.try_remove(id);
                    shared.current_threads.fetch_sub(1, Ordering::AcqRel);
                    shared.idle_threads.fetch_sub(1, Ordering::AcqRel);
                    shared.exit.notify_all();
                    return;
                }

                if state.mode == PoolMode::Cached {
                    let (guard, timeout) = shared
                        .not_empty
                        .wait_timeout(state, WORKER_WAIT)
                        .unwrap();
                    state = guard;

                    if timeout.timed_out()
                        && last_active.elapsed() >= state.idle_timeout
                        && shared.current_threads.load(Ordering::Acquire) > state.init_threads
                    {
                        debug!("worker {} idle too long, retiring", id);
                        let _ = state.workers.try_remove(id);
                        shared.current_threads.fetch_sub(1, Ordering::AcqRel);
                        shared.idle_threads.fetch_sub(1, Ordering::AcqRel);
                        shared.exit.notify_all();
                        return;
                    }
                } else {
                    state = shared.not_empty.wait(state).unwrap();
                }
            };

            shared.idle_threads.fetch_sub(1, Ordering::AcqRel);
            if !state.tasks.is_empty() {
                shared.not_empty.notify_all();
            }
            shared.not_full.notify_all();

            task
        };

        task();

        shared.idle_threads.fetch_add(1, Ordering::AcqRel);
        last_active = Instant::now();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);

        let mut state = self.shared.state.lock().unwrap();
        self.shared.not_empty.notify_all();

        while !state.workers.is_empty() {
            state = self.shared.exit.wait(state).unwrap();
        }
    }
}
