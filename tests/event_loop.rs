use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hive_io::{Channel, EventLoopThread, Waker};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn queued_tasks_drain_in_submission_order() {
    let mut loop_thread = EventLoopThread::new(None, "fifo-loop".to_string());
    let handle = loop_thread.start_loop();

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let order = order.clone();
        handle.queue_in_loop(move || {
            order.lock().unwrap().push(i);
        });
    }

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    handle.queue_in_loop(move || {
        flag.store(true, Ordering::Release);
    });

    assert!(wait_until(Duration::from_secs(10), || {
        done.load(Ordering::Acquire)
    }));
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..100).collect::<Vec<usize>>());
}

#[test]
fn task_queued_by_a_task_runs_promptly() {
    let mut loop_thread = EventLoopThread::new(None, "rewake-loop".to_string());
    let handle = loop_thread.start_loop();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let inner_handle = handle.clone();

    let started = Instant::now();
    handle.queue_in_loop(move || {
        // This enqueue happens on the owner thread mid-drain; the re-wake
        // keeps it from stalling behind a full poll timeout.
        let flag = flag.clone();
        inner_handle.queue_in_loop(move || {
            flag.store(true, Ordering::Release);
        });
    });

    assert!(wait_until(Duration::from_secs(10), || {
        done.load(Ordering::Acquire)
    }));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn channel_membership_follows_enable_and_remove() {
    let mut loop_thread = EventLoopThread::new(None, "membership-loop".to_string());
    let handle = loop_thread.start_loop();

    let after_enable = Arc::new(AtomicBool::new(false));
    let after_remove = Arc::new(AtomicBool::new(true));
    let done = Arc::new(AtomicBool::new(false));

    let enabled = after_enable.clone();
    let removed = after_remove.clone();
    let flag = done.clone();
    let task_handle = handle.clone();

    handle.queue_in_loop(move || {
        let waker = Waker::new().unwrap();
        let channel = Channel::new(task_handle.clone(), waker.as_raw_fd());

        channel.enable_reading();
        enabled.store(task_handle.has_channel(&channel), Ordering::Release);

        channel.disable_all();
        channel.remove();
        removed.store(task_handle.has_channel(&channel), Ordering::Release);

        flag.store(true, Ordering::Release);
    });

    assert!(wait_until(Duration::from_secs(10), || {
        done.load(Ordering::Acquire)
    }));
    assert!(after_enable.load(Ordering::Acquire));
    assert!(!after_remove.load(Ordering::Acquire));
}
