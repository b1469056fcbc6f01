//! A bounded pool of pre-established connections.
//!
//! The pool keeps `init_size` connections alive as a floor. A producer
//! thread replenishes the idle queue whenever it drains and there is
//! headroom below `max_size`; a reaper thread wakes every `max_idle_time`
//! and retires surplus connections whose idle age has expired. Callers
//! lease connections with [`ConnectionPool::get`]; dropping the [`Lease`]
//! returns the connection to the queue and refreshes its idle clock.

use std::collections::VecDeque;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};

mod config;

pub use config::PoolConfig;

/// Pace of producer retries after a failed connect.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Factory for the pooled resource.
///
/// The pool is generic over how a connection is established; implementors
/// get the pool's configuration and hand back a ready-to-use connection.
pub trait Connect: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn connect(&self, config: &PoolConfig) -> io::Result<Self::Conn>;
}

struct Idle<T> {
    conn: T,
    alive_since: Instant,
}

struct PoolState<T> {
    idle: VecDeque<Idle<T>>,
}

struct PoolShared<C: Connect> {
    config: PoolConfig,
    connector: C,
    state: Mutex<PoolState<C::Conn>>,
    available: Condvar,
    reaper_tick: Condvar,
    running: AtomicBool,
    // Total live connections: idle queue plus outstanding leases.
    current: AtomicUsize,
}

/// A leased connection; derefs to the underlying resource and returns it to
/// the pool on drop.
pub struct Lease<C: Connect> {
    conn: Option<C::Conn>,
    shared: Arc<PoolShared<C>>,
}

impl<C: Connect> Deref for Lease<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        self.conn.as_ref().unwrap()
    }
}

impl<C: Connect> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().unwrap()
    }
}

impl<C: Connect> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.shared.state.lock().unwrap();
            state.idle.push_back(Idle {
                conn,
                alive_since: Instant::now(),
            });
            self.shared.available.notify_all();
        }
    }
}

/// See the [module documentation](self).
pub struct ConnectionPool<C: Connect> {
    shared: Arc<PoolShared<C>>,
    producer: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl<C: Connect> ConnectionPool<C> {
    /// Establishes the initial connections and starts the producer and
    /// reaper threads. Fails if any initial connection cannot be made.
    pub fn new(config: PoolConfig, connector: C) -> io::Result<ConnectionPool<C>> {
        let shared = Arc::new(PoolShared {
            config,
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
            }),
            available: Condvar::new(),
            reaper_tick: Condvar::new(),
            running: AtomicBool::new(true),
            current: AtomicUsize::new(0),
        });

        {
            let mut state = shared.state.lock().unwrap();
            for _ in 0..shared.config.init_size {
                let conn = shared.connector.connect(&shared.config)?;
                state.idle.push_back(Idle {
                    conn,
                    alive_since: Instant::now(),
                });
                shared.current.fetch_add(1, Ordering::AcqRel);
            }
        }

        let producer = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pool-producer".to_string())
                .spawn(move || producer_loop(shared))
        };
        let reaper = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pool-reaper".to_string())
                .spawn(move || reaper_loop(shared))
        };

        Ok(ConnectionPool {
            shared,
            producer: Some(producer?),
            reaper: Some(reaper?),
        })
    }

    /// Leases a connection, blocking up to `connection_timeout`; `None` on
    /// timeout.
    pub fn get(&self) -> Option<Lease<C>> {
        let timeout = self.shared.config.connection_timeout;
        let mut state = self.shared.state.lock().unwrap();

        while state.idle.is_empty() {
            let (guard, wait) = self
                .shared
                .available
                .wait_timeout(state, timeout)
                .unwrap();
            state = guard;

            if wait.timed_out() && state.idle.is_empty() {
                warn!("timed out waiting for an idle connection");
                return None;
            }
        }

        let idle = state.idle.pop_front()?;
        self.shared.available.notify_all();

        Some(Lease {
            conn: Some(idle.conn),
            shared: self.shared.clone(),
        })
    }

    /// Live connections, leased ones included.
    pub fn current_size(&self) -> usize {
        self.shared.current.load(Ordering::Acquire)
    }

    /// Connections sitting in the idle queue.
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().unwrap().idle.len()
    }
}

fn producer_loop<C: Connect>(shared: Arc<PoolShared<C>>) {
    loop {
        let mut state = shared.state.lock().unwrap();

        // Park until the idle queue drains and there is headroom to grow.
        while shared.running.load(Ordering::Acquire)
            && !(state.idle.is_empty()
                && shared.current.load(Ordering::Acquire) < shared.config.max_size)
        {
            state = shared.available.wait(state).unwrap();
        }

        if !shared.running.load(Ordering::Acquire) {
            return;
        }

        match shared.connector.connect(&shared.config) {
            Ok(conn) => {
                state.idle.push_back(Idle {
                    conn,
                    alive_since: Instant::now(),
                });
                shared.current.fetch_add(1, Ordering::AcqRel);
                shared.available.notify_all();
            }
            Err(e) => {
                error!("producing a pooled connection failed: {}", e);
                drop(state);
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
}

fn reaper_loop<C: Connect>(shared: Arc<PoolShared<C>>) {
    loop {
        let state = shared.state.lock().unwrap();
        let (mut state, timeout) = shared
            .reaper_tick
            .wait_timeout(state, shared.config.max_idle_time)
            .unwrap();

        if !shared.running.load(Ordering::Acquire) {
            return;
        }

        if !timeout.timed_out() {
            continue;
        }

        // The queue is ordered oldest-first: returns and fresh connections
        // push at the back, so trimming stops at the first young head.
        while shared.current.load(Ordering::Acquire) > shared.config.init_size {
            match state.idle.front() {
                Some(idle)
                    if idle.alive_since.elapsed().as_millis()
                        > shared.config.max_idle_time.as_millis() =>
                {
                    state.idle.pop_front();
                    shared.current.fetch_sub(1, Ordering::AcqRel);
                }
                _ => break,
            }
        }
    }
}

impl<C: Connect> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.available.notify_all();
        self.shared.reaper_tick.notify_all();

        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{Connect, ConnectionPool, PoolConfig};

    struct CountingConnector {
        created: Arc<AtomicUsize>,
    }

    struct TestConn {
        #[allow(dead_code)]
        serial: usize,
    }

    impl Connect for CountingConnector {
        type Conn = TestConn;

        fn connect(&self, _config: &PoolConfig) -> io::Result<TestConn> {
            let serial = self.created.fetch_add(1, Ordering::AcqRel);
            Ok(TestConn { serial })
        }
    }

    fn test_config(init: usize, max: usize) -> PoolConfig {
        PoolConfig {
            init_size: init,
            max_size: max,
            max_idle_time: Duration::from_millis(300),
            connection_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        }
    }

    fn new_pool(init: usize, max: usize) -> ConnectionPool<CountingConnector> {
        let connector = CountingConnector {
            created: Arc::new(AtomicUsize::new(0)),
        };
        ConnectionPool::new(test_config(init, max), connector).unwrap()
    }

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
    fn starts_with_the_initial_floor() {
        let pool = new_pool(3, 5);
        assert_eq!(pool.current_size(), 3);
        assert_eq!(pool.idle_count(), 3);
    }

    #[test]
    fn exhaustion_times_out_and_release_unblocks() {
        let pool = new_pool(3, 5);

        let mut leases = Vec::new();
        for _ in 0..5 {
            leases.push(pool.get().expect("pool should grow to max_size"));
        }
        assert_eq!(pool.current_size(), 5);
        assert_eq!(pool.idle_count(), 0);

        // All five are out; the sixth request must come back empty.
        assert!(pool.get().is_none());

        drop(leases.pop());
        let again = pool.get();
        assert!(again.is_some());

        drop(again);
        drop(leases);
        assert_eq!(pool.current_size(), pool.idle_count());
    }

    #[test]
    fn reaper_trims_back_to_the_floor() {
        let pool = new_pool(2, 4);

        let leases: Vec<_> = (0..4).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.current_size(), 4);
        drop(leases);
        assert_eq!(pool.idle_count(), 4);

        assert!(wait_until(Duration::from_secs(5), || {
            pool.current_size() == 2
        }));
        assert_eq!(pool.idle_count(), 2);
    }
}
