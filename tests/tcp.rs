use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hive_io::{
    EventLoop, InetAddress, LoopHandle, ServerOption, TcpConnectionPtr, TcpServer,
};

struct Counters {
    ups: AtomicUsize,
    downs: AtomicUsize,
    messages: AtomicUsize,
}

impl Counters {
    fn new() -> Arc<Counters> {
        Arc::new(Counters {
            ups: AtomicUsize::new(0),
            downs: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
        })
    }
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

/// Runs a server on an OS-assigned port and hands back (port, base-loop
/// handle, join handle). `configure` installs the test's callbacks.
fn spawn_server<F>(
    thread_num: usize,
    configure: F,
) -> (u16, LoopHandle, thread::JoinHandle<()>)
where
    F: FnOnce(&TcpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            base_loop.handle().clone(),
            InetAddress::new("127.0.0.1", 0).unwrap(),
            "test-server",
            ServerOption::ReusePort,
        )
        .unwrap();

        server.set_thread_num(thread_num);
        configure(&server);
        server.start();

        tx.send((server.listen_addr().port(), base_loop.handle().clone()))
            .unwrap();
        base_loop.run();
    });

    let (port, handle) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    (port, handle, server_thread)
}

#[test]
fn echo_round_trip_with_one_down_callback() {
    let counters = Counters::new();
    let conn_counters = counters.clone();
    let msg_counters = counters.clone();

    let (port, handle, server_thread) = spawn_server(3, move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.is_connected() {
                conn_counters.ups.fetch_add(1, Ordering::AcqRel);
            } else {
                conn_counters.downs.fetch_add(1, Ordering::AcqRel);
            }
        }));
        server.set_message_callback(Arc::new(move |conn, buf, _when| {
            msg_counters.messages.fetch_add(1, Ordering::AcqRel);
            let msg = buf.retrieve_all_as_string();
            assert_eq!(msg, "hello\n");
            conn.send(msg.as_bytes());
            conn.shutdown();
        }));
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    client.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    // The server half-closed after echoing; the stream must now report EOF.
    let mut rest = [0u8; 1];
    assert_eq!(client.read(&mut rest).unwrap(), 0);
    drop(client);

    assert!(wait_until(Duration::from_secs(10), || {
        counters.downs.load(Ordering::Acquire) == 1
    }));
    assert_eq!(counters.ups.load(Ordering::Acquire), 1);
    assert_eq!(counters.messages.load(Ordering::Acquire), 1);
    assert_eq!(counters.downs.load(Ordering::Acquire), 1);

    handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn peer_half_close_is_graceful() {
    let counters = Counters::new();
    let conn_counters = counters.clone();
    let msg_counters = counters.clone();

    let (port, handle, server_thread) = spawn_server(1, move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.is_connected() {
                conn_counters.ups.fetch_add(1, Ordering::AcqRel);
            } else {
                conn_counters.downs.fetch_add(1, Ordering::AcqRel);
            }
        }));
        server.set_message_callback(Arc::new(move |conn, buf, _when| {
            msg_counters.messages.fetch_add(1, Ordering::AcqRel);
            let msg = buf.retrieve_all_as_string();
            conn.send(msg.as_bytes());
        }));
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    client.write_all(b"hello").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    // The echo still arrives on the surviving read half.
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");

    assert!(wait_until(Duration::from_secs(10), || {
        counters.downs.load(Ordering::Acquire) == 1
    }));
    assert_eq!(counters.messages.load(Ordering::Acquire), 1);
    assert_eq!(counters.ups.load(Ordering::Acquire), 1);

    handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn high_water_mark_fires_exactly_once() {
    const PAYLOAD: usize = 64 * 1024 * 1024;
    const MARK: usize = 1024 * 1024;

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_size = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let hits = hwm_hits.clone();
    let size = hwm_size.clone();
    let completes = write_completes.clone();

    let (port, handle, server_thread) = spawn_server(1, move |server| {
        let hits = hits.clone();
        let size = size.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.is_connected() {
                let hits = hits.clone();
                let size = size.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, pending| {
                        hits.fetch_add(1, Ordering::AcqRel);
                        size.store(pending, Ordering::Release);
                    }),
                    MARK,
                );
                conn.send(&vec![b'x'; PAYLOAD]);
            }
        }));
        server.set_write_complete_callback(Arc::new(move |conn| {
            completes.fetch_add(1, Ordering::AcqRel);
            conn.shutdown();
        }));
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    // Let the server's first burst fill the kernel buffers before draining.
    thread::sleep(Duration::from_millis(200));

    let mut total = 0usize;
    let mut chunk = [0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => panic!("client read error: {}", e),
        }
    }
    assert_eq!(total, PAYLOAD);

    assert!(wait_until(Duration::from_secs(10), || {
        write_completes.load(Ordering::Acquire) == 1
    }));
    assert_eq!(hwm_hits.load(Ordering::Acquire), 1);
    let reported = hwm_size.load(Ordering::Acquire);
    assert!(
        reported >= MARK && reported <= PAYLOAD,
        "reported high-water size {} out of range",
        reported
    );

    handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn send_and_shutdown_from_a_foreign_thread() {
    let counters = Counters::new();
    let conn_counters = counters.clone();

    let slot: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));
    let publish = slot.clone();

    let (port, handle, server_thread) = spawn_server(2, move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.is_connected() {
                conn_counters.ups.fetch_add(1, Ordering::AcqRel);
                *publish.lock().unwrap() = Some(conn.clone());
            } else {
                conn_counters.downs.fetch_add(1, Ordering::AcqRel);
            }
        }));
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        slot.lock().unwrap().is_some()
    }));
    let conn = slot.lock().unwrap().clone().unwrap();

    // Both calls cross from the test thread onto the owning sub-loop.
    conn.send(b"ping");
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    conn.shutdown();
    let mut rest = [0u8; 1];
    assert_eq!(client.read(&mut rest).unwrap(), 0);
    drop(client);

    assert!(wait_until(Duration::from_secs(10), || {
        counters.downs.load(Ordering::Acquire) == 1
    }));

    handle.quit();
    server_thread.join().unwrap();
}
