use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use log::{error, info};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionPtr, ThreadInitCallback,
    WriteCompleteCallback,
};
use crate::event_loop::LoopHandle;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::tcp_connection::TcpConnection;

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

struct ServerInner {
    base_loop: LoopHandle,
    name: String,
    ip_port: String,
    pool: Mutex<EventLoopThreadPool>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicUsize,
    next_conn_id: AtomicU64,
    connections: Mutex<IndexMap<String, TcpConnectionPtr>>,
}

/// Composes the acceptor, the loop pool and the connection registry.
///
/// The acceptor and the registry live on the base loop; each accepted
/// connection is handed to the next sub-loop round robin and is owned by it
/// from then on. Install callbacks before [`start`], which is idempotent.
///
/// [`start`]: TcpServer::start
pub struct TcpServer {
    inner: Arc<ServerInner>,
    acceptor: Acceptor,
    listen_addr: InetAddress,
}

impl TcpServer {
    pub fn new(
        base_loop: LoopHandle,
        listen_addr: InetAddress,
        name: &str,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(
            base_loop.clone(),
            &listen_addr,
            option == ServerOption::ReusePort,
        )?;

        // Resolve through the bound socket so listening on port 0 yields the
        // real endpoint.
        let listen_addr = acceptor.local_addr()?;

        let pool = EventLoopThreadPool::new(base_loop.clone(), name.to_string());

        let inner = Arc::new(ServerInner {
            base_loop,
            name: name.to_string(),
            ip_port: listen_addr.ip_port(),
            pool: Mutex::new(pool),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(IndexMap::new()),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        acceptor.set_new_connection_callback(Arc::new(move |socket, peer_addr| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::new_connection(&inner, socket, peer_addr);
            }
        }));

        Ok(TcpServer {
            inner,
            acceptor,
            listen_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The listening endpoint, with the OS-assigned port when bound to 0.
    pub fn listen_addr(&self) -> InetAddress {
        self.listen_addr
    }

    /// Number of sub-loops; 0 keeps everything on the base loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.inner.thread_init_callback.lock().unwrap() = Some(cb);
    }

    /// Starts the loop pool and schedules `listen` on the base loop. Extra
    /// calls are no-ops.
    pub fn start(&self) {
        if self.inner.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let init = self.inner.thread_init_callback.lock().unwrap().clone();
            self.inner.pool.lock().unwrap().start(init);
            self.acceptor.schedule_listen();
        }
    }
}

impl ServerInner {
    /// Base-loop half of an accept: pick the owning sub-loop, mint the
    /// connection name, register, and kick off establishment over there.
    fn new_connection(inner: &Arc<ServerInner>, socket: Socket, peer_addr: InetAddress) {
        inner.base_loop.assert_in_loop_thread();

        let io_loop = inner.pool.lock().unwrap().next_loop();
        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, conn_id);

        info!(
            "server {} new connection [{}] from {}",
            inner.name, conn_name, peer_addr
        );

        let local_addr = socket.local_addr().unwrap_or_else(|e| {
            error!("getsockname for {} failed: {}", conn_name, e);
            InetAddress::default()
        });

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );

        if let Some(cb) = inner.connection_callback.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = inner.message_callback.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = inner.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, conn);
            }
        }));

        inner
            .connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Entered from the connection's close path on its sub-loop; hops to the
    /// base loop where the registry lives.
    fn remove_connection(inner: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        let inner_for_task = inner.clone();
        let conn = conn.clone();
        inner.base_loop.run_in_loop(move || {
            ServerInner::remove_connection_in_loop(&inner_for_task, &conn);
        });
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        inner.base_loop.assert_in_loop_thread();
        info!(
            "server {} removes connection {}",
            inner.name,
            conn.name()
        );

        inner.connections.lock().unwrap().swap_remove(conn.name());

        let io_loop = conn.loop_handle().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let conns: Vec<TcpConnectionPtr> = {
            let mut connections = self.inner.connections.lock().unwrap();
            connections.drain(..).map(|(_, conn)| conn).collect()
        };

        for conn in conns {
            let owner = conn.loop_handle().clone();
            owner.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
