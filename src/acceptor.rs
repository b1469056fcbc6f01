use std::io;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::error;

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::inet_address::InetAddress;
use crate::socket::Socket;

/// Receives each accepted connection: the connected socket and the peer
/// address.
pub type NewConnectionCallback = Arc<dyn Fn(Socket, InetAddress) + Send + Sync>;

struct AcceptorInner {
    event_loop: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

/// Owns the listening socket's channel on the base loop.
///
/// The socket is created, configured and bound at construction; `listen` is
/// deferred until the server starts. Each readable event accepts a single
/// connection.
pub struct Acceptor {
    inner: Arc<AcceptorInner>,
}

impl Acceptor {
    pub fn new(
        event_loop: LoopHandle,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> io::Result<Acceptor> {
        let socket = Socket::new_nonblocking()?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind_address(listen_addr)?;

        let channel = Channel::new(event_loop.clone(), socket.fd());

        let inner = Arc::new(AcceptorInner {
            event_loop,
            socket,
            channel,
            listening: AtomicBool::new(false),
            new_connection_callback: Mutex::new(None),
        });

        let weak: Weak<AcceptorInner> = Arc::downgrade(&inner);
        inner.channel.set_read_callback(Arc::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_read();
            }
        }));

        Ok(Acceptor { inner })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.inner.new_connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// The bound address; resolves the real port when bound to port 0.
    pub fn local_addr(&self) -> io::Result<InetAddress> {
        self.inner.socket.local_addr()
    }

    /// Queues `listen` onto the owning loop.
    pub fn schedule_listen(&self) {
        let inner = self.inner.clone();
        self.inner.event_loop.run_in_loop(move || inner.listen());
    }
}

impl AcceptorInner {
    fn listen(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);

        if let Err(e) = self.socket.listen() {
            error!("listen on fd={} error: {}", self.socket.fd(), e);
            process::abort();
        }

        self.channel.enable_reading();
    }

    fn handle_read(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                let cb = self.new_connection_callback.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(socket, peer_addr),
                    // Nobody wants it; dropping the socket closes the fd.
                    None => drop(socket),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("accept error: {}", e);
                if e.raw_os_error() == Some(libc::EMFILE) {
                    error!("accept hit the open fd limit");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.inner.channel.disable_all();
        self.inner.channel.remove();
    }
}
