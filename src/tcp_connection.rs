use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use libc::c_void;
use log::{debug, error, info};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::sys::syscall;
use crate::timestamp::Timestamp;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Lifecycle of a connection.
///
/// ```text
/// Connecting --connect_established--> Connected
/// Connected  --shutdown()-----------> Disconnecting
/// Connected  --peer close / error---> Disconnected
/// Disconnecting --output drained----> Disconnected (write side closed)
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnState {
    fn from_usize(v: usize) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    fn as_usize(self) -> usize {
        match self {
            ConnState::Connecting => 0,
            ConnState::Connected => 1,
            ConnState::Disconnecting => 2,
            ConnState::Disconnected => 3,
        }
    }
}

/// One accepted TCP connection, owned by a single sub-loop.
///
/// All I/O and state transitions happen on the owning loop's thread; `send`
/// and `shutdown` may be called from anywhere and bridge over via the loop
/// handle. The connection is shared (`Arc`) because the server registry on
/// the base loop and in-flight loop tasks both hold references while the
/// close handshake hops between threads.
pub struct TcpConnection {
    event_loop: LoopHandle,
    name: String,
    state: AtomicUsize,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// Wraps an accepted socket. The connection starts in `Connecting`; the
    /// server schedules [`connect_established`] on the owning loop once the
    /// callbacks are installed.
    ///
    /// [`connect_established`]: TcpConnection::connect_established
    pub fn new(
        event_loop: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        if let Err(e) = socket.set_keep_alive(true) {
            error!("connection {} SO_KEEPALIVE error: {}", name, e);
        }

        let channel = Channel::new(event_loop.clone(), socket.fd());
        info!("connection {} created, fd={}", name, socket.fd());

        let conn = Arc::new(TcpConnection {
            event_loop,
            name,
            state: AtomicUsize::new(ConnState::Connecting.as_usize()),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback({
            let weak = weak.clone();
            Arc::new(move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            })
        });
        conn.channel.set_write_callback({
            let weak = weak.clone();
            Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            })
        });
        conn.channel.set_close_callback({
            let weak = weak.clone();
            Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            })
        });
        conn.channel.set_error_callback(Arc::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> &InetAddress {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &InetAddress {
        &self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.event_loop
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_usize(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state.as_usize(), Ordering::Release);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.lock().unwrap() = Some(cb);
        self.high_water_mark.store(mark, Ordering::Release);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(cb);
    }

    /// Sends `data`, copying it into a loop task when called off-thread.
    ///
    /// Anything not accepted by the kernel right away is parked in the output
    /// buffer and flushed as the socket turns writable.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            debug!("connection {} not connected, dropping send", self.name);
            return;
        }

        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Half-closes the write side once pending output has drained.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Finishes connection setup on the owning loop: ties the channel to this
    /// object, starts reading, and fires the user connection callback.
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(ConnState::Connected);

        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();

        let cb = self.connection_callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Terminal teardown on the owning loop; idempotent. Fires the user
    /// connection callback if the close path has not already done so, then
    /// withdraws the channel from the poller.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();

            let cb = self.connection_callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }

        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();

        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let message_cb = self.message_callback.lock().unwrap().clone();
                if let Some(cb) = message_cb {
                    cb(self, &mut input, receive_time);
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                drop(input);
                error!("connection {} read error: {}", self.name, e);
                if e.kind() == io::ErrorKind::ConnectionReset {
                    // A reset peer never delivers the orderly EOF; treat it
                    // as the close it is instead of re-polling the error.
                    self.handle_close();
                } else {
                    self.handle_error();
                }
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        if !self.channel.is_writing() {
            error!(
                "connection fd={} is down, no more writing",
                self.channel.fd()
            );
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();

                    let write_complete = self.write_complete_callback.lock().unwrap().clone();
                    if let Some(cb) = write_complete {
                        let conn = self.clone();
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }

                    if self.state() == ConnState::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("connection {} write error: {}", self.name, e),
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "connection {} close, fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );

        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        // Both callbacks get a strong reference so the object outlives the
        // cross-loop close handshake.
        let conn = self.clone();
        let connection_cb = self.connection_callback.lock().unwrap().clone();
        if let Some(cb) = connection_cb {
            cb(&conn);
        }
        let close_cb = self.close_callback.lock().unwrap().clone();
        if let Some(cb) = close_cb {
            cb(&conn);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("connection {} SO_ERROR: {}", self.name, e),
            Ok(None) => {}
            Err(e) => error!("connection {} SO_ERROR query failed: {}", self.name, e),
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();

        if self.state() == ConnState::Disconnected {
            error!("connection {} disconnected, give up writing", self.name);
            return;
        }

        let len = data.len();
        let mut wrote = 0usize;
        let mut fault_error = false;

        let mut output = self.output_buffer.lock().unwrap();

        // Nothing queued and not yet watching writability: try the kernel
        // directly.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match syscall!(write(
                self.channel.fd(),
                data.as_ptr() as *const c_void,
                len
            )) {
                Ok(n) => {
                    wrote = n as usize;
                    if wrote == len {
                        let write_complete =
                            self.write_complete_callback.lock().unwrap().clone();
                        if let Some(cb) = write_complete {
                            let conn = self.clone();
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("connection {} write error: {}", self.name, e);
                        if let Some(code) = e.raw_os_error() {
                            if code == libc::EPIPE || code == libc::ECONNRESET {
                                fault_error = true;
                            }
                        }
                    }
                }
            }
        }

        let remaining = len - wrote;
        if !fault_error && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);

            if old_len + remaining >= mark && old_len < mark {
                let high_water = self.high_water_mark_callback.lock().unwrap().clone();
                if let Some(cb) = high_water {
                    let conn = self.clone();
                    let size = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, size));
                }
            }

            output.append(&data[wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();

        // Pending output keeps the write side open; handle_write re-enters
        // here once the buffer drains.
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!("connection {} shutdown error: {}", self.name, e);
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "connection {} dropped, fd={} state={:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
    }
}
