//! A multi-reactor TCP server framework for Rust: non-blocking sockets,
//! epoll-backed event loops bound one-per-thread, and callback-driven
//! connections, plus a generic task thread pool and a pooled-connection
//! primitive that share the same bounded-queue, condition-variable
//! discipline.
//!
//! ## Architecture
//!
//! One *base loop* owns the listening socket. Each accepted connection is
//! dealt to the next *sub-loop* round robin and belongs to that loop's
//! thread from then on: its channel, its buffers and every callback run
//! there. Work submitted from other threads crosses over through
//! [`LoopHandle::run_in_loop`], which queues the task and taps the loop's
//! eventfd so it is picked up promptly.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hive_io::{EventLoop, InetAddress, ServerOption, TcpServer};
//!
//! let mut base_loop = EventLoop::new().unwrap();
//!
//! let addr = InetAddress::new("127.0.0.1", 8000).unwrap();
//! let server = TcpServer::new(
//!     base_loop.handle().clone(),
//!     addr,
//!     "echo",
//!     ServerOption::NoReusePort,
//! )
//! .unwrap();
//!
//! server.set_thread_num(3);
//! server.set_message_callback(Arc::new(|conn, buf, _when| {
//!     let msg = buf.retrieve_all_as_string();
//!     conn.send(msg.as_bytes());
//! }));
//!
//! server.start();
//! base_loop.run();
//! ```

mod sys;

mod acceptor;
mod buffer;
mod channel;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod inet_address;
mod poller;
mod ready;
mod socket;
mod tcp_connection;
mod tcp_server;
mod timestamp;
mod waker;

pub mod callbacks;
pub mod connection_pool;
pub mod thread_pool;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use channel::{Channel, EventCallback, ReadEventCallback};
pub use connection_pool::{Connect, ConnectionPool, Lease, PoolConfig};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use inet_address::InetAddress;
pub use ready::Ready;
pub use socket::Socket;
pub use tcp_connection::{ConnState, TcpConnection};
pub use tcp_server::{ServerOption, TcpServer};
pub use thread_pool::{PoolMode, SubmitError, TaskHandle, ThreadPool};
pub use timestamp::Timestamp;
pub use waker::Waker;
