use std::sync::Arc;

use crate::buffer::Buffer;
use crate::event_loop::LoopHandle;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

/// Shared handle to a connection; every callback receives one of these.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fired once when a connection comes up and once when it goes down.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired when input arrives; the buffer holds everything received so far and
/// the timestamp is the poll return time.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired when the output buffer drains completely.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired when pending output crosses the high-water mark; carries the
/// projected output size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Internal: routes a closing connection back to the server that registered
/// it.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Runs once on each loop thread right after its loop is constructed.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;
