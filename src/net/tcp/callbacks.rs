//! User-facing callback types.
//!
//! Callbacks are installed once on a [`TcpServer`](super::TcpServer) and shared
//! by every I/O loop, hence `Send + Sync`. They are always invoked on the loop
//! that owns the connection, with the connection lent in.

use std::rc::Rc;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

use super::connection::TcpConnection;

pub use crate::thread_pool::ThreadInitCallback;

/// Shared pointer to a connection; only ever held on its owning loop.
pub type TcpConnectionPtr = Rc<TcpConnection>;

/// Fires on connection up and connection down; check `connected()`.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fires once per readable event with every newly read byte in the buffer.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Receives the queued byte count that crossed the mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Internal teardown hook a server installs on each of its connections.
pub(crate) type CloseCallback = Rc<dyn Fn(&EventLoop, &TcpConnectionPtr)>;

/// The callback templates a server copies onto each new connection.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub connection: Option<ConnectionCallback>,
    pub message: Option<MessageCallback>,
    pub write_complete: Option<WriteCompleteCallback>,
    pub high_water_mark: Option<HighWaterMarkCallback>,
}
