//! # Mill-Reactor
//! A one-loop-per-thread reactor for non-blocking TCP servers, without an async
//! runtime.
//!
//! Mill-Reactor is built on top of [`mio`]. Every [`EventLoop`] is pinned to
//! the thread that created it and multiplexes readiness for the descriptors it
//! owns; a [`TcpServer`](net::tcp::TcpServer) accepts on one loop and spreads
//! connections round-robin over a pool of I/O loops.
//! ## Core Philosophy
//! - **Thread affinity in the types**: loops and connections are `!Send`;
//!   other threads talk to them through `Send` handles that queue work
//! - **Callbacks, not futures**: user code sees connection, message,
//!   write-complete and high-water-mark callbacks
//! - **No global state**: logging sinks are injected at construction
//! ## Architecture Overview
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  EventLoop   │───▶│   Channel    │───▶│ EpollPoller  │
//! └──────┬───────┘    └──────────────┘    └──────────────┘
//!        │ LoopHandle (queue_in_loop / quit)
//!        ▼
//! ┌──────────────┐    ┌──────────────────────┐
//! │  TcpServer   │───▶│ EventLoopThreadPool  │───▶ I/O loops
//! └──────────────┘    └──────────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_reactor::prelude::*;
//!
//! fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let event_loop = EventLoop::new()?;
//!     let config = TcpServerConfig::builder()
//!         .address("127.0.0.1:2007".parse()?)
//!         .name("echo")
//!         .thread_num(2)
//!         .build();
//!
//!     let server = TcpServer::new(&event_loop, config)?;
//!     server.set_message_callback(|conn, buf, _| conn.send_buffer(buf));
//!     server.start()?;
//!
//!     // Blocks until a LoopHandle calls quit()
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! - [`event_loop`]: the per-thread reactor and its cross-thread handle
//! - [`channel`]: descriptor, interest and callback binding
//! - [`poll`]: multiplexer abstraction and the epoll-backed implementation
//! - [`thread_pool`]: loop-per-thread workers
//! - [`buffer`]: growable byte buffer used for connection I/O
//! - [`net`]: sockets, acceptor, connections and the TCP server
//! - [`logger`] and [`error`]: ambient logging and error types

pub mod buffer;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod logger;
pub mod net;
pub mod poll;
pub mod registry;
pub mod thread_pool;
pub mod timestamp;

pub use buffer::Buffer;
pub use event_loop::{EventLoop, LoopConfig, LoopHandle};
pub use logger::{LogLevel, Logger, NoOpLogger, TracingLogger};
pub use timestamp::Timestamp;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_reactor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::{NetworkError, Result};
    pub use crate::event_loop::{EventLoop, LoopConfig, LoopHandle};
    pub use crate::logger::{LogLevel, Logger, NoOpLogger, TracingLogger};
    pub use crate::net::tcp::{
        ConnectionHandle, TcpConnection, TcpConnectionPtr, TcpServer, TcpServerConfig,
    };
    pub use crate::thread_pool::{EventLoopThread, EventLoopThreadPool};
    pub use crate::timestamp::Timestamp;
}
