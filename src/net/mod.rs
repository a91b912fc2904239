//! Networking on top of the reactor core.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         TcpServer                             │
//! │   Acceptor ──▶ new_connection ──▶ EventLoopThreadPool         │
//! └───────────────────────┬───────────────────────────────────────┘
//!                         │ run_in_loop
//!                         ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │  I/O EventLoop: TcpConnection ◀── Channel ◀── EpollPoller     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`socket::Socket`] is the only place raw socket options are touched.

pub mod socket;
pub mod tcp;
