//! One established TCP connection, owned by a single I/O loop.
//!
//! ```text
//!  Connecting ──connect_established──▶ Connected ──shutdown──▶ Disconnecting
//!                                          │                        │
//!                                          └──── handle_close ──────┴──▶ Disconnected
//! ```
//!
//! States only move forward. A [`TcpConnection`] never leaves its loop's
//! thread; other threads reach it through a [`ConnectionHandle`].

use std::{
    cell::{Cell, RefCell},
    fmt,
    io::{self, Write},
    net::SocketAddr,
    rc::{Rc, Weak},
    sync::Arc,
};

use mio::Token;

use crate::{
    buffer::Buffer,
    channel::Channel,
    event_loop::{EventLoop, LoopHandle},
    logger::{LogLevel, Logger},
    net::socket::Socket,
    registry::OwnerId,
    timestamp::Timestamp,
};

use super::callbacks::{
    Callbacks, CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Whether adding `added` bytes to `queued` moves the output queue from below
/// `mark` to at or above it. Staying above the mark is not a crossing.
pub fn crosses_high_water_mark(queued: usize, added: usize, mark: usize) -> bool {
    queued < mark && queued.saturating_add(added) >= mark
}

pub struct TcpConnection {
    event_loop: Weak<EventLoop>,
    loop_handle: LoopHandle,
    me: Weak<TcpConnection>,
    id: OwnerId,
    name: String,
    state: Cell<State>,
    destroyed: Cell<bool>,
    socket: Socket,
    token: Token,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    high_water_mark: Cell<usize>,
    callbacks: RefCell<Callbacks>,
    close_callback: RefCell<Option<CloseCallback>>,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("fd", &self.socket.fd())
            .finish()
    }
}

impl TcpConnection {
    /// Wraps an accepted socket. The connection stays in `Connecting` with no
    /// interest registered until [`connect_established`](Self::connect_established).
    pub fn new(
        event_loop: &EventLoop,
        id: OwnerId,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me: &Weak<TcpConnection>| {
            let mut channel = Channel::new(socket.fd());
            let (on_read, on_write, on_close, on_error) =
                (me.clone(), me.clone(), me.clone(), me.clone());
            channel
                .set_read_callback(move |event_loop, receive_time| {
                    if let Some(conn) = on_read.upgrade() {
                        conn.handle_read(event_loop, receive_time);
                    }
                })
                .set_write_callback(move |event_loop| {
                    if let Some(conn) = on_write.upgrade() {
                        conn.handle_write(event_loop);
                    }
                })
                .set_close_callback(move |event_loop| {
                    if let Some(conn) = on_close.upgrade() {
                        conn.handle_close(event_loop);
                    }
                })
                .set_error_callback(move |_| {
                    if let Some(conn) = on_error.upgrade() {
                        conn.handle_error();
                    }
                });
            let token = event_loop.add_channel(channel);

            event_loop.logger().log(
                LogLevel::Debug,
                &format!("TcpConnection::new [{}] fd={}", name, socket.fd()),
            );

            TcpConnection {
                event_loop: event_loop.downgrade(),
                loop_handle: event_loop.handle(),
                me: me.clone(),
                id,
                name,
                state: Cell::new(State::Connecting),
                destroyed: Cell::new(false),
                socket,
                token,
                local_addr,
                peer_addr,
                input: RefCell::new(Buffer::new()),
                output: RefCell::new(Buffer::new()),
                high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: RefCell::new(Callbacks::default()),
                close_callback: RefCell::new(None),
                logger: event_loop.logger().clone(),
            }
        })
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn connected(&self) -> bool {
        self.state.get() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state.get() == State::Disconnected
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Bytes queued for the kernel but not yet written.
    pub fn output_bytes(&self) -> usize {
        self.output.borrow().readable_bytes()
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            name: Arc::from(self.name.as_str()),
            loop_handle: self.loop_handle.clone(),
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.callbacks.borrow_mut() = callbacks;
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.borrow_mut().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.borrow_mut().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.borrow_mut().write_complete = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.callbacks.borrow_mut().high_water_mark = Some(callback);
        self.high_water_mark.set(mark);
    }

    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.set(mark);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.borrow_mut() = Some(callback);
    }

    /// Queues `data` for the peer. Ignored unless the connection is connected.
    pub fn send(&self, data: &[u8]) {
        if self.state.get() != State::Connected {
            self.logger.log(
                LogLevel::Warn,
                &format!("TcpConnection::send [{}] not connected, give up writing", self.name),
            );
            return;
        }
        if let Some(event_loop) = self.event_loop.upgrade() {
            self.send_in_loop(&event_loop, data);
        }
    }

    /// Sends the readable region of `buf` and consumes it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        self.send(buf.peek());
        buf.retrieve_all();
    }

    fn send_in_loop(&self, event_loop: &EventLoop, data: &[u8]) {
        let mut written = 0;
        let mut fault = false;
        let writing = self.is_writing(event_loop);

        if !writing && self.output.borrow().is_empty() {
            match (&self.socket).write(data) {
                Ok(n) => {
                    written = n;
                    if n == data.len() {
                        self.queue_write_complete(event_loop);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.logger.log(
                        LogLevel::Error,
                        &format!("TcpConnection::send_in_loop [{}] - {}", self.name, e),
                    );
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = &data[written..];
        if fault || remaining.is_empty() {
            return;
        }

        let queued = self.output.borrow().readable_bytes();
        if crosses_high_water_mark(queued, remaining.len(), self.high_water_mark.get()) {
            let callback = self.callbacks.borrow().high_water_mark.clone();
            if let Some(callback) = callback {
                let id = self.id;
                let total = queued + remaining.len();
                event_loop.queue_in_loop(move |event_loop| {
                    if let Some(conn) = event_loop.owner::<TcpConnection>(id) {
                        callback(&conn, total);
                    }
                });
            }
        }

        self.output.borrow_mut().append(remaining);
        if !writing {
            event_loop.update_channel(self.token, |channel| {
                channel.enable_writing();
            });
        }
    }

    /// Half-closes the write side once queued output has drained.
    pub fn shutdown(&self) {
        if self.state.get() != State::Connected {
            return;
        }
        self.state.set(State::Disconnecting);
        if let Some(event_loop) = self.event_loop.upgrade() {
            self.shutdown_in_loop(&event_loop);
        }
    }

    fn shutdown_in_loop(&self, event_loop: &EventLoop) {
        if self.is_writing(event_loop) {
            // handle_write finishes the job once the output buffer is empty
            return;
        }
        if let Err(e) = self.socket.shutdown_write() {
            self.logger.log(
                LogLevel::Error,
                &format!("TcpConnection::shutdown_in_loop [{}] - {}", self.name, e),
            );
        }
    }

    /// Closes the connection on the next drain regardless of queued output.
    pub fn force_close(&self) {
        if !matches!(self.state.get(), State::Connected | State::Disconnecting) {
            return;
        }
        self.state.set(State::Disconnecting);
        if let Some(event_loop) = self.event_loop.upgrade() {
            let id = self.id;
            event_loop.queue_in_loop(move |event_loop| {
                if let Some(conn) = event_loop.owner::<TcpConnection>(id) {
                    conn.force_close_in_loop(event_loop);
                }
            });
        }
    }

    fn force_close_in_loop(&self, event_loop: &EventLoop) {
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.handle_close(event_loop);
        }
    }

    /// Called once by the owning loop right after the connection is stored
    /// in its registry.
    pub fn connect_established(&self, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        if self.state.get() != State::Connecting {
            self.logger.log(
                LogLevel::Error,
                &format!(
                    "TcpConnection::connect_established [{}] in state {:?}",
                    self.name,
                    self.state.get()
                ),
            );
            return;
        }
        self.state.set(State::Connected);

        let id = self.id;
        event_loop.update_channel(self.token, |channel| {
            channel.tie(id).enable_reading();
        });
        self.fire_connection_callback();
    }

    /// Final teardown: retires the registry entry and unregisters the channel.
    /// Only the first call has any effect.
    pub fn connect_destroyed(&self, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        if self.destroyed.replace(true) {
            return;
        }

        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.state.set(State::Disconnected);
            event_loop.update_channel(self.token, |channel| {
                channel.disable_all();
            });
            self.fire_connection_callback();
        }

        let entry = event_loop.retire_owner(self.id);
        event_loop.remove_channel(self.token);
        self.logger.log(
            LogLevel::Debug,
            &format!("TcpConnection::connect_destroyed [{}]", self.name),
        );
        drop(entry);
    }

    fn handle_read(&self, event_loop: &EventLoop, receive_time: Timestamp) {
        let mut total = 0;
        let mut eof = false;
        let mut failure = None;

        {
            let mut input = self.input.borrow_mut();
            loop {
                match input.read_from(&mut &self.socket) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => total += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if total > 0 {
            let callback = self.callbacks.borrow().message.clone();
            match (callback, self.me.upgrade()) {
                (Some(callback), Some(me)) => {
                    callback(&me, &mut self.input.borrow_mut(), receive_time)
                }
                _ => self.input.borrow_mut().retrieve_all(),
            }
        }

        if let Some(e) = failure {
            self.logger.log(
                LogLevel::Error,
                &format!("TcpConnection::handle_read [{}] - {}", self.name, e),
            );
            self.handle_error();
            self.handle_close(event_loop);
        } else if eof {
            self.handle_close(event_loop);
        }
    }

    fn handle_write(&self, event_loop: &EventLoop) {
        if !self.is_writing(event_loop) {
            self.logger.log(
                LogLevel::Debug,
                &format!("TcpConnection fd={} is down, no more writing", self.socket.fd()),
            );
            return;
        }

        let result = self.output.borrow().write_to(&mut &self.socket);
        match result {
            Ok(n) => {
                let drained = {
                    let mut output = self.output.borrow_mut();
                    output.retrieve(n);
                    output.is_empty()
                };
                if drained {
                    event_loop.update_channel(self.token, |channel| {
                        channel.disable_writing();
                    });
                    self.queue_write_complete(event_loop);
                    if self.state.get() == State::Disconnecting {
                        self.shutdown_in_loop(event_loop);
                    }
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => self.logger.log(
                LogLevel::Error,
                &format!("TcpConnection::handle_write [{}] - {}", self.name, e),
            ),
        }
    }

    fn handle_close(&self, event_loop: &EventLoop) {
        if self.state.get() == State::Disconnected {
            return;
        }
        self.logger.log(
            LogLevel::Debug,
            &format!(
                "TcpConnection::handle_close [{}] fd={} state={:?}",
                self.name,
                self.socket.fd(),
                self.state.get()
            ),
        );
        self.state.set(State::Disconnected);
        event_loop.update_channel(self.token, |channel| {
            channel.disable_all();
        });

        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.fire_connection_callback();
        let close = self.close_callback.borrow().clone();
        if let Some(close) = close {
            close(event_loop, &me);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => self.logger.log(
                LogLevel::Error,
                &format!("TcpConnection::handle_error [{}] - SO_ERROR = {}", self.name, e),
            ),
            Ok(None) => {}
            Err(e) => self.logger.log(
                LogLevel::Error,
                &format!("TcpConnection::handle_error [{}] - getsockopt: {}", self.name, e),
            ),
        }
    }

    fn fire_connection_callback(&self) {
        let callback = self.callbacks.borrow().connection.clone();
        match (callback, self.me.upgrade()) {
            (Some(callback), Some(me)) => callback(&me),
            _ => self.logger.log(
                LogLevel::Debug,
                &format!(
                    "{} -> {} is {}",
                    self.local_addr,
                    self.peer_addr,
                    if self.connected() { "UP" } else { "DOWN" }
                ),
            ),
        }
    }

    fn queue_write_complete(&self, event_loop: &EventLoop) {
        let callback = self.callbacks.borrow().write_complete.clone();
        if let Some(callback) = callback {
            let id = self.id;
            event_loop.queue_in_loop(move |event_loop| {
                if let Some(conn) = event_loop.owner::<TcpConnection>(id) {
                    callback(&conn);
                }
            });
        }
    }

    fn is_writing(&self, event_loop: &EventLoop) -> bool {
        event_loop
            .with_channel(self.token, Channel::is_writing)
            .unwrap_or(false)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.logger.log(
            LogLevel::Debug,
            &format!(
                "TcpConnection::drop [{}] fd={} state={:?}",
                self.name,
                self.socket.fd(),
                self.state.get()
            ),
        );
    }
}

/// `Send` reference to a connection that runs operations on its owning loop.
///
/// Operations on a connection that has since been destroyed are dropped.
///
/// Every operation is queued, even when called on the owning loop's thread, so
/// a `handle().send(..)` issued from a callback lands on the wire after any
/// direct [`TcpConnection::send`] made in the same callback. Inside callbacks,
/// use the `TcpConnectionPtr` directly when ordering matters.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: OwnerId,
    name: Arc<str>,
    loop_handle: LoopHandle,
}

impl ConnectionHandle {
    pub(crate) fn new(id: OwnerId, name: &str, loop_handle: LoopHandle) -> Self {
        Self {
            id,
            name: Arc::from(name),
            loop_handle,
        }
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Runs `f` with the connection on its owning loop.
    pub fn with_connection<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop, &TcpConnectionPtr) + Send + 'static,
    {
        let id = self.id;
        self.loop_handle.run_in_loop(move |event_loop| {
            if let Some(conn) = event_loop.owner::<TcpConnection>(id) {
                f(event_loop, &conn);
            }
        });
    }

    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        self.with_connection(move |_, conn| conn.send(&data));
    }

    pub fn shutdown(&self) {
        self.with_connection(|_, conn| conn.shutdown());
    }

    pub fn force_close(&self) {
        self.with_connection(|_, conn| conn.force_close());
    }

    pub(crate) fn destroy(&self) {
        self.with_connection(|event_loop, conn| conn.connect_destroyed(event_loop));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::LoopConfig;
    use crate::logger::tests::CaptureLogger;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_high_water_mark_crossing() {
        assert!(!crosses_high_water_mark(0, 99, 100));
        assert!(crosses_high_water_mark(0, 100, 100));
        assert!(crosses_high_water_mark(99, 1, 100));
        // already above: no refire
        assert!(!crosses_high_water_mark(100, 50, 100));
        assert!(!crosses_high_water_mark(150, 1, 100));
        assert!(!crosses_high_water_mark(usize::MAX - 1, 10, usize::MAX));
    }

    fn tcp_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (Socket::from_std(accepted).unwrap(), client)
    }

    fn connection(event_loop: &EventLoop, socket: Socket) -> TcpConnectionPtr {
        let local = socket.local_addr().unwrap();
        let peer = socket.peer_addr().unwrap();
        let id = event_loop.reserve_owner();
        let conn = TcpConnection::new(event_loop, id, "test#1".to_string(), socket, local, peer);
        event_loop.insert_owner(id, conn.clone());
        conn
    }

    #[test]
    fn test_lifecycle_is_forward_only() {
        let event_loop = EventLoop::new().unwrap();
        let (socket, mut client) = tcp_pair();
        let conn = connection(&event_loop, socket);

        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));
        let (u, d) = (ups.clone(), downs.clone());
        conn.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if conn.connected() {
                u.fetch_add(1, Ordering::SeqCst);
            } else {
                d.fetch_add(1, Ordering::SeqCst);
            }
        }));

        assert_eq!(conn.state(), State::Connecting);
        conn.connect_established(&event_loop);
        assert!(conn.connected());
        assert!(event_loop.has_channel(conn.token));

        conn.send(b"hello");
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        conn.handle_close(&event_loop);
        assert!(conn.disconnected());

        // no way back to Connected
        conn.connect_established(&event_loop);
        assert!(conn.disconnected());
        conn.send(b"ignored");
        assert_eq!(conn.output_bytes(), 0);

        conn.connect_destroyed(&event_loop);
        conn.connect_destroyed(&event_loop);
        assert!(!event_loop.owner_alive(conn.id()));
        assert!(!event_loop.has_channel(conn.token));

        assert_eq!(ups.load(Ordering::SeqCst), 1);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_before_established_is_logged_and_dropped() {
        let capture = Arc::new(CaptureLogger::default());
        let event_loop = EventLoop::with_config(LoopConfig {
            logger: capture.clone(),
            ..LoopConfig::default()
        })
        .unwrap();
        let (socket, _client) = tcp_pair();
        let conn = connection(&event_loop, socket);

        conn.send(b"too early");
        assert_eq!(conn.output_bytes(), 0);
        assert!(capture.contains(LogLevel::Warn, "give up writing"));
    }

    #[test]
    fn test_shutdown_with_empty_output_closes_write_side() {
        let event_loop = EventLoop::new().unwrap();
        let (socket, mut client) = tcp_pair();
        let conn = connection(&event_loop, socket);
        conn.connect_established(&event_loop);

        conn.send(b"last words");
        conn.shutdown();
        assert_eq!(conn.state(), State::Disconnecting);

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"last words");

        // a second shutdown is a no-op outside Connected
        conn.shutdown();
        assert_eq!(conn.state(), State::Disconnecting);
    }

    #[test]
    fn test_handle_queues_onto_owning_loop() {
        let event_loop = EventLoop::new().unwrap();
        let (socket, mut client) = tcp_pair();
        let conn = connection(&event_loop, socket);
        conn.connect_established(&event_loop);

        let handle = conn.handle();
        assert_eq!(handle.name(), "test#1");
        std::thread::spawn(move || handle.send("from afar"))
            .join()
            .unwrap();

        // nothing happens until the loop drains its queue
        event_loop.quit();
        event_loop.run();

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"from afar");
    }
}
