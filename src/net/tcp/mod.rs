//! Multi-threaded TCP server built from one acceptor loop and N I/O loops.
//!
//! The loop the server is created on accepts connections and owns the
//! connection table. Each accepted socket is handed round-robin to an I/O loop,
//! which builds the [`TcpConnection`] on its own thread and serves it for its
//! whole life.
//!
//! ```text
//!   main loop                               I/O loop k
//!   ─────────                               ──────────
//!   Acceptor::handle_read
//!     └─ new_connection ── run_in_loop ──▶  TcpConnection::new
//!          table.insert(name)                connect_established ─▶ on_connection(up)
//!
//!                                            handle_close ─▶ on_connection(down)
//!   remove_connection_in_loop ◀── queue ────┘
//!     table.remove(name) ─────── queue ──▶  connect_destroyed
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use mill_reactor::net::tcp::{TcpServer, TcpServerConfig};
//! use mill_reactor::EventLoop;
//!
//! # fn main() -> mill_reactor::error::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let config = TcpServerConfig::builder()
//!     .address("0.0.0.0:2007".parse().unwrap())
//!     .name("echo")
//!     .thread_num(4)                   // four I/O loops
//!     .high_water_mark(8 * 1024 * 1024)
//!     .build();
//!
//! let server = TcpServer::new(&event_loop, config)?;
//! server.set_message_callback(|conn, buf, _receive_time| {
//!     conn.send_buffer(buf);
//! });
//! server.start()?;
//! event_loop.run();
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod callbacks;
pub mod config;
pub mod connection;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::SocketAddr,
    rc::{Rc, Weak},
    sync::Arc,
};

use crate::{
    buffer::Buffer,
    error::{NetworkError, Result},
    event_loop::{EventLoop, LoopHandle},
    logger::{LogLevel, Logger},
    net::socket::Socket,
    registry::OwnerId,
    thread_pool::EventLoopThreadPool,
    timestamp::Timestamp,
};

pub use acceptor::Acceptor;
pub use callbacks::{
    Callbacks, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use config::{TcpServerConfig, TcpServerConfigBuilder};
pub use connection::{crosses_high_water_mark, ConnectionHandle, State, TcpConnection};

struct ServerInner {
    id: OwnerId,
    event_loop: Weak<EventLoop>,
    name: String,
    ip_port: String,
    local_addr: SocketAddr,
    acceptor: Rc<Acceptor>,
    pool: RefCell<EventLoopThreadPool>,
    callbacks: RefCell<Callbacks>,
    thread_init: RefCell<Option<ThreadInitCallback>>,
    started: Cell<bool>,
    next_conn_id: Cell<u64>,
    connections: RefCell<HashMap<String, ConnectionHandle>>,
    high_water_mark: Cell<usize>,
    no_delay: bool,
    keep_alive: bool,
    logger: Arc<dyn Logger>,
}

/// Everything an I/O loop needs to build a connection on its own thread.
struct PendingConnection {
    id: OwnerId,
    name: String,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    callbacks: Callbacks,
    high_water_mark: usize,
    server: OwnerId,
    main_loop: LoopHandle,
}

impl PendingConnection {
    fn establish(self, event_loop: &EventLoop) {
        let conn = TcpConnection::new(
            event_loop,
            self.id,
            self.name,
            self.socket,
            self.local_addr,
            self.peer_addr,
        );
        conn.set_callbacks(self.callbacks);
        conn.set_high_water_mark(self.high_water_mark);

        let (main_loop, server) = (self.main_loop, self.server);
        conn.set_close_callback(Rc::new(move |_: &EventLoop, conn: &TcpConnectionPtr| {
            let name = conn.name().to_owned();
            main_loop.run_in_loop(move |event_loop| {
                if let Some(server) = event_loop.owner::<ServerInner>(server) {
                    server.remove_connection_in_loop(event_loop, &name);
                }
            });
        }));

        event_loop.insert_owner(self.id, conn.clone());
        conn.connect_established(event_loop);
    }
}

impl ServerInner {
    fn new_connection(&self, event_loop: &EventLoop, socket: Socket, peer_addr: SocketAddr) {
        event_loop.assert_in_loop_thread();
        let io_loop = self.pool.borrow().next_loop();

        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        self.logger.log(
            LogLevel::Info,
            &format!(
                "TcpServer::new_connection [{}] - new connection [{}] from {}",
                self.name, name, peer_addr
            ),
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.logger.log(
                    LogLevel::Error,
                    &format!("TcpServer::new_connection [{}] - getsockname: {}", name, e),
                );
                return;
            }
        };
        if let Err(e) = socket.set_keep_alive(self.keep_alive) {
            self.logger.log(
                LogLevel::Warn,
                &format!("TcpServer::new_connection [{}] - SO_KEEPALIVE: {}", name, e),
            );
        }
        if self.no_delay {
            if let Err(e) = socket.set_tcp_no_delay(true) {
                self.logger.log(
                    LogLevel::Warn,
                    &format!("TcpServer::new_connection [{}] - TCP_NODELAY: {}", name, e),
                );
            }
        }

        let id = OwnerId::next();
        self.connections.borrow_mut().insert(
            name.clone(),
            ConnectionHandle::new(id, &name, io_loop.clone()),
        );

        let pending = PendingConnection {
            id,
            name,
            socket,
            local_addr,
            peer_addr,
            callbacks: self.callbacks.borrow().clone(),
            high_water_mark: self.high_water_mark.get(),
            server: self.id,
            main_loop: event_loop.handle(),
        };
        if io_loop.same_loop(&event_loop.handle()) {
            pending.establish(event_loop);
        } else {
            io_loop.run_in_loop(move |event_loop| pending.establish(event_loop));
        }
    }

    fn remove_connection_in_loop(&self, event_loop: &EventLoop, name: &str) {
        event_loop.assert_in_loop_thread();
        self.logger.log(
            LogLevel::Info,
            &format!(
                "TcpServer::remove_connection_in_loop [{}] - connection {}",
                self.name, name
            ),
        );

        let removed = self.connections.borrow_mut().remove(name);
        if let Some(handle) = removed {
            handle.destroy();
        }
    }
}

/// TCP server handing accepted connections to a pool of I/O loops.
///
/// A `TcpServer` lives on the loop it was created with. Dropping it stops the
/// I/O threads after every live connection has been torn down.
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

impl TcpServer {
    /// Binds the listening socket; connections are accepted after
    /// [`start`](Self::start).
    ///
    /// ## Errors
    ///
    /// Returns [`NetworkError::Bind`] if the address cannot be bound.
    pub fn new(event_loop: &EventLoop, config: TcpServerConfig) -> Result<Self> {
        event_loop.assert_in_loop_thread();
        let acceptor = Acceptor::new(
            event_loop,
            &config.address,
            config.reuse_port,
            config.listen_backlog,
        )?;
        let local_addr = acceptor.local_addr()?;

        let mut pool =
            EventLoopThreadPool::new(event_loop, config.name.clone(), config.loop_config.clone());
        pool.set_thread_num(config.thread_num);

        let id = event_loop.reserve_owner();
        let inner = Rc::new(ServerInner {
            id,
            event_loop: event_loop.downgrade(),
            name: config.name,
            ip_port: local_addr.to_string(),
            local_addr,
            acceptor,
            pool: RefCell::new(pool),
            callbacks: RefCell::new(Callbacks::default()),
            thread_init: RefCell::new(None),
            started: Cell::new(false),
            next_conn_id: Cell::new(1),
            connections: RefCell::new(HashMap::new()),
            high_water_mark: Cell::new(config.high_water_mark),
            no_delay: config.no_delay,
            keep_alive: config.keep_alive,
            logger: config.logger,
        });
        event_loop.insert_owner(id, inner.clone());

        inner
            .acceptor
            .set_new_connection_callback(move |event_loop, socket, peer_addr| {
                if let Some(server) = event_loop.owner::<ServerInner>(id) {
                    server.new_connection(event_loop, socket, peer_addr);
                }
            });

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bound address in `ip:port` form.
    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// # Panics
    ///
    /// Panics if the server has already been started.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.borrow_mut().set_thread_num(num_threads);
    }

    pub fn thread_num(&self) -> usize {
        self.inner.pool.borrow().thread_num()
    }

    pub fn set_thread_init_callback<F>(&self, callback: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        *self.inner.thread_init.borrow_mut() = Some(Arc::new(callback));
    }

    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        self.inner.callbacks.borrow_mut().connection = Some(Arc::new(callback));
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    {
        self.inner.callbacks.borrow_mut().message = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        self.inner.callbacks.borrow_mut().write_complete = Some(Arc::new(callback));
    }

    pub fn set_high_water_mark_callback<F>(&self, callback: F, high_water_mark: usize)
    where
        F: Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
    {
        self.inner.callbacks.borrow_mut().high_water_mark = Some(Arc::new(callback));
        self.inner.high_water_mark.set(high_water_mark);
    }

    /// Starts the I/O threads and begins accepting. Calling it again is a no-op.
    ///
    /// ## Errors
    ///
    /// Returns an error if an I/O thread cannot be started or `listen(2)`
    /// fails.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.replace(true) {
            return Ok(());
        }
        let event_loop = self
            .inner
            .event_loop
            .upgrade()
            .ok_or(NetworkError::EventLoopGone)?;

        let init = self.inner.thread_init.borrow().clone();
        self.inner.pool.borrow_mut().start(&event_loop, init)?;
        if !self.inner.acceptor.listening() {
            self.inner.acceptor.listen(&event_loop)?;
        }

        self.inner.logger.log(
            LogLevel::Info,
            &format!(
                "TcpServer [{}] listening on {} with {} I/O threads",
                self.inner.name,
                self.inner.ip_port,
                self.thread_num()
            ),
        );
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.inner.connections.borrow().values().cloned().collect()
    }

    /// Queues `data` on the named connection.
    ///
    /// ## Errors
    ///
    /// Returns [`NetworkError::ConnectionNotFound`] when no live connection has
    /// that name.
    pub fn send_to(&self, name: &str, data: &[u8]) -> Result<()> {
        let handle = self.inner.connections.borrow().get(name).cloned();
        match handle {
            Some(handle) => {
                handle.send(data);
                Ok(())
            }
            None => Err(NetworkError::ConnectionNotFound(name.to_owned())),
        }
    }

    /// Queues `data` on every live connection.
    pub fn broadcast(&self, data: &[u8]) {
        for handle in self.connections() {
            handle.send(data);
        }
    }

    /// Every loop connections may be assigned to.
    pub fn loops(&self) -> Vec<LoopHandle> {
        self.inner.pool.borrow().all_loops()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let Some(event_loop) = self.inner.event_loop.upgrade() else {
            return;
        };
        self.inner.logger.log(
            LogLevel::Debug,
            &format!("TcpServer::drop [{}] destructing", self.inner.name),
        );

        let entry = event_loop.retire_owner(self.inner.id);
        let live: Vec<ConnectionHandle> = self
            .inner
            .connections
            .borrow_mut()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in live {
            handle.destroy();
        }
        drop(entry);
    }
}
