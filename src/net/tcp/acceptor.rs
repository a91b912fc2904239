//! Listening socket that turns readable events into accepted connections.

use std::{
    cell::{Cell, RefCell},
    io,
    net::SocketAddr,
    rc::{Rc, Weak},
    sync::Arc,
};

use mio::Token;

use crate::{
    channel::Channel,
    error::{NetworkError, Result},
    event_loop::EventLoop,
    logger::{LogLevel, Logger},
    net::socket::Socket,
};

/// Receives each accepted socket together with its peer address.
pub type NewConnectionCallback = Rc<dyn Fn(&EventLoop, Socket, SocketAddr)>;

pub struct Acceptor {
    event_loop: Weak<EventLoop>,
    socket: Socket,
    token: Token,
    backlog: i32,
    listening: Cell<bool>,
    new_connection: RefCell<Option<NewConnectionCallback>>,
    logger: Arc<dyn Logger>,
}

impl Acceptor {
    /// Binds a non-blocking listening socket to `addr`; nothing is accepted
    /// until [`listen`](Self::listen).
    ///
    /// ## Errors
    ///
    /// Returns [`NetworkError::Bind`] when the address cannot be bound.
    pub fn new(
        event_loop: &EventLoop,
        addr: &SocketAddr,
        reuse_port: bool,
        backlog: i32,
    ) -> Result<Rc<Self>> {
        let bind_error = |source: io::Error| NetworkError::Bind {
            addr: *addr,
            source,
        };
        let socket = Socket::new_stream(addr).map_err(bind_error)?;
        socket.set_reuse_addr(true).map_err(bind_error)?;
        if reuse_port {
            socket.set_reuse_port(true).map_err(bind_error)?;
        }
        socket.bind(addr).map_err(bind_error)?;

        Ok(Rc::new_cyclic(|me: &Weak<Acceptor>| {
            let mut channel = Channel::new(socket.fd());
            let acceptor = me.clone();
            channel.set_read_callback(move |event_loop, _| {
                if let Some(acceptor) = acceptor.upgrade() {
                    acceptor.handle_read(event_loop);
                }
            });

            Acceptor {
                event_loop: event_loop.downgrade(),
                token: event_loop.add_channel(channel),
                socket,
                backlog,
                listening: Cell::new(false),
                new_connection: RefCell::new(None),
                logger: event_loop.logger().clone(),
            }
        }))
    }

    pub fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&EventLoop, Socket, SocketAddr) + 'static,
    {
        *self.new_connection.borrow_mut() = Some(Rc::new(callback));
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts listening and arms read interest on the listening socket.
    ///
    /// ## Errors
    ///
    /// Returns [`NetworkError::Listen`] when the OS rejects `listen(2)`.
    pub fn listen(&self, event_loop: &EventLoop) -> Result<()> {
        event_loop.assert_in_loop_thread();
        self.socket.listen(self.backlog).map_err(|source| NetworkError::Listen {
            addr: self.local_addr().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0))),
            source,
        })?;
        self.listening.set(true);
        event_loop.update_channel(self.token, |channel| {
            channel.enable_reading();
        });
        Ok(())
    }

    fn handle_read(&self, event_loop: &EventLoop) {
        loop {
            match self.socket.accept() {
                Ok((socket, peer_addr)) => {
                    let callback = self.new_connection.borrow().clone();
                    match callback {
                        Some(callback) => callback(event_loop, socket, peer_addr),
                        None => {
                            self.logger.log(
                                LogLevel::Debug,
                                &format!("Acceptor dropped {} with no handler", peer_addr),
                            );
                            drop(socket);
                        }
                    }
                }
                Err(e) => match AcceptStep::after(&e) {
                    AcceptStep::Drained => break,
                    AcceptStep::Retry => {}
                    AcceptStep::Rearm => {
                        self.logger
                            .log(LogLevel::Error, &format!("Acceptor::handle_read - {}", e));
                        // readiness is edge-triggered: without a fresh MOD the
                        // remaining backlog waits for the next incoming connection
                        event_loop.update_channel(self.token, |channel| {
                            channel.enable_reading();
                        });
                        break;
                    }
                },
            }
        }
    }
}

/// What the accept loop does after `accept(2)` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStep {
    /// The backlog is empty.
    Drained,
    /// Transient; try the next pending connection.
    Retry,
    /// Hard failure such as `EMFILE`; stop for now and ask the poller to
    /// report the listener again.
    Rearm,
}

impl AcceptStep {
    fn after(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => AcceptStep::Drained,
            io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => AcceptStep::Retry,
            _ => AcceptStep::Rearm,
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self.token, |channel| {
                channel.disable_all();
            });
            event_loop.remove_channel(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_accept_errors_map_to_steps() {
        let step = |kind| AcceptStep::after(&io::Error::from(kind));
        assert_eq!(step(io::ErrorKind::WouldBlock), AcceptStep::Drained);
        assert_eq!(step(io::ErrorKind::Interrupted), AcceptStep::Retry);
        assert_eq!(step(io::ErrorKind::ConnectionAborted), AcceptStep::Retry);
        // EMFILE / ENFILE surface as uncategorized OS errors
        assert_eq!(
            AcceptStep::after(&io::Error::from_raw_os_error(24)),
            AcceptStep::Rearm
        );
        assert_eq!(
            AcceptStep::after(&io::Error::from_raw_os_error(23)),
            AcceptStep::Rearm
        );
    }

    #[test]
    fn test_rearmed_listener_reports_pending_backlog_again() {
        let event_loop = EventLoop::with_config(crate::event_loop::LoopConfig {
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        let acceptor = Acceptor::new(&event_loop, &any_port(), false, 16).unwrap();
        acceptor.listen(&event_loop).unwrap();
        let addr = acceptor.local_addr().unwrap();

        // an edge that is consumed without accepting leaves the backlog pending
        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let active = event_loop.poll_once(Duration::from_millis(200));
        assert!(active.iter().any(|(token, _)| *token == acceptor.token));

        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        acceptor.set_new_connection_callback(move |event_loop, _socket, _peer| {
            counter.fetch_add(1, Ordering::SeqCst);
            event_loop.quit();
        });
        event_loop.update_channel(acceptor.token, |channel| {
            channel.enable_reading();
        });

        let handle = event_loop.handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(2));
            handle.quit();
        });
        event_loop.run();
        stopper.join().unwrap();

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let event_loop = EventLoop::new().unwrap();
        let first = Acceptor::new(&event_loop, &any_port(), false, 16).unwrap();
        first.listen(&event_loop).unwrap();
        let taken = first.local_addr().unwrap();

        match Acceptor::new(&event_loop, &taken, false, 16) {
            Err(NetworkError::Bind { addr, .. }) => assert_eq!(addr, taken),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("second bind to {} succeeded", taken),
        }
    }

    #[test]
    fn test_accepts_every_pending_connection() {
        let event_loop = EventLoop::with_config(crate::event_loop::LoopConfig {
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        let acceptor = Acceptor::new(&event_loop, &any_port(), false, 16).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        acceptor.set_new_connection_callback(move |event_loop, _socket, _peer| {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                event_loop.quit();
            }
        });
        acceptor.listen(&event_loop).unwrap();
        assert!(acceptor.listening());

        let addr = acceptor.local_addr().unwrap();
        let _clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        event_loop.run();

        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_without_handler_connection_is_closed() {
        let event_loop = EventLoop::with_config(crate::event_loop::LoopConfig {
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        let acceptor = Acceptor::new(&event_loop, &any_port(), false, 16).unwrap();
        acceptor.listen(&event_loop).unwrap();

        let mut client = TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let handle = event_loop.handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            handle.quit();
        });
        event_loop.run();
        stopper.join().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
