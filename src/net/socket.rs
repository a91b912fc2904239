//! Owned TCP socket descriptor.
//!
//! Thin layer over [`socket2::Socket`]: every socket it hands out is
//! non-blocking and close-on-exec, and the descriptor is closed on drop.

use std::{
    io::{self, IoSlice, IoSliceMut, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::unix::io::{AsRawFd, RawFd},
};

use socket2::{Domain, Protocol, SockAddr, Type};

#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

fn to_socket_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "not an IP socket address")
    })
}

impl Socket {
    /// A fresh non-blocking TCP socket of the family `addr` belongs to.
    pub fn new_stream(addr: &SocketAddr) -> io::Result<Self> {
        let inner = socket2::Socket::new(
            Domain::for_address(*addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        inner.set_nonblocking(true)?;
        inner.set_cloexec(true)?;
        Ok(Self { inner })
    }

    /// Adopts a connected std stream, switching it to non-blocking mode.
    pub fn from_std(stream: TcpStream) -> io::Result<Self> {
        let inner = socket2::Socket::from(stream);
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(*addr))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accepts one pending connection as a non-blocking socket.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (inner, peer) = self.inner.accept()?;
        inner.set_nonblocking(true)?;
        Ok((Socket { inner }, to_socket_addr(peer)?))
    }

    /// Half-closes the write side; the peer reads end of stream.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.inner.local_addr()?)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.inner.peer_addr()?)
    }

    /// Pending `SO_ERROR`, cleared by the call.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        (&self.inner).read_vectored(bufs)
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        (&self.inner).write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn listener() -> Socket {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new_stream(&addr).unwrap();
        socket.set_reuse_addr(true).unwrap();
        socket.bind(&addr).unwrap();
        socket.listen(16).unwrap();
        socket
    }

    fn accept_with_retry(listener: &Socket) -> (Socket, SocketAddr) {
        for _ in 0..200 {
            match listener.accept() {
                Ok(accepted) => return accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
        panic!("no connection arrived");
    }

    #[test]
    fn test_accept_on_empty_backlog_would_block() {
        let listener = listener();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_accept_reports_peer_and_shutdown_write_sends_eof() {
        let listener = listener();
        let local = listener.local_addr().unwrap();
        assert_ne!(local.port(), 0);

        let mut client = TcpStream::connect(local).unwrap();
        let (accepted, peer) = accept_with_retry(&listener);
        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(accepted.peer_addr().unwrap(), peer);

        accepted.set_tcp_no_delay(true).unwrap();
        accepted.set_keep_alive(true).unwrap();
        (&accepted).write_all(b"bye").unwrap();
        accepted.shutdown_write().unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
        assert!(accepted.take_error().unwrap().is_none());
    }
}
