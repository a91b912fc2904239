use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::result::Result as StdResult;

pub type Result<T> = StdResult<T, NetworkError>;

#[derive(Debug)]
pub enum NetworkError {
    Io(io::Error),
    Bind { addr: SocketAddr, source: io::Error },
    Listen { addr: SocketAddr, source: io::Error },
    ThreadSpawn(io::Error),
    Configuration(String),
    ConnectionNotFound(String),
    EventLoopGone,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(e) => write!(f, "IO Error: {}", e),
            NetworkError::Bind { addr, source } => write!(f, "Bind Error on {}: {}", addr, source),
            NetworkError::Listen { addr, source } => {
                write!(f, "Listen Error on {}: {}", addr, source)
            }
            NetworkError::ThreadSpawn(e) => write!(f, "Thread Spawn Error: {}", e),
            NetworkError::Configuration(msg) => write!(f, "Configuration Error: {}", msg),
            NetworkError::ConnectionNotFound(name) => write!(f, "Connection not found: {}", name),
            NetworkError::EventLoopGone => write!(f, "EventLoop is gone"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(e) | NetworkError::ThreadSpawn(e) => Some(e),
            NetworkError::Bind { source, .. } | NetworkError::Listen { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_bind_error_display_and_source() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let err = NetworkError::Bind {
            addr,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };

        assert!(err.to_string().starts_with("Bind Error on 127.0.0.1:80"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_from_io_error() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err, NetworkError::Io(_)));
        assert!(NetworkError::EventLoopGone.source().is_none());
    }
}
