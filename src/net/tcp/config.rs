use std::{net::SocketAddr, sync::Arc};

use crate::{event_loop::LoopConfig, logger::Logger};

use super::connection::DEFAULT_HIGH_WATER_MARK;

pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

/// Configuration for TCP server.
///
/// Controls the listening socket, the I/O thread pool and per-connection
/// defaults. Use `TcpServerConfig::builder()` for ergonomic construction.
///
/// ## Socket Options
///
/// - reuse_port: sets SO_REUSEPORT on the listening socket (SO_REUSEADDR is always set)
/// - no_delay: when enabled, disables Nagle's algorithm on accepted sockets
/// - keep_alive: configures SO_KEEPALIVE on accepted sockets
///
/// ## Threads
///
/// - thread_num: number of I/O loops; 0 serves every connection on the loop
///   the server was created on
#[derive(Clone)]
pub struct TcpServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Server name, prefix of connection and thread names
    pub name: String,
    /// Number of I/O threads
    pub thread_num: usize,
    /// SO_REUSEPORT on the listening socket
    pub reuse_port: bool,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// SO_KEEPALIVE setting
    pub keep_alive: bool,
    /// Queued output size that triggers the high-water-mark callback
    pub high_water_mark: usize,
    /// listen(2) backlog
    pub listen_backlog: i32,
    /// Settings for every I/O loop the server spawns
    pub loop_config: LoopConfig,
    /// Logger for network events
    pub logger: Arc<dyn Logger>,
}

impl TcpServerConfig {
    /// Create a new builder for TcpServerConfig
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        let loop_config = LoopConfig::default();
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            name: "TcpServer".to_string(),
            thread_num: 0,
            reuse_port: false,
            no_delay: false,
            keep_alive: true,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            logger: loop_config.logger.clone(),
            loop_config,
        }
    }
}

/// Builder for TcpServerConfig using the builder pattern.
///
/// All fields are optional and will use defaults from TcpServerConfig::default()
/// if not explicitly set. A logger set here is also handed to the I/O loops
/// unless `loop_config` is set explicitly.
#[derive(Default)]
pub struct TcpServerConfigBuilder {
    address: Option<SocketAddr>,
    name: Option<String>,
    thread_num: Option<usize>,
    reuse_port: Option<bool>,
    no_delay: Option<bool>,
    keep_alive: Option<bool>,
    high_water_mark: Option<usize>,
    listen_backlog: Option<i32>,
    loop_config: Option<LoopConfig>,
    logger: Option<Arc<dyn Logger>>,
}

impl TcpServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the number of I/O threads
    pub fn thread_num(mut self, thread_num: usize) -> Self {
        self.thread_num = Some(thread_num);
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Enable or disable SO_KEEPALIVE
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = Some(bytes);
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = Some(backlog);
        self
    }

    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = Some(config);
        self
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the TcpServerConfig
    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        let logger = self.logger.unwrap_or(default.logger);
        let loop_config = self.loop_config.unwrap_or_else(|| LoopConfig {
            logger: logger.clone(),
            ..default.loop_config
        });
        TcpServerConfig {
            address: self.address.unwrap_or(default.address),
            name: self.name.unwrap_or(default.name),
            thread_num: self.thread_num.unwrap_or(default.thread_num),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            high_water_mark: self.high_water_mark.unwrap_or(default.high_water_mark),
            listen_backlog: self.listen_backlog.unwrap_or(default.listen_backlog),
            loop_config,
            logger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoOpLogger;
    use std::time::Duration;

    #[test]
    fn test_builder_falls_back_to_defaults() {
        let config = TcpServerConfig::builder().build();
        assert_eq!(config.address, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.thread_num, 0);
        assert!(config.keep_alive);
        assert!(!config.no_delay);
        assert_eq!(config.high_water_mark, 64 * 1024 * 1024);
        assert_eq!(config.listen_backlog, DEFAULT_LISTEN_BACKLOG);
        assert_eq!(config.loop_config.events_capacity, 16);
    }

    #[test]
    fn test_builder_logger_reaches_loop_config() {
        let logger: Arc<dyn Logger> = Arc::new(NoOpLogger);
        let config = TcpServerConfig::builder()
            .name("echo")
            .thread_num(4)
            .logger(logger.clone())
            .build();

        assert_eq!(config.name, "echo");
        assert_eq!(config.thread_num, 4);
        assert!(Arc::ptr_eq(&config.loop_config.logger, &logger));
    }

    #[test]
    fn test_explicit_loop_config_wins() {
        let config = TcpServerConfig::builder()
            .loop_config(LoopConfig {
                poll_timeout: Duration::from_millis(5),
                ..LoopConfig::default()
            })
            .build();
        assert_eq!(config.loop_config.poll_timeout, Duration::from_millis(5));
    }
}
