//! Readiness multiplexer abstraction and its epoll-backed implementation.

use std::{
    collections::HashMap,
    io,
    os::unix::io::RawFd,
    sync::Arc,
    time::Duration,
};

use mio::{unix::SourceFd, Events, Poll, Token};

use crate::{
    channel::{Channel, ChannelState, Ready},
    logger::{LogLevel, Logger},
    timestamp::Timestamp,
};

/// Initial size of the OS event list handed to each wait call.
pub const DEFAULT_EVENTS_CAPACITY: usize = 16;

/// What an event loop needs from a readiness multiplexer.
pub trait Poller {
    /// Blocks up to `timeout`, then appends `(token, readiness)` for every
    /// ready channel in the order the OS reported them.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<(Token, Ready)>,
    ) -> io::Result<Timestamp>;

    /// Registers, re-registers or unregisters `channel` according to its
    /// current interest and state.
    ///
    /// ## Errors
    ///
    /// Returns an error only when adding or modifying an OS registration fails.
    fn update_channel(&mut self, channel: &mut Channel) -> io::Result<()>;

    /// Forgets `channel`, unregistering it from the OS first if needed.
    fn remove_channel(&mut self, channel: &mut Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

/// [`Poller`] over `mio::Poll`, which is epoll on Linux.
pub struct EpollPoller {
    poll: Poll,
    events: Events,
    events_capacity: usize,
    channels: HashMap<Token, RawFd>,
    logger: Arc<dyn Logger>,
}

impl EpollPoller {
    pub fn new(events_capacity: usize, logger: Arc<dyn Logger>) -> io::Result<Self> {
        let events_capacity = events_capacity.max(1);
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
            events_capacity,
            channels: HashMap::new(),
            logger,
        })
    }

    pub fn events_capacity(&self) -> usize {
        self.events_capacity
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Poller for EpollPoller {
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<(Token, Ready)>,
    ) -> io::Result<Timestamp> {
        let result = self.poll.poll(&mut self.events, timeout);
        let now = Timestamp::now();

        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.logger.log(LogLevel::Debug, "EpollPoller::poll interrupted");
                return Ok(now);
            }
            Err(e) => return Err(e),
        }

        let mut count = 0;
        for event in self.events.iter() {
            active.push((event.token(), Ready::from(event)));
            count += 1;
        }

        if count == 0 {
            self.logger.log(LogLevel::Debug, "EpollPoller::poll timeout");
        } else if count == self.events_capacity {
            // a full event list may have left ready descriptors behind
            self.events_capacity *= 2;
            self.events = Events::with_capacity(self.events_capacity);
        }

        Ok(now)
    }

    fn update_channel(&mut self, channel: &mut Channel) -> io::Result<()> {
        let token = channel.token();
        let fd = channel.fd();
        let registry = self.poll.registry();

        self.logger.log(
            LogLevel::Debug,
            &format!(
                "EpollPoller::update_channel fd={} interest={:?} state={:?}",
                fd,
                channel.interest(),
                channel.state()
            ),
        );

        match channel.state() {
            ChannelState::New | ChannelState::Deleted => {
                if channel.state() == ChannelState::New {
                    self.channels.insert(token, fd);
                }
                match channel.interest().to_mio() {
                    Some(interest) => {
                        registry.register(&mut SourceFd(&fd), token, interest)?;
                        channel.set_state(ChannelState::Added);
                    }
                    None => channel.set_state(ChannelState::Deleted),
                }
            }
            ChannelState::Added => match channel.interest().to_mio() {
                Some(interest) => registry.reregister(&mut SourceFd(&fd), token, interest)?,
                None => {
                    if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                        self.logger.log(
                            LogLevel::Error,
                            &format!("EpollPoller deregister fd={} failed: {}", fd, e),
                        );
                    }
                    channel.set_state(ChannelState::Deleted);
                }
            },
        }
        Ok(())
    }

    fn remove_channel(&mut self, channel: &mut Channel) {
        let fd = channel.fd();
        self.channels.remove(&channel.token());

        if channel.state() == ChannelState::Added {
            // the peer may already have torn the descriptor down
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                self.logger.log(
                    LogLevel::Error,
                    &format!("EpollPoller deregister fd={} failed: {}", fd, e),
                );
            }
        }
        channel.set_state(ChannelState::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.get(&channel.token()) == Some(&channel.fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::tests::CaptureLogger;
    use crate::logger::NoOpLogger;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn poller(capacity: usize) -> EpollPoller {
        EpollPoller::new(capacity, Arc::new(NoOpLogger)).unwrap()
    }

    fn channel_for(stream: &UnixStream, token: usize) -> Channel {
        let mut channel = Channel::new(stream.as_raw_fd());
        channel.set_token(Token(token));
        channel
    }

    #[test]
    fn test_poll_timeout_returns_nothing() {
        let mut poller = poller(4);
        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_millis(10)), &mut active)
            .unwrap();
        assert!(active.is_empty());
    }

    #[test]
    fn test_channel_lifecycle() {
        let mut poller = poller(4);
        let (local, mut peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();

        let mut channel = channel_for(&local, 1);
        channel.enable_reading();
        poller.update_channel(&mut channel).unwrap();
        assert_eq!(channel.state(), ChannelState::Added);
        assert!(poller.has_channel(&channel));

        peer.write_all(b"ping").unwrap();
        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_secs(1)), &mut active)
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, Token(1));
        assert!(active[0].1.is_readable());

        // no interest left: unregistered from the OS but still tracked
        channel.disable_all();
        poller.update_channel(&mut channel).unwrap();
        assert_eq!(channel.state(), ChannelState::Deleted);
        assert!(poller.has_channel(&channel));

        // interest again: re-added rather than silently ignored
        channel.enable_reading();
        poller.update_channel(&mut channel).unwrap();
        assert_eq!(channel.state(), ChannelState::Added);

        poller.remove_channel(&mut channel);
        assert_eq!(channel.state(), ChannelState::New);
        assert!(!poller.has_channel(&channel));
        assert_eq!(poller.channel_count(), 0);
    }

    #[test]
    fn test_new_channel_without_interest_is_tracked_but_not_registered() {
        let mut poller = poller(4);
        let (local, _peer) = UnixStream::pair().unwrap();

        let mut channel = channel_for(&local, 9);
        poller.update_channel(&mut channel).unwrap();

        assert_eq!(channel.state(), ChannelState::Deleted);
        assert!(poller.has_channel(&channel));
    }

    #[test]
    fn test_remove_after_descriptor_closed_is_logged_and_tolerated() {
        let capture = Arc::new(CaptureLogger::default());
        let mut poller = EpollPoller::new(4, capture.clone()).unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();

        let mut channel = channel_for(&local, 5);
        channel.enable_reading();
        poller.update_channel(&mut channel).unwrap();
        assert_eq!(channel.state(), ChannelState::Added);

        // closing drops the kernel registration behind the poller's back
        drop(local);
        poller.remove_channel(&mut channel);

        assert_eq!(channel.state(), ChannelState::New);
        assert!(!poller.has_channel(&channel));
        assert_eq!(poller.channel_count(), 0);
        assert!(capture.contains(LogLevel::Error, "deregister"));
    }

    #[test]
    fn test_event_list_doubles_when_full() {
        let mut poller = poller(1);
        let (a, mut a_peer) = UnixStream::pair().unwrap();
        let (b, mut b_peer) = UnixStream::pair().unwrap();

        let mut ca = channel_for(&a, 1);
        let mut cb = channel_for(&b, 2);
        ca.enable_reading();
        cb.enable_reading();
        poller.update_channel(&mut ca).unwrap();
        poller.update_channel(&mut cb).unwrap();

        a_peer.write_all(b"x").unwrap();
        b_peer.write_all(b"y").unwrap();

        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_secs(1)), &mut active)
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(poller.events_capacity(), 2);
    }
}
