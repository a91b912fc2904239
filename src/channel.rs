//! Descriptor/interest/callback binding dispatched by the owning [`EventLoop`].
//!
//! A [`Channel`] does not own its descriptor; the socket that does outlives the
//! channel's registration. Channels live in their loop's channel table and are
//! addressed by the [`Token`] the loop assigns when the channel is added.

use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use mio::event::Event;
use mio::Token;

use crate::event_loop::EventLoop;
use crate::logger::LogLevel;
use crate::registry::OwnerId;
use crate::timestamp::Timestamp;

pub type ReadCallback = Rc<dyn Fn(&EventLoop, Timestamp)>;
pub type EventCallback = Rc<dyn Fn(&EventLoop)>;

/// Interest set a channel asks the multiplexer to watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(0b01);
    pub const WRITABLE: Self = Self(0b10);

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// `None` for the empty set, which mio cannot register.
    pub fn to_mio(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness observed by the most recent poll.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Self = Self(0);
    pub const READABLE: Self = Self(1 << 0);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const ERROR: Self = Self(1 << 2);
    /// Both directions closed.
    pub const HUP: Self = Self(1 << 3);
    pub const PRIORITY: Self = Self(1 << 4);
    pub const READ_CLOSED: Self = Self(1 << 5);

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn is_hup(self) -> bool {
        self.contains(Self::HUP)
    }

    pub fn is_priority(self) -> bool {
        self.contains(Self::PRIORITY)
    }

    pub fn is_read_closed(self) -> bool {
        self.contains(Self::READ_CLOSED)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ready")
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .field("hup", &self.is_hup())
            .field("priority", &self.is_priority())
            .field("read_closed", &self.is_read_closed())
            .finish()
    }
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready = ready.union(Ready::READABLE);
        }
        if event.is_writable() {
            ready = ready.union(Ready::WRITABLE);
        }
        if event.is_error() {
            ready = ready.union(Ready::ERROR);
        }
        if event.is_priority() {
            ready = ready.union(Ready::PRIORITY);
        }
        if event.is_read_closed() {
            ready = ready.union(Ready::READ_CLOSED);
            if event.is_write_closed() {
                ready = ready.union(Ready::HUP);
            }
        }
        ready
    }
}

/// Where a channel stands with respect to its multiplexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Not known to the multiplexer.
    New,
    /// In the registration table and registered with the OS.
    Added,
    /// In the registration table but not registered with the OS.
    Deleted,
}

pub struct Channel {
    fd: RawFd,
    token: Token,
    interest: InterestSet,
    ready: Ready,
    state: ChannelState,
    tie: Option<OwnerId>,
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .field("interest", &self.interest)
            .field("ready", &self.ready)
            .field("state", &self.state)
            .field("tie", &self.tie)
            .finish()
    }
}

impl Channel {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            token: Token(usize::MAX),
            interest: InterestSet::NONE,
            ready: Ready::EMPTY,
            state: ChannelState::New,
            tie: None,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    pub fn set_read_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&EventLoop, Timestamp) + 'static,
    {
        self.read_callback = Some(Rc::new(callback));
        self
    }

    pub fn set_write_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&EventLoop) + 'static,
    {
        self.write_callback = Some(Rc::new(callback));
        self
    }

    pub fn set_close_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&EventLoop) + 'static,
    {
        self.close_callback = Some(Rc::new(callback));
        self
    }

    pub fn set_error_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&EventLoop) + 'static,
    {
        self.error_callback = Some(Rc::new(callback));
        self
    }

    /// Binds the channel to a registry entry; once that entry is retired,
    /// events for this channel are dropped instead of dispatched.
    pub fn tie(&mut self, owner: OwnerId) -> &mut Self {
        self.tie = Some(owner);
        self
    }

    pub fn enable_reading(&mut self) -> &mut Self {
        self.interest = self.interest.union(InterestSet::READABLE);
        self
    }

    pub fn disable_reading(&mut self) -> &mut Self {
        self.interest = self.interest.remove(InterestSet::READABLE);
        self
    }

    pub fn enable_writing(&mut self) -> &mut Self {
        self.interest = self.interest.union(InterestSet::WRITABLE);
        self
    }

    pub fn disable_writing(&mut self) -> &mut Self {
        self.interest = self.interest.remove(InterestSet::WRITABLE);
        self
    }

    pub fn disable_all(&mut self) -> &mut Self {
        self.interest = InterestSet::NONE;
        self
    }

    pub fn interest(&self) -> InterestSet {
        self.interest
    }

    pub fn is_none_event(&self) -> bool {
        self.interest.is_none()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn ready(&self) -> Ready {
        self.ready
    }

    pub(crate) fn set_ready(&mut self, ready: Ready) {
        self.ready = ready;
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    /// Snapshot of everything needed to dispatch the current readiness, taken
    /// so the channel table is not borrowed while callbacks run.
    pub(crate) fn dispatch(&self) -> Dispatch {
        Dispatch {
            token: self.token,
            ready: self.ready,
            tie: self.tie,
            read_callback: self.read_callback.clone(),
            write_callback: self.write_callback.clone(),
            close_callback: self.close_callback.clone(),
            error_callback: self.error_callback.clone(),
        }
    }
}

pub(crate) struct Dispatch {
    token: Token,
    ready: Ready,
    tie: Option<OwnerId>,
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl Dispatch {
    /// Runs the callbacks gated by the observed readiness in fixed order:
    /// close, error, read, write.
    pub(crate) fn handle_event(self, event_loop: &EventLoop, receive_time: Timestamp) {
        if let Some(owner) = self.tie {
            if !event_loop.owner_alive(owner) {
                event_loop.logger().log(
                    LogLevel::Debug,
                    &format!("Channel {:?} owner {:?} retired, event dropped", self.token, owner),
                );
                return;
            }
        }

        let ready = self.ready;
        event_loop.logger().log(
            LogLevel::Debug,
            &format!("Channel {:?} handling {:?}", self.token, ready),
        );

        if ready.is_hup() && !ready.is_readable() {
            if let Some(cb) = &self.close_callback {
                cb(event_loop);
            }
        }
        if ready.is_error() {
            if let Some(cb) = &self.error_callback {
                cb(event_loop);
            }
        }
        if ready.is_readable() || ready.is_priority() || ready.is_read_closed() {
            if let Some(cb) = &self.read_callback {
                cb(event_loop, receive_time);
            }
        }
        if ready.is_writable() {
            if let Some(cb) = &self.write_callback {
                cb(event_loop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_toggles() {
        let mut channel = Channel::new(3);
        assert!(channel.is_none_event());

        channel.enable_reading().enable_writing();
        assert!(channel.is_reading());
        assert!(channel.is_writing());
        assert_eq!(
            channel.interest().to_mio(),
            Some(mio::Interest::READABLE | mio::Interest::WRITABLE)
        );

        channel.disable_writing();
        assert!(!channel.is_writing());
        assert_eq!(channel.interest().to_mio(), Some(mio::Interest::READABLE));

        channel.disable_all();
        assert!(channel.is_none_event());
        assert_eq!(channel.interest().to_mio(), None);
    }

    #[test]
    fn test_ready_bits() {
        let ready = Ready::READABLE.union(Ready::HUP);
        assert!(ready.is_readable());
        assert!(ready.is_hup());
        assert!(!ready.is_writable());
        assert!(!ready.is_error());
        assert!(Ready::EMPTY.contains(Ready::EMPTY));
    }

    #[test]
    fn test_new_channel_state() {
        let channel = Channel::new(7);
        assert_eq!(channel.fd(), 7);
        assert_eq!(channel.state(), ChannelState::New);
        assert_eq!(channel.ready(), Ready::EMPTY);
    }
}
