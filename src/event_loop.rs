//! One event loop per thread.
//!
//! An [`EventLoop`] is created on the thread that will run it and never leaves
//! that thread: it is `!Send`, so holding a `&EventLoop` already means running
//! on the owning thread. Other threads talk to it exclusively through a
//! [`LoopHandle`], which can queue tasks, wake the loop, and ask it to quit.
//!
//! ```text
//!            ┌────────────────────── one iteration ──────────────────────┐
//!  run() ──▶ │ poll(timeout) ─▶ dispatch ready channels ─▶ drain tasks    │ ─▶ quit?
//!            └────────────────────────────────────────────────────────────┘
//! ```

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    io::{self, Read, Write},
    mem,
    os::unix::{io::AsRawFd, net::UnixStream},
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use mio::Token;

use crate::{
    channel::{Channel, Ready},
    logger::{default_logger, fatal, LogLevel, Logger},
    poll::{EpollPoller, Poller, DEFAULT_EVENTS_CAPACITY},
    registry::{OwnerId, Registry},
    timestamp::Timestamp,
};

pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10_000;

const WAKEUP_TOKEN: Token = Token(0);

/// Work injected into a loop, run on the loop's thread with the loop lent in.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

/// Construction parameters for an [`EventLoop`].
#[derive(Clone)]
pub struct LoopConfig {
    /// Initial size of the OS event list; doubles whenever a poll fills it.
    pub events_capacity: usize,
    /// Upper bound on one wait call, so quit requests are noticed without I/O.
    pub poll_timeout: Duration,
    pub logger: Arc<dyn Logger>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            logger: default_logger(),
        }
    }
}

struct LoopShared {
    thread_id: ThreadId,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    pending: Mutex<Vec<Task>>,
    wakeup_writer: UnixStream,
    logger: Arc<dyn Logger>,
}

/// Thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.shared.thread_id)
            .finish()
    }
}

impl LoopHandle {
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Whether both handles refer to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Appends `task` to the loop's queue.
    ///
    /// The loop is woken when called from another thread, or when the loop is
    /// currently draining its queue, so a task queued by a task still runs on
    /// the next iteration instead of waiting for unrelated I/O.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Runs `task` on the loop as soon as possible.
    ///
    /// A handle cannot lend out the loop itself, so even on the loop's own
    /// thread the task is queued (with a wakeup) and runs at the end of the
    /// current iteration. Code already holding `&EventLoop` should call
    /// [`EventLoop::run_in_loop`] for synchronous execution.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            self.shared.logger.log(
                LogLevel::Debug,
                "LoopHandle::run_in_loop on the loop thread, task deferred to the end of the iteration",
            );
        }
        self.push(Box::new(task));
        self.wakeup();
    }

    /// Asks the loop to stop after the iteration in progress.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Makes the loop's blocking wait return.
    pub fn wakeup(&self) {
        match (&self.shared.wakeup_writer).write(&[1]) {
            Ok(_) => {}
            // the socket is full of unread wakeups already
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self
                .shared
                .logger
                .log(LogLevel::Error, &format!("EventLoop::wakeup failed: {}", e)),
        }
    }

    fn push(&self, task: Task) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

/// Reactor bound to the thread that created it.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    me: Weak<EventLoop>,
    poller: RefCell<Box<dyn Poller>>,
    channels: RefCell<HashMap<Token, Channel>>,
    active_channels: RefCell<Vec<(Token, Ready)>>,
    owners: RefCell<Registry>,
    next_token: Cell<usize>,
    looping: Cell<bool>,
    wakeup_reader: UnixStream,
    poll_timeout: Duration,
    logger: Arc<dyn Logger>,
}

impl EventLoop {
    /// Creates a loop bound to the current thread with default settings.
    ///
    /// ## Errors
    ///
    /// Returns an error if the multiplexer or the wakeup descriptor cannot be
    /// created.
    pub fn new() -> io::Result<Rc<Self>> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> io::Result<Rc<Self>> {
        let poller = EpollPoller::new(config.events_capacity, config.logger.clone())?;
        Self::with_poller(Box::new(poller), config)
    }

    /// Creates a loop over a caller-chosen multiplexer.
    pub fn with_poller(poller: Box<dyn Poller>, config: LoopConfig) -> io::Result<Rc<Self>> {
        let (wakeup_reader, wakeup_writer) = UnixStream::pair()?;
        wakeup_reader.set_nonblocking(true)?;
        wakeup_writer.set_nonblocking(true)?;

        let logger = config.logger;
        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            wakeup_writer,
            logger: logger.clone(),
        });

        let event_loop = Rc::new_cyclic(|me| EventLoop {
            shared,
            me: me.clone(),
            poller: RefCell::new(poller),
            channels: RefCell::new(HashMap::new()),
            active_channels: RefCell::new(Vec::new()),
            owners: RefCell::new(Registry::new()),
            next_token: Cell::new(WAKEUP_TOKEN.0 + 1),
            looping: Cell::new(false),
            wakeup_reader,
            poll_timeout: config.poll_timeout,
            logger,
        });

        let mut wakeup_channel = Channel::new(event_loop.wakeup_reader.as_raw_fd());
        wakeup_channel.set_token(WAKEUP_TOKEN);
        wakeup_channel.set_read_callback(|event_loop, _| event_loop.drain_wakeup());
        wakeup_channel.enable_reading();
        event_loop
            .poller
            .borrow_mut()
            .update_channel(&mut wakeup_channel)?;
        event_loop
            .channels
            .borrow_mut()
            .insert(WAKEUP_TOKEN, wakeup_channel);

        event_loop.logger.log(
            LogLevel::Debug,
            &format!("EventLoop created in thread {:?}", event_loop.shared.thread_id),
        );
        Ok(event_loop)
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn downgrade(&self) -> Weak<EventLoop> {
        self.me.clone()
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// # Panics
    ///
    /// Panics (after a fatal log line) when called off the owning thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            fatal(
                self.logger.as_ref(),
                &format!(
                    "EventLoop created in thread {:?} used from thread {:?}",
                    self.shared.thread_id,
                    thread::current().id()
                ),
            );
        }
    }

    /// Whether the loop is currently inside [`run`](Self::run).
    pub fn is_looping(&self) -> bool {
        self.looping.get()
    }

    /// Polls, dispatches and drains queued tasks until [`quit`](Self::quit) is
    /// observed.
    ///
    /// # Panics
    ///
    /// Panics if called while the loop is already running.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        if self.looping.replace(true) {
            fatal(self.logger.as_ref(), "EventLoop::run called while already looping");
        }
        self.logger.log(LogLevel::Info, "EventLoop start looping");

        while !self.shared.quit.load(Ordering::Acquire) {
            let mut active = mem::take(&mut *self.active_channels.borrow_mut());
            active.clear();

            let polled = self
                .poller
                .borrow_mut()
                .poll(Some(self.poll_timeout), &mut active);
            match polled {
                Ok(receive_time) => {
                    for &(token, ready) in &active {
                        self.handle_ready(token, ready, receive_time);
                    }
                }
                Err(e) => self
                    .logger
                    .log(LogLevel::Error, &format!("EventLoop poll failed: {}", e)),
            }

            *self.active_channels.borrow_mut() = active;
            self.do_pending_functors();
        }

        // tasks queued before the quit request was observed
        self.do_pending_functors();
        self.looping.set(false);
        self.logger.log(LogLevel::Info, "EventLoop stop looping");
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Runs `task` right away; having `&self` proves this is the loop's thread.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop),
    {
        self.assert_in_loop_thread();
        task(self);
    }

    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.handle().queue_in_loop(task);
    }

    /// Puts `channel` into this loop's channel table without registering it.
    pub fn add_channel(&self, mut channel: Channel) -> Token {
        self.assert_in_loop_thread();
        let token = Token(self.next_token.get());
        self.next_token.set(token.0 + 1);
        channel.set_token(token);
        self.channels.borrow_mut().insert(token, channel);
        token
    }

    /// Applies `change` to the channel, then pushes its interest to the
    /// multiplexer.
    ///
    /// # Panics
    ///
    /// Panics (after a fatal log line) when the OS refuses to add or modify the
    /// registration.
    pub fn update_channel<F>(&self, token: Token, change: F)
    where
        F: FnOnce(&mut Channel),
    {
        self.assert_in_loop_thread();
        let mut channels = self.channels.borrow_mut();
        let Some(channel) = channels.get_mut(&token) else {
            self.logger.log(
                LogLevel::Error,
                &format!("EventLoop::update_channel unknown {:?}", token),
            );
            return;
        };

        change(channel);
        if let Err(e) = self.poller.borrow_mut().update_channel(channel) {
            fatal(
                self.logger.as_ref(),
                &format!("EventLoop::update_channel fd={} failed: {}", channel.fd(), e),
            );
        }
    }

    /// One multiplexer wait without dispatch, so tests can consume an edge.
    #[cfg(test)]
    pub(crate) fn poll_once(&self, timeout: Duration) -> Vec<(Token, Ready)> {
        let mut active = Vec::new();
        if let Err(e) = self.poller.borrow_mut().poll(Some(timeout), &mut active) {
            panic!("poll failed: {}", e);
        }
        active
    }

    /// Unregisters the channel and takes it out of the table.
    pub fn remove_channel(&self, token: Token) -> Option<Channel> {
        self.assert_in_loop_thread();
        let mut channel = self.channels.borrow_mut().remove(&token)?;
        self.poller.borrow_mut().remove_channel(&mut channel);
        Some(channel)
    }

    pub fn has_channel(&self, token: Token) -> bool {
        self.assert_in_loop_thread();
        self.channels
            .borrow()
            .get(&token)
            .is_some_and(|channel| self.poller.borrow().has_channel(channel))
    }

    /// Read-only access to a channel, e.g. to ask whether it is write-armed.
    pub fn with_channel<R, F>(&self, token: Token, f: F) -> Option<R>
    where
        F: FnOnce(&Channel) -> R,
    {
        self.channels.borrow().get(&token).map(f)
    }

    pub fn reserve_owner(&self) -> OwnerId {
        self.owners.borrow_mut().reserve()
    }

    pub fn insert_owner<T: Any>(&self, id: OwnerId, owner: Rc<T>) {
        self.owners.borrow_mut().insert(id, owner);
    }

    pub fn owner<T: Any>(&self, id: OwnerId) -> Option<Rc<T>> {
        self.owners.borrow().get(id)
    }

    pub fn owner_alive(&self, id: OwnerId) -> bool {
        self.owners.borrow().contains(id)
    }

    /// Retires the owner so tied channels stop dispatching; `None` if it was
    /// already retired.
    pub fn retire_owner(&self, id: OwnerId) -> Option<Rc<dyn Any>> {
        self.owners.borrow_mut().retire(id)
    }

    pub fn owner_count(&self) -> usize {
        self.owners.borrow().len()
    }

    fn handle_ready(&self, token: Token, ready: Ready, receive_time: Timestamp) {
        let dispatch = {
            let mut channels = self.channels.borrow_mut();
            match channels.get_mut(&token) {
                Some(channel) => {
                    channel.set_ready(ready);
                    channel.dispatch()
                }
                // removed by an earlier callback in this iteration
                None => return,
            }
        };
        dispatch.handle_event(self, receive_time);
    }

    fn do_pending_functors(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = mem::take(
            &mut *self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task(self);
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wakeup_reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("EventLoop wakeup read failed: {}", e));
                    break;
                }
            }
        }
    }
}
