//! Loop-per-thread workers.
//!
//! ```text
//!   base loop (caller's thread)
//!        │ next_loop(): round-robin
//!        ├──────────────┬──────────────┐
//!        ▼              ▼              ▼
//!   [name]0 loop   [name]1 loop   [name]2 loop
//! ```
//!
//! Each [`EventLoopThread`] builds its [`EventLoop`] on the spawned thread, so
//! the loop never crosses threads; only its [`LoopHandle`] is handed back.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{Builder, JoinHandle},
};

use crate::{
    error::{NetworkError, Result},
    event_loop::{EventLoop, LoopConfig, LoopHandle},
    logger::{fatal, LogLevel},
};

/// Hook run once on every I/O loop before it starts looping.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

type Published = Arc<(Mutex<Option<Result<LoopHandle>>>, Condvar)>;

/// A thread that owns and runs one [`EventLoop`].
pub struct EventLoopThread {
    name: String,
    config: LoopConfig,
    init: Option<ThreadInitCallback>,
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(
        name: impl Into<String>,
        config: LoopConfig,
        init: Option<ThreadInitCallback>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            init,
            handle: None,
            thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the thread and blocks until its loop exists and the init hook
    /// has run.
    ///
    /// ## Errors
    ///
    /// Returns [`NetworkError::ThreadSpawn`] if the OS refuses the thread, the
    /// loop's own construction error, or [`NetworkError::Configuration`] if the
    /// thread dies (for instance a panicking init hook) before publishing.
    pub fn start_loop(&mut self) -> Result<LoopHandle> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        let published: Published = Arc::new((Mutex::new(None), Condvar::new()));
        let mut publisher = Publisher::new(Arc::clone(&published));
        let config = self.config.clone();
        let init = self.init.clone();

        let thread = Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::with_config(config) {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        publisher.publish(Err(NetworkError::Io(e)));
                        return;
                    }
                };
                if let Some(init) = &init {
                    init(&event_loop);
                }
                publisher.publish(Ok(event_loop.handle()));
                drop(publisher);
                event_loop.run();
            })
            .map_err(NetworkError::ThreadSpawn)?;

        let (lock, cvar) = &*published;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = loop {
            match guard.take() {
                Some(result) => break result,
                None => guard = cvar.wait(guard).unwrap_or_else(PoisonError::into_inner),
            }
        };
        drop(guard);

        self.thread = Some(thread);
        let handle = result?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }
}

/// Publishing side of the start-up handshake. Dropping it unpublished, which
/// is what unwinding out of the init hook does, wakes the caller with an error.
struct Publisher {
    slot: Published,
    sent: bool,
}

impl Publisher {
    fn new(slot: Published) -> Self {
        Self { slot, sent: false }
    }

    fn publish(&mut self, result: Result<LoopHandle>) {
        let (lock, cvar) = &*self.slot;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        cvar.notify_one();
        self.sent = true;
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if !self.sent {
            self.publish(Err(NetworkError::Configuration(
                "loop thread exited before publishing its loop".to_string(),
            )));
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A fixed set of [`EventLoopThread`]s fed round-robin from a base loop.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    config: LoopConfig,
    started: bool,
    num_threads: usize,
    next: AtomicUsize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base: &EventLoop, name: impl Into<String>, config: LoopConfig) -> Self {
        Self {
            base: base.handle(),
            name: name.into(),
            config,
            started: false,
            num_threads: 0,
            next: AtomicUsize::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// # Panics
    ///
    /// Panics if the pool has already been started.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started, "set_thread_num called on a started pool");
        self.num_threads = num_threads;
    }

    pub fn thread_num(&self) -> usize {
        self.num_threads
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the configured threads. With zero threads, `init` runs on `base`
    /// and every connection is served there.
    ///
    /// ## Errors
    ///
    /// Returns the first thread's start failure; threads already started are
    /// kept and stopped when the pool is dropped.
    pub fn start(&mut self, base: &EventLoop, init: Option<ThreadInitCallback>) -> Result<()> {
        assert!(!self.started, "EventLoopThreadPool::start called twice");
        base.assert_in_loop_thread();
        if !base.handle().same_loop(&self.base) {
            return Err(NetworkError::Configuration(format!(
                "pool {} started from a loop other than its base",
                self.name
            )));
        }
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread =
                EventLoopThread::new(format!("{}{}", self.name, i), self.config.clone(), init.clone());
            let handle = thread.start_loop();
            self.threads.push(thread);
            self.loops.push(handle?);
        }

        if self.num_threads == 0 {
            if let Some(init) = &init {
                init(base);
            }
        }

        self.config.logger.log(
            LogLevel::Info,
            &format!("EventLoopThreadPool [{}] started {} threads", self.name, self.loops.len()),
        );
        Ok(())
    }

    /// The loop the next connection goes to.
    pub fn next_loop(&self) -> LoopHandle {
        if !self.base.is_in_loop_thread() {
            fatal(
                self.config.logger.as_ref(),
                "EventLoopThreadPool::next_loop called off the base loop thread",
            );
        }
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn config() -> LoopConfig {
        LoopConfig {
            poll_timeout: Duration::from_millis(100),
            ..LoopConfig::default()
        }
    }

    #[test]
    fn test_loop_thread_runs_tasks_on_named_thread() {
        let mut thread = EventLoopThread::new("worker-a", config(), None);
        let handle = thread.start_loop().unwrap();
        assert!(!handle.is_in_loop_thread());

        let (tx, rx) = mpsc::channel();
        handle.queue_in_loop(move |_| {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("worker-a"));
    }

    #[test]
    fn test_init_hook_runs_before_handle_is_published() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let init: ThreadInitCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut thread = EventLoopThread::new("worker-init", config(), Some(init));
        thread.start_loop().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_init_hook_fails_start_instead_of_hanging() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let init: ThreadInitCallback = Arc::new(|_| panic!("init failed"));
            let mut thread = EventLoopThread::new("worker-bad-init", config(), Some(init));
            let result = thread.start_loop();
            let _ = tx.send((result.is_err(), thread.handle().is_none(), result.err()));
        });

        let (failed, no_handle, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(failed);
        assert!(no_handle);
        assert!(matches!(err, Some(NetworkError::Configuration(_))));
    }

    #[test]
    fn test_round_robin_cycles_with_period_n() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(&base, "rr", config());
        pool.set_thread_num(3);
        pool.start(&base, None).unwrap();

        let picks: Vec<LoopHandle> = (0..7).map(|_| pool.next_loop()).collect();
        for (i, pick) in picks.iter().enumerate() {
            assert!(pick.same_loop(&picks[i % 3]));
            assert!(!pick.same_loop(&base.handle()));
        }
        assert!(!picks[0].same_loop(&picks[1]));
        assert!(!picks[1].same_loop(&picks[2]));
        assert!(!picks[0].same_loop(&picks[2]));
        assert_eq!(pool.all_loops().len(), 3);
    }

    #[test]
    fn test_zero_threads_uses_base_loop() {
        let base = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let init: ThreadInitCallback = Arc::new(move |event_loop| {
            assert!(event_loop.is_in_loop_thread());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut pool = EventLoopThreadPool::new(&base, "solo", config());
        pool.start(&base, Some(init)).unwrap();

        assert!(pool.is_started());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(pool.next_loop().same_loop(&base.handle()));
        assert_eq!(pool.all_loops().len(), 1);
    }

    #[test]
    #[should_panic(expected = "started pool")]
    fn test_set_thread_num_after_start_panics() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(&base, "late", config());
        pool.start(&base, None).unwrap();
        pool.set_thread_num(2);
    }
}
