//! A single-threaded readiness loop over sockets and timers.
//!
//! ```text
//!  other threads                     loop thread
//!  -------------                     -----------
//!  LoopHandle::add_action ──► queue ──► EventLoop::run
//!              │                            │
//!              └──────► Waker ──────► mio::Poll ◄── registered fds
//!                                           │
//!                                      timer heap
//! ```
//!
//! All changes to the set of watched sockets and to the timer heap happen
//! on the loop thread. [`LoopHandle`] methods only enqueue an action that
//! makes the change on the next pass, which keeps the handle `Send + Sync`
//! without locking the loop's state.
//!
//! Socket readiness is edge triggered: a read callback must consume input
//! until the socket reports `WouldBlock`, or it will not be called again
//! for data that is already buffered.

mod pool;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use self::pool::ThreadPool;
use crate::error::{ErrorKind, Result};

const WAKER_TOKEN: Token = Token(0);

/// Event loop tuning.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Worker threads started with the pool.
    pub initial_pool_threads: usize,
    /// Upper bound on worker threads.
    pub max_pool_threads: usize,
    /// Readiness events fetched per wait.
    pub max_events: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            initial_pool_threads: 1,
            max_pool_threads: 8,
            max_events: 256,
        }
    }
}

/// Identifies a watched socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SourceId(usize);

impl SourceId {
    fn for_fd(fd: RawFd) -> Self {
        SourceId(fd as usize + 1)
    }

    fn token(self) -> Token {
        Token(self.0)
    }
}

pub type Action = Box<dyn FnOnce(&mut EventLoop) + Send + 'static>;
/// Called on readiness; `Ok(false)` stops watching that direction.
pub type SocketCallback = Box<dyn FnMut(&LoopHandle) -> Result<bool> + Send + 'static>;
pub type TimerCallback = Box<dyn FnOnce(&LoopHandle) -> Result<()> + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    Read,
    Write,
}

struct Source {
    fd: RawFd,
    read: Option<SocketCallback>,
    write: Option<SocketCallback>,
    registered: Option<Interest>,
}

impl Source {
    fn interest(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct Timer {
    when: Instant,
    seq: u64,
    callback: TimerCallback,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed: BinaryHeap is a max-heap and the earliest timer must come first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    actions: Mutex<VecDeque<Action>>,
    waker: Waker,
    running: AtomicBool,
    stop: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
    pool: Mutex<Option<ThreadPool>>,
    config: LoopConfig,
}

/// A cloneable, thread-safe reference to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Run `f` on the loop thread during the next pass.
    pub fn add_action<F>(&self, f: F)
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.shared.actions.lock().push_back(Box::new(f));
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            log::warn!("cannot wake event loop: {}", e);
        }
    }

    /// Call `f` whenever `fd` is readable.
    pub fn register_read<F>(&self, fd: RawFd, f: F) -> SourceId
    where
        F: FnMut(&LoopHandle) -> Result<bool> + Send + 'static,
    {
        let cb: SocketCallback = Box::new(f);
        self.add_action(move |el| el.set_callback(fd, Direction::Read, Some(cb)));
        SourceId::for_fd(fd)
    }

    /// Call `f` whenever `fd` is writable.
    pub fn register_write<F>(&self, fd: RawFd, f: F) -> SourceId
    where
        F: FnMut(&LoopHandle) -> Result<bool> + Send + 'static,
    {
        let cb: SocketCallback = Box::new(f);
        self.add_action(move |el| el.set_callback(fd, Direction::Write, Some(cb)));
        SourceId::for_fd(fd)
    }

    pub fn unregister_read(&self, fd: RawFd) {
        self.add_action(move |el| el.set_callback(fd, Direction::Read, None));
    }

    pub fn unregister_write(&self, fd: RawFd) {
        self.add_action(move |el| el.set_callback(fd, Direction::Write, None));
    }

    /// Run `f` once, `delay` from now.
    pub fn add_timer<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(&LoopHandle) -> Result<()> + Send + 'static,
    {
        self.add_timer_at(Instant::now() + delay, f)
    }

    /// Run `f` once at `when`. A failing timer stops the loop.
    pub fn add_timer_at<F>(&self, when: Instant, f: F)
    where
        F: FnOnce(&LoopHandle) -> Result<()> + Send + 'static,
    {
        let cb: TimerCallback = Box::new(f);
        self.add_action(move |el| el.push_timer(when, cb));
    }

    /// Run `f` on a worker thread; hand results back with [`add_action`].
    ///
    /// [`add_action`]: LoopHandle::add_action
    pub fn add_pool_action<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pool = self.shared.pool.lock();
        let config = &self.shared.config;
        pool.get_or_insert_with(|| {
            ThreadPool::new(
                config.initial_pool_threads.max(1),
                config.max_pool_threads,
            )
        })
        .execute(f);
    }

    /// Make [`EventLoop::run`] return after the current pass.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// True from a [`shutdown`](Self::shutdown) until the next
    /// [`EventLoop::run`] starts.
    pub fn shutdown_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// True when called from the thread currently inside [`EventLoop::run`].
    pub fn is_loop_thread(&self) -> bool {
        *self.shared.loop_thread.lock() == Some(thread::current().id())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    sources: HashMap<Token, Source>,
    timers: BinaryHeap<Timer>,
    timer_seq: u64,
    handle: LoopHandle,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let events = Events::with_capacity(config.max_events.max(1));

        Ok(EventLoop {
            poll,
            events,
            sources: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            handle: LoopHandle {
                shared: Arc::new(Shared {
                    actions: Mutex::new(VecDeque::new()),
                    waker,
                    running: AtomicBool::new(false),
                    stop: AtomicBool::new(false),
                    loop_thread: Mutex::new(None),
                    pool: Mutex::new(None),
                    config,
                }),
            },
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Number of watched sockets.
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Number of timers not yet run.
    pub fn num_timers(&self) -> usize {
        self.timers.len()
    }

    /// Run passes until [`LoopHandle::shutdown`] is called.
    ///
    /// Fails with [`ErrorKind::LoopReentered`] if the loop is already
    /// running, and with [`ErrorKind::CallbackFailed`] when a timer fails.
    pub fn run(&mut self) -> Result<()> {
        self.enter()?;
        self.handle.shared.stop.store(false, Ordering::SeqCst);
        let mut result = Ok(());
        while !self.handle.shared.stop.load(Ordering::SeqCst) {
            if let Err(e) = self.pass(None) {
                result = Err(e);
                break;
            }
        }
        self.leave();
        result
    }

    /// Run a single pass, waiting at most `max_wait` for readiness.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        self.enter()?;
        let result = self.pass(max_wait);
        self.leave();
        result
    }

    fn enter(&mut self) -> Result<()> {
        let shared = &self.handle.shared;
        if shared.running.swap(true, Ordering::SeqCst) {
            return Err(ErrorKind::LoopReentered.into());
        }
        *shared.loop_thread.lock() = Some(thread::current().id());
        Ok(())
    }

    fn leave(&mut self) {
        let shared = &self.handle.shared;
        *shared.loop_thread.lock() = None;
        shared.running.store(false, Ordering::SeqCst);
    }

    fn pass(&mut self, max_wait: Option<Duration>) -> Result<()> {
        let mut timeout = self
            .timers
            .peek()
            .map(|t| t.when.saturating_duration_since(Instant::now()));
        if let Some(max) = max_wait {
            timeout = Some(timeout.map_or(max, |t| t.min(max)));
        }
        if !self.handle.shared.actions.lock().is_empty() {
            timeout = Some(Duration::ZERO);
        }

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .filter(|e| e.token() != WAKER_TOKEN)
            .map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_read_closed() || e.is_error(),
                    e.is_writable() || e.is_write_closed() || e.is_error(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if writable {
                self.dispatch_socket(token, Direction::Write);
            }
            if readable {
                self.dispatch_socket(token, Direction::Read);
            }
        }

        self.run_actions();
        self.run_timers()
    }

    fn dispatch_socket(&mut self, token: Token, dir: Direction) {
        let handle = &self.handle;
        let Some(source) = self.sources.get_mut(&token) else {
            return;
        };
        let slot = match dir {
            Direction::Read => &mut source.read,
            Direction::Write => &mut source.write,
        };
        let Some(cb) = slot.as_mut() else {
            return;
        };

        match cb(handle) {
            Ok(true) => return,
            Ok(false) => *slot = None,
            Err(e) => {
                log::warn!("{:?} callback for fd {} failed: {}", dir, source.fd, e);
                source.read = None;
                source.write = None;
            }
        }
        self.update_registration(token);
    }

    fn run_actions(&mut self) {
        let actions = std::mem::take(&mut *self.handle.shared.actions.lock());
        for action in actions {
            action(self);
        }
    }

    fn run_timers(&mut self) -> Result<()> {
        let now = Instant::now();
        while self.timers.peek().map_or(false, |t| t.when <= now) {
            let Some(timer) = self.timers.pop() else {
                break;
            };
            if let Err(e) = (timer.callback)(&self.handle) {
                log::error!("timer callback failed, stopping event loop: {}", e);
                return Err(ErrorKind::CallbackFailed(e.to_string()).into());
            }
        }
        Ok(())
    }

    fn push_timer(&mut self, when: Instant, callback: TimerCallback) {
        self.timer_seq += 1;
        self.timers.push(Timer {
            when,
            seq: self.timer_seq,
            callback,
        });
    }

    fn set_callback(&mut self, fd: RawFd, dir: Direction, cb: Option<SocketCallback>) {
        let token = SourceId::for_fd(fd).token();
        if cb.is_none() && !self.sources.contains_key(&token) {
            return;
        }
        let source = self.sources.entry(token).or_insert(Source {
            fd,
            read: None,
            write: None,
            registered: None,
        });
        // The fd number may belong to a new socket whose predecessor was
        // closed without deregistering; epoll has already forgotten it.
        if cb.is_some() && source.registered.is_some() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            source.registered = None;
        }
        match dir {
            Direction::Read => source.read = cb,
            Direction::Write => source.write = cb,
        }
        self.update_registration(token);
    }

    fn update_registration(&mut self, token: Token) {
        let Some(source) = self.sources.get_mut(&token) else {
            return;
        };
        let wanted = source.interest();
        if wanted == source.registered {
            if wanted.is_none() {
                self.sources.remove(&token);
            }
            return;
        }

        let fd = source.fd;
        let registry = self.poll.registry();
        let result = match (source.registered, wanted) {
            (None, Some(i)) => registry.register(&mut SourceFd(&fd), token, i),
            (Some(_), Some(i)) => registry.reregister(&mut SourceFd(&fd), token, i),
            (Some(_), None) => registry.deregister(&mut SourceFd(&fd)),
            (None, None) => Ok(()),
        };

        match result {
            Ok(()) if wanted.is_some() => source.registered = wanted,
            Ok(()) => {
                self.sources.remove(&token);
            }
            Err(e) if wanted.is_none() => {
                log::debug!("fd {} already gone: {}", fd, e);
                self.sources.remove(&token);
            }
            Err(e) => {
                log::warn!("cannot watch fd {}: {}", fd, e);
                if source.registered.is_some() {
                    let _ = registry.deregister(&mut SourceFd(&fd));
                }
                self.sources.remove(&token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;

    fn run_with_watchdog(el: &mut EventLoop) -> Result<()> {
        let h = el.handle();
        h.add_timer(Duration::from_secs(10), |h| {
            h.shutdown();
            Ok(())
        });
        el.run()
    }

    #[test]
    fn actions_run_on_the_loop_thread() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let h = el.handle();
        let (tx, rx) = mpsc::channel();

        let t = thread::spawn(move || {
            let inner = h.clone();
            h.add_action(move |el| {
                tx.send(inner.is_loop_thread()).unwrap();
                el.handle().shutdown();
            });
        });
        t.join().unwrap();

        run_with_watchdog(&mut el).unwrap();
        assert!(rx.recv().unwrap());
        assert!(!el.handle().is_loop_thread());
    }

    #[test]
    fn timers_fire_in_order() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let h = el.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (i, delay) in [(0, 30u64), (1, 10), (2, 10), (3, 20)] {
            let order = Arc::clone(&order);
            h.add_timer_at(now + Duration::from_millis(delay), move |_| {
                order.lock().push(i);
                Ok(())
            });
        }
        h.add_timer(Duration::from_millis(50), |h| {
            h.shutdown();
            Ok(())
        });

        run_with_watchdog(&mut el).unwrap();
        assert_eq!(*order.lock(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn failing_timer_stops_the_loop() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        el.handle().add_timer(Duration::ZERO, |_| {
            Err(ErrorKind::InvalidHeader("boom".into()).into())
        });
        let err = run_with_watchdog(&mut el).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CallbackFailed(_)));
        assert!(!el.handle().is_running());
    }

    #[test]
    fn reentry_is_rejected() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        el.handle().add_action(move |el| {
            let err = el.run().unwrap_err();
            tx.send(err.into_kind()).unwrap();
            el.handle().shutdown();
        });
        run_with_watchdog(&mut el).unwrap();
        assert_eq!(rx.recv().unwrap(), ErrorKind::LoopReentered);
    }

    #[test]
    fn read_callbacks_and_deregistration() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let h = el.handle();
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let got = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&got);
        h.register_read(b.as_raw_fd(), move |h| {
            let mut buf = [0u8; 64];
            loop {
                match b.read(&mut buf) {
                    Ok(0) => {
                        h.shutdown();
                        return Ok(false);
                    }
                    Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                    Err(e) => return Err(e.into()),
                }
            }
        });

        let writer = thread::spawn(move || {
            a.write_all(b"hello ").unwrap();
            thread::sleep(Duration::from_millis(20));
            a.write_all(b"world").unwrap();
        });

        run_with_watchdog(&mut el).unwrap();
        writer.join().unwrap();
        assert_eq!(&got.lock()[..], b"hello world");
        assert_eq!(el.num_sources(), 0);
    }

    #[test]
    fn shutdown_during_run_once_is_kept() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let h = el.handle();
        h.add_action(|el| el.handle().shutdown());
        el.run_once(Some(Duration::from_millis(10))).unwrap();
        assert!(h.shutdown_requested());
        el.run_once(Some(Duration::ZERO)).unwrap();
        assert!(h.shutdown_requested());

        // run() starts afresh and needs a new shutdown to return.
        h.add_timer(Duration::from_millis(20), |h| {
            h.shutdown();
            Ok(())
        });
        let started = Instant::now();
        run_with_watchdog(&mut el).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn reused_fd_number_is_watched_again() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let h = el.handle();
        let (_a1, b1) = UnixStream::pair().unwrap();
        let fd = b1.as_raw_fd();
        h.register_read(fd, |_| Ok(true));
        el.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(el.num_sources(), 1);

        // Closing the fd drops it from epoll but not from the loop.
        let (mut a2, b2) = UnixStream::pair().unwrap();
        drop(b1);
        // SAFETY: fd was just closed, so dup2 gives b2's socket that number
        // and the new stream below is its only owner.
        let mut reused = unsafe {
            assert_eq!(libc::dup2(b2.as_raw_fd(), fd), fd);
            UnixStream::from_raw_fd(fd)
        };
        drop(b2);
        reused.set_nonblocking(true).unwrap();

        let (tx, rx) = mpsc::channel();
        h.register_read(fd, move |h| {
            let mut buf = [0u8; 16];
            match reused.read(&mut buf) {
                Ok(n) => tx.send(buf[..n].to_vec()).unwrap(),
                Err(e) => return Err(e.into()),
            }
            h.shutdown();
            Ok(false)
        });
        a2.write_all(b"again").unwrap();

        run_with_watchdog(&mut el).unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"again");
    }

    #[test]
    fn socket_errors_do_not_stop_the_loop() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let h = el.handle();
        let (a, b) = UnixStream::pair().unwrap();

        h.register_write(a.as_raw_fd(), |_| {
            Err(ErrorKind::InvalidHeader("bad socket".into()).into())
        });
        h.add_timer(Duration::from_millis(20), |h| {
            h.shutdown();
            Ok(())
        });

        run_with_watchdog(&mut el).unwrap();
        assert_eq!(el.num_sources(), 0);
        drop((a, b));
    }

    #[test]
    fn pool_results_come_back_through_actions() {
        let mut el = EventLoop::new(LoopConfig::default()).unwrap();
        let h = el.handle();
        let (tx, rx) = mpsc::channel();

        let back = h.clone();
        h.add_pool_action(move || {
            let on_pool = back.is_loop_thread();
            back.add_action(move |el| {
                tx.send((on_pool, el.handle().is_loop_thread())).unwrap();
                el.handle().shutdown();
            });
        });

        run_with_watchdog(&mut el).unwrap();
        assert_eq!(rx.recv().unwrap(), (false, true));
    }
}
