//! event_loop
//!
//! A single-threaded reactor: one command intake, one timer heap, one
//! readiness poller, one frame pool, all touched exclusively by the thread
//! running `EventLoop::run`. Every other thread talks to it only through
//! `LoopHandle`, which is `Clone + Send + Sync` and holds just the shared,
//! lock-free pieces (the command queue and the wakeup primitive) — never
//! the loop's own state.
//!
//! This mirrors the original's split between the `EventLoop` object (owned
//! by its thread) and the raw pointers other threads held to post work to
//! it, except the handle here can't outlive the queue it posts into and
//! can't be used to reach into loop-local state by accident.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::contract_assert;
use crate::frame::{FramePool, FramePoolGuard};
use crate::intake::MpscIntake;
use crate::poller::{IoEvent, MioPoller};
use crate::task::Runnable;
use crate::timer::{TimerHeap, TimerId, TimerNode};

const WAKE_TOKEN: u64 = 0;

/// Work queued to run on the loop thread, dispatched at most once each by
/// `drain_commands`.
pub(crate) enum Command {
    Task(Box<dyn FnOnce() + Send>),
    Resume(Runnable),
    Defer(Box<dyn Deferred>),
    InsertTimer(Arc<TimerNode>),
    DropTimer(TimerId),
    WatchFd {
        id: u64,
        fd: RawFd,
        events: IoEvent,
        callback: Box<dyn FnMut(IoEvent) + Send>,
    },
    UpdateFd {
        id: u64,
        events: IoEvent,
    },
    UnwatchFd {
        id: u64,
    },
    Stop,
}

/// A unit of deferred work posted back onto a loop from one of its own
/// suspension primitives (e.g. a mutex handing the lock to the next
/// waiter). Boxed rather than generic so `Command` stays a plain enum.
pub(crate) trait Deferred: Send {
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send> Deferred for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

struct WatchEntry {
    fd: RawFd,
    events: IoEvent,
    callback: Box<dyn FnMut(IoEvent) + Send>,
    registered: bool,
}

pub(crate) struct Shared {
    intake: MpscIntake<Command>,
    waker: mio::Waker,
    wakeup_pending: AtomicBool,
    stop_requested: AtomicBool,
    next_timer_id: AtomicU64,
    next_watch_id: AtomicU64,
    thread_id: OnceLock<ThreadId>,
}

impl Shared {
    fn enqueue(&self, cmd: Command) {
        self.intake.push(cmd);
        if !self.wakeup_pending.swap(true, Ordering::AcqRel) {
            let _ = self.waker.wake();
        }
    }
}

/// A cheap, shareable reference to a running (or not-yet-started)
/// `EventLoop`. Every any-thread operation the loop supports lives here.
#[derive(Clone)]
pub struct LoopHandle(pub(crate) Arc<Shared>);

impl LoopHandle {
    /// Queues `task` to run on the loop thread. Never blocks, never runs
    /// `task` inline even when called from the loop thread itself.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.0.enqueue(Command::Task(Box::new(task)));
    }

    pub(crate) fn post_resume(&self, runnable: Runnable) {
        self.0.enqueue(Command::Resume(runnable));
    }

    pub(crate) fn post_defer(&self, deferred: Box<dyn Deferred>) {
        self.0.enqueue(Command::Defer(deferred));
    }

    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.post_at(Instant::now() + delay, task)
    }

    pub fn post_at(&self, when: Instant, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let id = self.0.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let node = TimerNode::new(id, when, Box::new(task));
        self.0.enqueue(Command::InsertTimer(node.clone()));
        TimerHandle {
            node,
            loop_handle: self.clone(),
        }
    }

    fn drop_timer(&self, id: TimerId) {
        self.0.enqueue(Command::DropTimer(id));
    }

    pub fn watch_fd(
        &self,
        fd: RawFd,
        events: IoEvent,
        callback: impl FnMut(IoEvent) + Send + 'static,
    ) -> WatchHandle {
        let id = self.0.next_watch_id.fetch_add(1, Ordering::Relaxed);
        self.0.enqueue(Command::WatchFd {
            id,
            fd,
            events,
            callback: Box::new(callback),
        });
        WatchHandle {
            id,
            loop_handle: self.clone(),
        }
    }

    fn update_fd(&self, id: u64, events: IoEvent) {
        self.0.enqueue(Command::UpdateFd { id, events });
    }

    fn unwatch_fd(&self, id: u64) {
        self.0.enqueue(Command::UnwatchFd { id });
    }

    /// Requests the loop stop after finishing the commands already queued
    /// ahead of this one.
    pub fn stop(&self) {
        self.0.enqueue(Command::Stop);
    }

    /// True if called from the thread currently (or most recently) running
    /// this loop.
    pub fn in_loop(&self) -> bool {
        self.0
            .thread_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    /// The frame pool bound to this loop's thread.
    ///
    /// Only callable from the loop thread itself (e.g. from inside a thunk
    /// posted via `post`); the pool is not `Sync` and isn't reachable any
    /// other way.
    pub fn frame_pool(&self) -> &'static FramePool {
        contract_assert!(self.in_loop(), "frame_pool() called off its own loop thread");
        FramePool::current().expect("loop thread has no frame pool installed")
    }
}

#[derive(Clone)]
pub struct TimerHandle {
    node: Arc<TimerNode>,
    loop_handle: LoopHandle,
}

impl TimerHandle {
    /// Cancels the timer. Safe to call from any thread, at any time,
    /// including after the timer has already fired (a no-op in that case).
    pub fn cancel(&self) {
        self.node.cancel();
        self.loop_handle.drop_timer(self.node.id);
    }

    pub fn id(&self) -> TimerId {
        self.node.id
    }
}

#[derive(Clone)]
pub struct WatchHandle {
    id: u64,
    loop_handle: LoopHandle,
}

impl WatchHandle {
    pub fn update(&self, events: IoEvent) {
        self.loop_handle.update_fd(self.id, events);
    }

    pub fn unwatch(self) {
        self.loop_handle.unwatch_fd(self.id);
    }
}

#[derive(Clone, Copy)]
pub struct EventLoopOptions {
    pub max_events: usize,
}

impl Default for EventLoopOptions {
    fn default() -> Self {
        Self { max_events: 64 }
    }
}

/// The reactor itself. Construct it, move it onto the thread that will run
/// it (see `group::ThreadedGroup`), and call `run`.
pub struct EventLoop {
    shared: Arc<Shared>,
    poller: MioPoller,
    timers: TimerHeap,
    watches: HashMap<u64, WatchEntry>,
    frame_pool: FramePool,
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// The `LoopHandle` for whichever loop is currently running on this
/// thread, if any. Suspension primitives (mutex, sleep, signal, spawn) use
/// this instead of threading a handle through every call.
pub(crate) fn current_loop() -> Option<LoopHandle> {
    CURRENT_LOOP.with(|c| c.borrow().clone())
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Self::with_options(EventLoopOptions::default())
    }

    pub fn with_options(options: EventLoopOptions) -> io::Result<Self> {
        let poller = MioPoller::new(options.max_events)?;
        let waker = poller.waker(WAKE_TOKEN)?;
        let shared = Arc::new(Shared {
            intake: MpscIntake::new(),
            waker,
            wakeup_pending: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            next_timer_id: AtomicU64::new(1),
            next_watch_id: AtomicU64::new(1),
            thread_id: OnceLock::new(),
        });
        Ok(Self {
            shared,
            poller,
            timers: TimerHeap::new(),
            watches: HashMap::new(),
            frame_pool: FramePool::new(),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle(self.shared.clone())
    }

    fn bind_thread(&self) {
        let current = thread::current().id();
        match self.shared.thread_id.get() {
            Some(id) => contract_assert!(*id == current, "EventLoop driven from a second thread"),
            None => {
                let _ = self.shared.thread_id.set(current);
            }
        }
    }

    /// Runs until `stop()` is called on this loop's handle.
    pub fn run(&mut self) {
        self.bind_thread();
        let _frames = FramePoolGuard::new(&self.frame_pool);
        let handle = self.handle();
        CURRENT_LOOP.with(|c| *c.borrow_mut() = Some(handle));
        self.shared.stop_requested.store(false, Ordering::Release);
        while !self.shared.stop_requested.load(Ordering::Acquire) {
            self.run_once();
        }
        CURRENT_LOOP.with(|c| *c.borrow_mut() = None);
    }

    /// Runs a single iteration: drain commands, fire due timers, wait for
    /// readiness once. Exposed for tests and for callers embedding the loop
    /// in their own driving loop.
    pub fn run_once(&mut self) {
        self.bind_thread();
        self.drain_commands();
        if self.shared.stop_requested.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        self.timers.run_due(now);

        let timeout = self.next_timeout(now);
        let shared = &self.shared;
        let watches = &mut self.watches;
        let result = self.poller.wait(timeout, |ev| {
            if ev.token == WAKE_TOKEN {
                shared.wakeup_pending.store(false, Ordering::Release);
                return;
            }
            if let Some(entry) = watches.get_mut(&ev.token) {
                if entry.registered && !ev.events.is_empty() {
                    (entry.callback)(ev.events);
                }
            }
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "poller wait failed");
        }
    }

    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.timers
            .peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn drain_commands(&mut self) {
        for cmd in self.shared.intake.drain() {
            match cmd {
                Command::Task(f) => f(),
                Command::Resume(runnable) => runnable.run(),
                Command::Defer(deferred) => deferred.run(),
                Command::InsertTimer(node) => {
                    if !node.is_cancelled() {
                        self.timers.insert(node);
                    }
                }
                Command::DropTimer(id) => self.timers.remove(id),
                Command::WatchFd {
                    id,
                    fd,
                    events,
                    callback,
                } => {
                    let registered = self.poller.add(fd, id, events).is_ok();
                    self.watches.insert(
                        id,
                        WatchEntry {
                            fd,
                            events,
                            callback,
                            registered,
                        },
                    );
                }
                Command::UpdateFd { id, events } => {
                    if let Some(entry) = self.watches.get_mut(&id) {
                        entry.events = events;
                        if entry.registered {
                            let _ = self.poller.modify(entry.fd, id, events);
                        }
                    }
                }
                Command::UnwatchFd { id } => {
                    if let Some(entry) = self.watches.remove(&id) {
                        if entry.registered {
                            let _ = self.poller.remove(entry.fd);
                        }
                    }
                }
                Command::Stop => self.shared.stop_requested.store(true, Ordering::Release),
            }
        }
    }
}
