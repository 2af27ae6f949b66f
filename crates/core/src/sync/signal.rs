//! signal
//!
//! POSIX signal delivery integrated with the loop. A dispatcher thread
//! blocks in `sigtimedwait` on the signals the service was attached with
//! and hands each delivery to whichever task is waiting on that signal, or
//! queues it if nothing is waiting yet. The original routes that handoff
//! back through the owning loop because its waiter lists are raw
//! intrusive pointers only safe to touch on the loop thread; here the
//! lists live behind a `Mutex`, so the dispatcher thread can hand a
//! delivery straight to a waiter without a round trip through the loop —
//! the waiter's own `Waker` (a task's, via `std::task::Wake`) takes care
//! of getting the resume back onto the right thread.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex as PLMutex;

use crate::contract_assert;
use crate::event_loop::LoopHandle;

/// Information captured from a delivered `siginfo_t`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalInfo {
    pub signum: i32,
    pub code: i32,
    pub pid: i32,
    pub uid: u32,
    pub status: i32,
    pub errno: i32,
    pub value: isize,
}

fn signal_info_from_raw(info: &libc::siginfo_t) -> SignalInfo {
    SignalInfo {
        signum: info.si_signo,
        code: info.si_code,
        errno: info.si_errno,
        // Safety: these accessors read the `_sifields` union in the
        // variant populated for a delivery caught by `sigtimedwait`.
        pid: unsafe { info.si_pid() },
        uid: unsafe { info.si_uid() },
        status: unsafe { info.si_status() },
        value: unsafe { info.si_value().sival_ptr as isize },
    }
}

/// A builder for a `sigset_t` naming which signals a `SignalService`
/// dispatcher thread should block and wait for.
#[derive(Clone, Copy)]
pub struct SignalSet {
    set: libc::sigset_t,
}

impl SignalSet {
    pub fn new() -> Self {
        let mut set: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe { libc::sigemptyset(&mut set) };
        Self { set }
    }

    pub fn add(mut self, signum: i32) -> Self {
        unsafe { libc::sigaddset(&mut self.set, signum) };
        self
    }

    pub fn remove(mut self, signum: i32) -> Self {
        unsafe { libc::sigdelset(&mut self.set, signum) };
        self
    }

    pub fn contains(&self, signum: i32) -> bool {
        unsafe { libc::sigismember(&self.set, signum) == 1 }
    }
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum WaiterState {
    Waiting,
    Notified,
    Resumed,
    Canceled,
}

struct Waiter {
    state: PLMutex<WaiterState>,
    waker: PLMutex<Option<Waker>>,
    info: PLMutex<Option<SignalInfo>>,
}

impl Waiter {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            state: PLMutex::new(WaiterState::Waiting),
            waker: PLMutex::new(Some(waker)),
            info: PLMutex::new(None),
        })
    }
}

struct ServiceState {
    attached: bool,
    waiters: HashMap<i32, VecDeque<Arc<Waiter>>>,
    pending: HashMap<i32, VecDeque<SignalInfo>>,
}

fn deliver(state: &PLMutex<ServiceState>, info: SignalInfo) {
    let mut guard = state.lock();
    if !guard.attached {
        return;
    }
    let mut woken = None;
    if let Some(queue) = guard.waiters.get_mut(&info.signum) {
        while let Some(candidate) = queue.pop_front() {
            let mut st = candidate.state.lock();
            if *st == WaiterState::Waiting {
                *st = WaiterState::Notified;
                drop(st);
                woken = Some(candidate);
                break;
            }
        }
    }
    match woken {
        Some(waiter) => {
            *waiter.info.lock() = Some(info);
            drop(guard);
            if let Some(waker) = waiter.waker.lock().take() {
                waker.wake();
            }
        }
        None => {
            guard.pending.entry(info.signum).or_default().push_back(info);
        }
    }
}

pub struct SignalOptions {
    /// How long the dispatcher thread blocks in `sigtimedwait` before
    /// checking for shutdown and retrying.
    pub poll_interval: Duration,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Attaches a signal mask to a loop: the loop becomes able to `await`
/// deliveries of those signals via [`wait_signal`]. One service may be
/// attached per loop at a time.
pub struct SignalService {
    loop_handle: LoopHandle,
    state: Arc<PLMutex<ServiceState>>,
    running: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
}

thread_local! {
    static CURRENT_SERVICE: RefCell<Option<Arc<PLMutex<ServiceState>>>> = const { RefCell::new(None) };
}

impl SignalService {
    pub fn new(loop_handle: LoopHandle) -> Self {
        Self {
            loop_handle,
            state: Arc::new(PLMutex::new(ServiceState {
                attached: false,
                waiters: HashMap::new(),
                pending: HashMap::new(),
            })),
            running: Arc::new(AtomicBool::new(false)),
            dispatcher: None,
        }
    }

    /// Blocks `mask` on the calling (loop) thread and starts a dispatcher
    /// thread waiting on it. Returns `false` if already attached.
    pub fn attach(&mut self, mask: SignalSet) -> bool {
        self.attach_with_options(mask, SignalOptions::default())
    }

    pub fn attach_with_options(&mut self, mask: SignalSet, options: SignalOptions) -> bool {
        contract_assert!(self.loop_handle.in_loop(), "SignalService::attach called off its loop thread");
        {
            let mut state = self.state.lock();
            if state.attached {
                return false;
            }
            state.attached = true;
        }

        // Safety: mask is a validly initialized sigset_t built by SignalSet.
        unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask.set, ptr::null_mut()) };

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let state = self.state.clone();
        let wait_mask = mask.set;
        let poll_interval = options.poll_interval;
        self.dispatcher = Some(thread::spawn(move || {
            // Safety: blocking the same mask on this thread too, so a
            // signal delivered while this thread is between sigtimedwait
            // calls is still held pending rather than delivered async.
            unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &wait_mask, ptr::null_mut()) };
            while running.load(Ordering::Acquire) {
                let mut raw: libc::siginfo_t = unsafe { mem::zeroed() };
                let timeout = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: poll_interval.as_nanos() as i64,
                };
                // Safety: wait_mask, raw and timeout are all validly
                // initialized for the duration of this call.
                let rc = unsafe { libc::sigtimedwait(&wait_mask, &mut raw, &timeout) };
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if rc < 0 {
                    match io::Error::last_os_error().raw_os_error() {
                        Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                        Some(libc::EINVAL) => break,
                        _ => continue,
                    }
                }
                deliver(&state, signal_info_from_raw(&raw));
            }
        }));

        CURRENT_SERVICE.with(|c| *c.borrow_mut() = Some(self.state.clone()));
        true
    }

    pub fn detach(&mut self) {
        contract_assert!(self.loop_handle.in_loop(), "SignalService::detach called off its loop thread");
        if !self.state.lock().attached {
            return;
        }
        self.state.lock().attached = false;
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        CURRENT_SERVICE.with(|c| *c.borrow_mut() = None);
    }
}

impl Drop for SignalService {
    fn drop(&mut self) {
        if self.state.lock().attached && self.loop_handle.in_loop() {
            self.detach();
        } else {
            self.running.store(false, Ordering::Release);
            if let Some(handle) = self.dispatcher.take() {
                let _ = handle.join();
            }
        }
    }
}

/// The future returned by [`wait_signal`].
#[must_use = "futures do nothing unless polled"]
pub struct SignalWait {
    signum: i32,
    state: Option<Arc<PLMutex<ServiceState>>>,
    waiter: Option<Arc<Waiter>>,
}

impl Future for SignalWait {
    type Output = SignalInfo;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SignalInfo> {
        let this = self.get_mut();
        let state = match &this.state {
            Some(state) => state.clone(),
            None => {
                let state = CURRENT_SERVICE
                    .with(|c| c.borrow().clone())
                    .expect("wait_signal() polled with no SignalService attached on this loop");
                this.state = Some(state.clone());
                state
            }
        };

        if this.waiter.is_none() {
            let mut guard = state.lock();
            if let Some(info) = guard
                .pending
                .get_mut(&this.signum)
                .and_then(VecDeque::pop_front)
            {
                return Poll::Ready(info);
            }
            let waiter = Waiter::new(cx.waker().clone());
            guard
                .waiters
                .entry(this.signum)
                .or_default()
                .push_back(waiter.clone());
            drop(guard);
            this.waiter = Some(waiter);
            return Poll::Pending;
        }

        let waiter = this.waiter.as_ref().unwrap().clone();
        let mut wstate = waiter.state.lock();
        match *wstate {
            WaiterState::Notified => {
                *wstate = WaiterState::Resumed;
                drop(wstate);
                let info = waiter.info.lock().take().expect("notified waiter missing its SignalInfo");
                Poll::Ready(info)
            }
            WaiterState::Waiting => {
                *waiter.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
            WaiterState::Resumed | WaiterState::Canceled => {
                contract_assert!(false, "signal waiter reached a terminal state unobserved");
                Poll::Pending
            }
        }
    }
}

impl Drop for SignalWait {
    fn drop(&mut self) {
        let (Some(state), Some(waiter)) = (&self.state, self.waiter.take()) else {
            return;
        };
        let mut guard = state.lock();
        let mut wstate = waiter.state.lock();
        match *wstate {
            WaiterState::Waiting => {
                *wstate = WaiterState::Canceled;
                drop(wstate);
                if let Some(queue) = guard.waiters.get_mut(&self.signum) {
                    queue.retain(|w| !Arc::ptr_eq(w, &waiter));
                }
            }
            WaiterState::Notified => {
                // Delivered but never observed: put the signal back so the
                // next waiter (or poll) sees it instead of losing it.
                *wstate = WaiterState::Canceled;
                drop(wstate);
                if let Some(info) = waiter.info.lock().take() {
                    guard.pending.entry(self.signum).or_default().push_front(info);
                }
            }
            WaiterState::Resumed | WaiterState::Canceled => {}
        }
    }
}

/// Awaits the next delivery of `signum` on the loop currently running,
/// which must have an attached [`SignalService`].
pub fn wait_signal(signum: i32) -> SignalWait {
    SignalWait {
        signum,
        state: None,
        waiter: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::sync::spawn::spawn_on;
    use std::sync::mpsc;

    #[test]
    fn delivers_queued_signal_to_a_late_waiter() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let runner = thread::spawn(move || loop_.run());

        let (tx, rx) = mpsc::channel();
        let handle2 = handle.clone();
        handle.post(move || {
            let mut service = SignalService::new(handle2);
            assert!(service.attach(SignalSet::new().add(libc::SIGUSR1)));
            // Simulate a delivery racing ahead of any waiter.
            deliver(
                &service_state_for_test(&service),
                SignalInfo {
                    signum: libc::SIGUSR1,
                    ..Default::default()
                },
            );
            tx.send(service).unwrap();
        });
        let service = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        spawn_on(&handle, async move {
            let info = wait_signal(libc::SIGUSR1).await;
            done_tx.send(info.signum).unwrap();
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), libc::SIGUSR1);

        handle.post(move || drop(service));
        handle.stop();
        runner.join().unwrap();
    }

    #[test]
    fn two_waiters_are_served_in_queue_order() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let runner = thread::spawn(move || loop_.run());

        let (tx, rx) = mpsc::channel();
        let handle2 = handle.clone();
        handle.post(move || {
            let mut service = SignalService::new(handle2);
            assert!(service.attach(SignalSet::new().add(libc::SIGUSR1)));
            tx.send(service).unwrap();
        });
        let service = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let state = service_state_for_test(&service);

        let (order_tx, order_rx) = mpsc::channel();
        let first_tx = order_tx.clone();
        spawn_on(&handle, async move {
            wait_signal(libc::SIGUSR1).await;
            first_tx.send("first").unwrap();
        });
        let second_tx = order_tx.clone();
        spawn_on(&handle, async move {
            wait_signal(libc::SIGUSR1).await;
            second_tx.send("second").unwrap();
        });

        // Both tasks were posted ahead of this one, so by the time it runs
        // both have already registered themselves as waiters.
        let (confirm_tx, confirm_rx) = mpsc::channel();
        handle.post(move || confirm_tx.send(()).unwrap());
        confirm_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        deliver(&state, SignalInfo { signum: libc::SIGUSR1, ..Default::default() });
        assert_eq!(order_rx.recv_timeout(Duration::from_secs(1)).unwrap(), "first");

        deliver(&state, SignalInfo { signum: libc::SIGUSR1, ..Default::default() });
        assert_eq!(order_rx.recv_timeout(Duration::from_secs(1)).unwrap(), "second");

        handle.post(move || drop(service));
        handle.stop();
        runner.join().unwrap();
    }

    fn service_state_for_test(service: &SignalService) -> Arc<PLMutex<ServiceState>> {
        service.state.clone()
    }
}
