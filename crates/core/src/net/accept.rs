//! accept
//!
//! Async accept over a non-blocking listener. The original's `AcceptFd<Traits>`
//! is templated on a `Traits` type providing `Address`/`ListenOptions`/
//! `AcceptResult` plus `bind`/`accept_once`; address parsing and listener
//! construction are out of scope here too, so the generalization is a single
//! `Acceptor` trait an already-bound, already-nonblocking listener
//! implements, with blanket impls over `TcpListener`/`UnixListener` solely so
//! the state machine below is exercisable without a real protocol stack.

use std::future::Future;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex as PLMutex;

use crate::common::error::{IoErr, IoResult};
use crate::contract_assert;
use crate::event_loop::{LoopHandle, WatchHandle};
use crate::poller::IoEvent;

/// A non-blocking listener `AcceptCore` can drive. `accept_nonblocking`
/// returns the accepted fd and its peer address as raw bytes — parsing them
/// into a typed address is the caller's problem, not this crate's.
pub trait Acceptor: Send + Sync + 'static {
    fn fd(&self) -> RawFd;
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
    fn accept_nonblocking(&self) -> io::Result<(RawFd, Box<[u8]>)>;
}

impl Acceptor for TcpListener {
    fn fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpListener::set_nonblocking(self, nonblocking)
    }

    fn accept_nonblocking(&self) -> io::Result<(RawFd, Box<[u8]>)> {
        let (stream, addr) = self.accept()?;
        stream.set_nonblocking(true)?;
        Ok((stream.into_raw_fd(), addr.to_string().into_bytes().into_boxed_slice()))
    }
}

impl Acceptor for UnixListener {
    fn fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixListener::set_nonblocking(self, nonblocking)
    }

    fn accept_nonblocking(&self) -> io::Result<(RawFd, Box<[u8]>)> {
        use std::os::unix::ffi::OsStrExt;
        let (stream, addr) = self.accept()?;
        stream.set_nonblocking(true)?;
        let bytes = addr
            .as_pathname()
            .map(|p| p.as_os_str().as_bytes().to_vec())
            .unwrap_or_default();
        Ok((stream.into_raw_fd(), bytes.into_boxed_slice()))
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
    result: PLMutex<Option<IoResult<(RawFd, Box<[u8]>)>>>,
}

impl Waiter {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            state: PLMutex::new(WaiterState::Waiting),
            waker: PLMutex::new(Some(waker)),
            result: PLMutex::new(None),
        })
    }
}

struct State<L: Acceptor> {
    listener: L,
    waiter: PLMutex<Option<Arc<Waiter>>>,
    watch: PLMutex<Option<WatchHandle>>,
}

fn on_acceptable<L: Acceptor>(state: &Arc<State<L>>) {
    let waiter = match state.waiter.lock().take() {
        Some(w) => w,
        None => {
            if let Some(handle) = state.watch.lock().take() {
                handle.unwatch();
            }
            return;
        }
    };
    match state.listener.accept_nonblocking() {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            *state.waiter.lock() = Some(waiter);
        }
        outcome => {
            if let Some(handle) = state.watch.lock().take() {
                handle.unwatch();
            }
            *waiter.result.lock() = Some(outcome.map_err(IoErr::from));
            let mut wstate = waiter.state.lock();
            *wstate = WaiterState::Notified;
            drop(wstate);
            if let Some(waker) = waiter.waker.lock().take() {
                waker.wake();
            }
        }
    }
}

/// Drives a single non-blocking listener's accept loop against the event
/// loop's poller. Only one `accept()` future may be outstanding at a time —
/// a second concurrent call resolves immediately with `IoErr::Busy`.
pub struct AcceptCore<L: Acceptor> {
    loop_handle: LoopHandle,
    state: Arc<State<L>>,
}

impl<L: Acceptor> AcceptCore<L> {
    pub fn new(loop_handle: LoopHandle, listener: L) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            loop_handle,
            state: Arc::new(State {
                listener,
                waiter: PLMutex::new(None),
                watch: PLMutex::new(None),
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.state.listener.fd()
    }

    pub fn accept(&self) -> AcceptFuture<'_, L> {
        AcceptFuture {
            core: self,
            waiter: None,
            done: false,
        }
    }

    fn begin_wait(&self, waker: &Waker) -> (Poll<IoResult<(RawFd, Box<[u8]>)>>, Option<Arc<Waiter>>) {
        contract_assert!(self.loop_handle.in_loop(), "AcceptCore polled off its loop thread");
        if self.state.waiter.lock().is_some() {
            return (Poll::Ready(Err(IoErr::Busy)), None);
        }
        match self.state.listener.accept_nonblocking() {
            Ok(pair) => return (Poll::Ready(Ok(pair)), None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return (Poll::Ready(Err(IoErr::from(e))), None),
        }
        let waiter = Waiter::new(waker.clone());
        *self.state.waiter.lock() = Some(waiter.clone());
        self.ensure_watch();
        (Poll::Pending, Some(waiter))
    }

    fn ensure_watch(&self) {
        let mut watch = self.state.watch.lock();
        if watch.is_some() {
            return;
        }
        let fd = self.state.listener.fd();
        let state = self.state.clone();
        let handle = self
            .loop_handle
            .watch_fd(fd, IoEvent::READ, move |_events| on_acceptable(&state));
        *watch = Some(handle);
    }

    fn cancel_wait(&self, waiter: &Arc<Waiter>) {
        let mut wstate = waiter.state.lock();
        if *wstate != WaiterState::Waiting {
            return;
        }
        *wstate = WaiterState::Canceled;
        drop(wstate);
        let mut guard = self.state.waiter.lock();
        if matches!(guard.as_ref(), Some(current) if Arc::ptr_eq(current, waiter)) {
            guard.take();
            drop(guard);
            if let Some(handle) = self.state.watch.lock().take() {
                handle.unwatch();
            }
        }
    }
}

/// The future returned by [`AcceptCore::accept`].
#[must_use = "futures do nothing unless polled"]
pub struct AcceptFuture<'a, L: Acceptor> {
    core: &'a AcceptCore<L>,
    waiter: Option<Arc<Waiter>>,
    done: bool,
}

impl<'a, L: Acceptor> Future for AcceptFuture<'a, L> {
    type Output = IoResult<(RawFd, Box<[u8]>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        contract_assert!(!this.done, "polled an AcceptFuture after it already resolved");

        if this.waiter.is_none() {
            let (poll, waiter) = this.core.begin_wait(cx.waker());
            return match poll {
                Poll::Ready(out) => {
                    this.done = true;
                    Poll::Ready(out)
                }
                Poll::Pending => {
                    this.waiter = waiter;
                    Poll::Pending
                }
            };
        }

        let waiter = this.waiter.as_ref().unwrap().clone();
        let mut wstate = waiter.state.lock();
        match *wstate {
            WaiterState::Notified => {
                *wstate = WaiterState::Resumed;
                drop(wstate);
                this.done = true;
                let result = waiter.result.lock().take().expect("notified waiter missing a result");
                Poll::Ready(result)
            }
            WaiterState::Waiting => {
                *waiter.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
            WaiterState::Resumed | WaiterState::Canceled => {
                contract_assert!(false, "accept waiter reached a terminal state unobserved");
                Poll::Pending
            }
        }
    }
}

impl<'a, L: Acceptor> Drop for AcceptFuture<'a, L> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if !self.done {
                self.core.cancel_wait(&waiter);
            }
        }
    }
}
