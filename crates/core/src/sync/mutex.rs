//! mutex
//!
//! Fair (FIFO) async mutex. `try_lock`/`unlock` mirror the original's
//! `locked_` flag guarded by a single lock; the intrusive prev/next waiter
//! list becomes a `VecDeque<Arc<Waiter>>` since nothing here needs raw
//! pointer unlinking once the compiler can see the queue directly. Lock
//! ordering is always the mutex's own `inner` lock before a waiter's
//! per-waiter `state` lock, at every call site, so the two can never
//! deadlock against each other.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex as PLMutex;

use crate::contract_assert;

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
}

impl Waiter {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            state: PLMutex::new(WaiterState::Waiting),
            waker: PLMutex::new(Some(waker)),
        })
    }

    fn notify(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

struct Inner {
    locked: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

/// Selects the next waiter to grant the lock to, skipping any that were
/// cancelled while queued. Clears `locked` if the queue runs dry. Must be
/// called with `inner` held.
fn select_next(inner: &mut Inner) -> Option<Arc<Waiter>> {
    while let Some(candidate) = inner.waiters.pop_front() {
        let mut state = candidate.state.lock();
        contract_assert!(*state != WaiterState::Resumed);
        if *state == WaiterState::Waiting {
            *state = WaiterState::Notified;
            drop(state);
            return Some(candidate);
        }
    }
    inner.locked = false;
    None
}

/// A mutex whose `lock()` future queues fairly: whichever waiter queued
/// first is the next one granted the lock, regardless of which thread
/// unlocks it or which loop that waiter's task runs on.
pub struct AsyncMutex {
    inner: PLMutex<Inner>,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            inner: PLMutex::new(Inner {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.locked {
            return None;
        }
        contract_assert!(inner.waiters.is_empty());
        inner.locked = true;
        Some(LockGuard { mutex: self })
    }

    /// Returns a future that resolves to a `LockGuard` once the lock is
    /// held.
    pub fn lock(&self) -> LockFuture<'_> {
        LockFuture {
            mutex: self,
            waiter: None,
            acquired: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    fn release(&self) {
        let next = {
            let mut inner = self.inner.lock();
            contract_assert!(inner.locked, "release on an unlocked mutex");
            select_next(&mut inner)
        };
        if let Some(waiter) = next {
            waiter.notify();
        }
    }

    fn cancel_waiter(&self, waiter: &Arc<Waiter>) {
        let mut inner = self.inner.lock();
        let mut state = waiter.state.lock();
        match *state {
            WaiterState::Waiting => {
                *state = WaiterState::Canceled;
                drop(state);
                inner.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
            }
            WaiterState::Notified => {
                *state = WaiterState::Canceled;
                drop(state);
                let next = select_next(&mut inner);
                drop(inner);
                if let Some(w) = next {
                    w.notify();
                }
            }
            WaiterState::Resumed | WaiterState::Canceled => {}
        }
    }
}

/// Holds the lock; releases it (waking the next waiter, if any) on drop.
pub struct LockGuard<'a> {
    mutex: &'a AsyncMutex,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

/// The future returned by [`AsyncMutex::lock`].
#[must_use = "futures do nothing unless polled"]
pub struct LockFuture<'a> {
    mutex: &'a AsyncMutex,
    waiter: Option<Arc<Waiter>>,
    acquired: bool,
}

impl<'a> Future for LockFuture<'a> {
    type Output = LockGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        contract_assert!(!this.acquired, "polled a LockFuture after it already resolved");
        if this.waiter.is_none() {
            if let Some(guard) = this.mutex.try_lock() {
                this.acquired = true;
                return Poll::Ready(guard);
            }
            let waiter = Waiter::new(cx.waker().clone());
            let mut inner = this.mutex.inner.lock();
            if !inner.locked {
                inner.locked = true;
                drop(inner);
                this.acquired = true;
                return Poll::Ready(LockGuard { mutex: this.mutex });
            }
            inner.waiters.push_back(waiter.clone());
            drop(inner);
            this.waiter = Some(waiter);
            return Poll::Pending;
        }

        let waiter = this.waiter.as_ref().unwrap().clone();
        let mut state = waiter.state.lock();
        match *state {
            WaiterState::Notified => {
                *state = WaiterState::Resumed;
                drop(state);
                this.acquired = true;
                Poll::Ready(LockGuard { mutex: this.mutex })
            }
            WaiterState::Waiting => {
                *waiter.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
            WaiterState::Resumed | WaiterState::Canceled => {
                contract_assert!(false, "waiter reached a terminal state without the future observing it");
                Poll::Pending
            }
        }
    }
}

impl Drop for LockFuture<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if !self.acquired {
                self.mutex.cancel_waiter(&waiter);
            }
        }
    }
}
