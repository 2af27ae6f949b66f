//! sleep
//!
//! A future that resolves once a delay has elapsed on the current loop.
//! Zero or negative delays resolve on first poll without touching the
//! timer heap at all, same as the original's `await_ready` short-circuit.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::event_loop::{current_loop, TimerHandle};

struct Shared {
    fired: Mutex<bool>,
    waker: Mutex<Option<Waker>>,
}

#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    delay: Duration,
    timer: Option<TimerHandle>,
    shared: Option<std::sync::Arc<Shared>>,
}

impl Sleep {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            timer: None,
            shared: None,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some(shared) = &this.shared {
            if *shared.fired.lock() {
                return Poll::Ready(());
            }
            *shared.waker.lock() = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if this.delay <= Duration::ZERO {
            return Poll::Ready(());
        }
        let handle = current_loop().expect("sleep() polled off a loop thread");
        let shared = std::sync::Arc::new(Shared {
            fired: Mutex::new(false),
            waker: Mutex::new(Some(cx.waker().clone())),
        });
        let fire_shared = shared.clone();
        this.timer = Some(handle.post_after(this.delay, move || {
            *fire_shared.fired.lock() = true;
            if let Some(waker) = fire_shared.waker.lock().take() {
                waker.wake();
            }
        }));
        this.shared = Some(shared);
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Resolves after `delay` has elapsed on the loop driving the calling
/// task. Must be polled on a loop thread once it needs to arm a timer
/// (a zero-or-negative delay never touches the loop at all).
pub fn sleep(delay: Duration) -> Sleep {
    Sleep::new(delay)
}

pub fn sleep_until(deadline: Instant) -> Sleep {
    sleep(deadline.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn zero_delay_resolves_without_a_loop() {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = sleep(Duration::ZERO);
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(())));
    }

    #[test]
    fn nonzero_delay_fires_on_the_loop() {
        use crate::sync::spawn::spawn_on;

        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let runner = thread::spawn(move || loop_.run());

        let (tx, rx) = mpsc::channel();
        spawn_on(&handle, async move {
            sleep(Duration::from_millis(5)).await;
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.stop();
        runner.join().unwrap();
    }
}
