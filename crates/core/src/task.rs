//! task
//!
//! A spawned coroutine, reshaped from the original's stackless-coroutine
//! frame (`CoroutinePromiseBase` plus a raw resume pointer) into a
//! `std::future::Future` driven by a small state machine. The
//! `UnsafeCell` + `Mutex<TaskState>` split mirrors the pool's own
//! oneshot-callback pattern: the mutex serializes *state transitions*, the
//! unsafe cell holds the payload that is only ever touched by whichever
//! side currently holds exclusive rights to it.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::contract_assert;
use crate::frame::FrameBox;

/// A runnable unit of work, ready to be driven one step by whichever thread
/// pops it off a loop's command intake. Type-erased so `EventLoop` can hold
/// a homogeneous queue of tasks spawned with different future types.
pub(crate) trait ErasedTask: Send + Sync + 'static {
    fn run(self: Arc<Self>);
}

#[derive(Clone)]
pub struct Runnable(Arc<dyn ErasedTask>);

impl Runnable {
    pub(crate) fn new(task: Arc<dyn ErasedTask>) -> Self {
        Self(task)
    }

    pub(crate) fn run(self) {
        self.0.run();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TaskState {
    /// Not queued, not being polled. `wake()` from here enqueues.
    Idle,
    /// Queued for `run()`, not yet started.
    Queued,
    /// `run()` is on the stack, inside `future.poll`.
    Polling,
    /// Woken while `Polling`; `run()` must poll again before returning.
    Repoll,
    Complete,
}

struct Task<F: Future<Output = ()>> {
    future: UnsafeCell<FrameBox<Option<F>>>,
    state: Mutex<TaskState>,
    schedule: Box<dyn Fn(Runnable) + Send + Sync>,
}

// Safety: `future` is only ever touched while `state` is held in the
// `Polling` state, which at most one thread occupies at a time (enforced by
// the `Idle -> Queued -> Polling` transition guarded by the mutex).
unsafe impl<F: Future<Output = ()> + Send> Sync for Task<F> {}

impl<F: Future<Output = ()> + Send + 'static> Task<F> {
    fn poll_once(self: &Arc<Self>) {
        // Safety: serialized by `state` being `Polling` for exactly one
        // caller at a time; see the Sync impl's safety comment.
        let future = unsafe { &mut *self.future.get() };
        let slot = future.as_mut();
        let Some(inner) = slot.as_mut() else {
            contract_assert!(false, "polled a task with no future installed");
            return;
        };
        // Safety: the future is heap-allocated via FrameBox and never moved
        // out of that allocation for its lifetime.
        let pinned = unsafe { Pin::new_unchecked(inner) };
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        if pinned.poll(&mut cx).is_ready() {
            *slot = None;
            let mut state = self.state.lock().unwrap();
            *state = TaskState::Complete;
        }
    }
}

impl<F: Future<Output = ()> + Send + 'static> ErasedTask for Task<F> {
    fn run(self: Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                TaskState::Queued => *state = TaskState::Polling,
                TaskState::Complete => return,
                other => contract_assert!(false, "task run() entered from state {other:?}"),
            }
        }
        loop {
            self.poll_once();
            let mut state = self.state.lock().unwrap();
            match *state {
                TaskState::Complete => return,
                TaskState::Polling => {
                    *state = TaskState::Idle;
                    return;
                }
                TaskState::Repoll => {
                    *state = TaskState::Polling;
                    continue;
                }
                other => contract_assert!(false, "task run() loop saw state {other:?}"),
            }
        }
    }
}

impl<F: Future<Output = ()> + Send + 'static> Wake for Task<F> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        match *state {
            TaskState::Idle => {
                *state = TaskState::Queued;
                drop(state);
                (self.schedule)(Runnable::new(self.clone()));
            }
            TaskState::Polling => *state = TaskState::Repoll,
            TaskState::Queued | TaskState::Repoll | TaskState::Complete => {}
        }
    }
}

/// Allocates `future` from the current thread's frame pool and wraps it in
/// a `Runnable` task. `schedule` is called (possibly from any thread, any
/// number of times) whenever the task becomes ready to make progress; the
/// caller is expected to route it back onto the owning loop's command
/// intake as a `Command::Resume`.
pub(crate) fn spawn_task<F>(
    future: F,
    schedule: impl Fn(Runnable) + Send + Sync + 'static,
) -> Runnable
where
    F: Future<Output = ()> + Send + 'static,
{
    let task: Arc<Task<F>> = Arc::new(Task {
        future: UnsafeCell::new(FrameBox::new(Some(future))),
        state: Mutex::new(TaskState::Queued),
        schedule: Box::new(schedule),
    });
    Runnable::new(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FramePool, FramePoolGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Poll as StdPoll;

    struct YieldOnce {
        polled: usize,
    }

    impl Future for YieldOnce {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> StdPoll<()> {
            if self.polled == 0 {
                self.polled = 1;
                cx.waker().wake_by_ref();
                StdPoll::Pending
            } else {
                StdPoll::Ready(())
            }
        }
    }

    #[test]
    fn runs_to_completion_through_self_wake() {
        let pool = FramePool::new();
        let _guard = FramePoolGuard::new(&pool);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let runnable = spawn_task(YieldOnce { polled: 0 }, move |r| {
            runs2.fetch_add(1, Ordering::SeqCst);
            r.run();
        });
        runnable.run();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn ready_immediately_completes_on_first_run() {
        let pool = FramePool::new();
        let _guard = FramePoolGuard::new(&pool);
        let runnable = spawn_task(async {}, |_| {
            contract_assert!(false, "should not reschedule a never-pending future");
        });
        runnable.run();
        assert_eq!(pool.in_use(), 0);
    }
}
