//! spawn
//!
//! Detached task spawning. The original's `spawn(factory)` invokes the
//! factory inline on the loop thread via a posted command and, if it
//! returns a coroutine handle, resumes it once; here the "factory" is
//! just a `Future<Output = ()>` and the posted command is its first
//! `Runnable::run()`, with every later step driven by the task's own
//! waker rather than a second explicit post.

use std::future::Future;

use crate::event_loop::{current_loop, LoopHandle};
use crate::task::spawn_task;

/// Spawns `future` onto `loop_handle`, detached: nothing observes its
/// output, and dropping the returned value (there is none) does not cancel
/// it. The first poll happens on the loop thread, never inline here.
pub fn spawn_on<F>(loop_handle: &LoopHandle, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let schedule_handle = loop_handle.clone();
    let runnable = spawn_task(future, move |runnable| schedule_handle.post_resume(runnable));
    loop_handle.post_resume(runnable);
}

/// Spawns `future` onto the loop currently running on this thread.
///
/// Panics if called off a loop thread — use [`spawn_on`] to target a
/// specific loop from elsewhere.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = current_loop().expect("spawn() called off a loop thread");
    spawn_on(&handle, future);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn spawned_future_runs_to_completion() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let runner = thread::spawn(move || loop_.run());

        let (tx, rx) = mpsc::channel();
        spawn_on(&handle, async move {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        handle.stop();
        runner.join().unwrap();
    }
}
