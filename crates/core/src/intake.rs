//! intake
//!
//! Lock-free multi-producer single-consumer command intake. Any thread may
//! push; only the loop thread may drain. Built on `crossbeam`'s lock-free
//! queue rather than a hand-rolled intrusive stack — it gives the same
//! wait-free push and loses nothing the original's batch-reversal trick
//! bought (global FIFO is strictly stronger than the per-producer FIFO the
//! original settled for).

use crossbeam::queue::SegQueue;

pub(crate) struct MpscIntake<T> {
    queue: SegQueue<T>,
}

impl<T> MpscIntake<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Wait-free push, callable from any thread.
    pub fn push(&self, item: T) {
        self.queue.push(item);
    }

    /// Drains everything currently queued, in FIFO order. Callable only on
    /// the loop thread.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.queue.pop() {
            out.push(item);
        }
        out
    }
}
