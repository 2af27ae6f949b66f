//! group
//!
//! Owns a fixed set of loops and the worker threads that drive them. The
//! original's `EventLoopGroup` wraps a `ThreadGroup` purely for its thread
//! bookkeeping; since `EventLoop::run` already installs the per-thread
//! current-loop binding itself (`event_loop::CURRENT_LOOP`), there's nothing
//! left for a separate thread-group layer to do, so the two collapse into
//! one type here.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crate::contract_assert;
use crate::event_loop::{current_loop, EventLoop, EventLoopOptions, LoopHandle};
use crate::fatal;

pub struct GroupOptions {
    pub size: usize,
    pub thread_name_prefix: String,
    pub loop_options: EventLoopOptions,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            size: 1,
            thread_name_prefix: "fiberloop-worker".to_string(),
            loop_options: EventLoopOptions::default(),
        }
    }
}

/// A fixed set of `N` event loops, each run on its own OS thread.
///
/// `post` without naming a specific loop follows the original's selection
/// policy: if the caller is itself on a loop thread (any loop, not
/// necessarily one of this group's), that loop is used; otherwise a
/// round-robin counter picks one of this group's loops.
pub struct ThreadedGroup {
    pending: Vec<EventLoop>,
    handles: Vec<LoopHandle>,
    threads: Vec<JoinHandle<()>>,
    name_prefix: String,
    started: AtomicBool,
    next: AtomicUsize,
}

impl ThreadedGroup {
    pub fn new(options: GroupOptions) -> io::Result<Self> {
        contract_assert!(options.size > 0, "ThreadedGroup requires at least one loop");
        let mut pending = Vec::with_capacity(options.size);
        let mut handles = Vec::with_capacity(options.size);
        for _ in 0..options.size {
            let loop_ = EventLoop::with_options(options.loop_options)?;
            handles.push(loop_.handle());
            pending.push(loop_);
        }
        Ok(Self {
            pending,
            handles,
            threads: Vec::new(),
            name_prefix: options.thread_name_prefix,
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn at(&self, index: usize) -> &LoopHandle {
        contract_assert!(index < self.handles.len(), "ThreadedGroup::at index out of range");
        &self.handles[index]
    }

    /// Spawns one thread per loop. Calling this twice is a contract
    /// violation, same as the original.
    pub fn start(&mut self) {
        if self.started.swap(true, Ordering::AcqRel) {
            fatal!("ThreadedGroup::start called twice");
        }
        for (index, mut loop_) in std::mem::take(&mut self.pending).into_iter().enumerate() {
            let name = format!("{}-{index}", self.name_prefix);
            let thread = thread::Builder::new()
                .name(name)
                .spawn(move || loop_.run())
                .expect("failed to spawn event loop thread");
            self.threads.push(thread);
        }
    }

    pub fn stop(&self) {
        for handle in &self.handles {
            handle.stop();
        }
    }

    pub fn join(&mut self) {
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    /// Posts `task` onto the current loop if called from a loop thread,
    /// otherwise onto this group's next loop in round-robin order.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.select_loop().post(task);
    }

    fn select_loop(&self) -> LoopHandle {
        if let Some(handle) = current_loop() {
            return handle;
        }
        contract_assert!(!self.handles.is_empty());
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[index].clone()
    }
}

impl Drop for ThreadedGroup {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) {
            self.stop();
            self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn posts_round_robin_across_loops_from_outside() {
        let mut group = ThreadedGroup::new(GroupOptions {
            size: 2,
            ..GroupOptions::default()
        })
        .unwrap();
        group.start();

        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            group.post(move || tx.send(()).unwrap());
        }
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }

        group.stop();
        group.join();
    }

    #[test]
    fn starting_twice_is_fatal() {
        // Exercised via contract_assert/fatal! abort paths elsewhere;
        // covered here only at the type level: `started` flips once.
        let mut group = ThreadedGroup::new(GroupOptions::default()).unwrap();
        group.start();
        assert!(group.started.load(Ordering::Acquire));
        group.stop();
        group.join();
    }
}
