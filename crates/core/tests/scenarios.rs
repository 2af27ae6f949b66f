//! End-to-end scenarios exercising the public surface of the runtime:
//! frame-pool binding, timer ordering, mutex hand-off (same loop and
//! cross-loop), cancelled waiters, and the accept-busy contract.
//!
//! Signal delivery (FIFO ordering, pending-before-await) is covered by
//! colocated unit tests in `sync::signal` instead, since deterministic
//! coverage there needs the module's private delivery hook rather than
//! racing real kernel signals across a multi-threaded test binary.

use std::future::Future;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use futures::pin_mut;

use fiberloop_core::common::error::IoErr;
use fiberloop_core::event_loop::EventLoop;
use fiberloop_core::frame::FramePool;
use fiberloop_core::group::{GroupOptions, ThreadedGroup};
use fiberloop_core::net::AcceptCore;
use fiberloop_core::sync::{sleep, spawn_on, AsyncMutex};

fn noop_waker() -> std::task::Waker {
    futures::task::noop_waker()
}

/// Start a group of one loop, post a thunk onto it: the thread-local
/// current frame pool and the loop's own accessor must agree, and neither
/// is null.
#[test]
fn frame_pool_is_bound_on_the_loop_thread() {
    let mut group = ThreadedGroup::new(GroupOptions::default()).unwrap();
    group.start();
    let handle = group.at(0).clone();

    let (tx, rx) = mpsc::channel();
    let handle2 = handle.clone();
    handle.post(move || {
        let current = FramePool::current();
        let from_handle = handle2.frame_pool() as *const FramePool;
        let matches = current.map(|p| p as *const FramePool) == Some(from_handle);
        tx.send(current.is_some() && matches).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());

    group.stop();
    group.join();
}

/// Timers armed out of deadline order (+10ms, +30ms, +20ms) must fire in
/// deadline order (10, 20, 30), not post order.
#[test]
fn timers_fire_in_deadline_order_not_post_order() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();
    let runner = thread::spawn(move || loop_.run());

    let (tx, rx) = mpsc::channel();
    let t10 = tx.clone();
    let t30 = tx.clone();
    let t20 = tx.clone();
    handle.post_after(Duration::from_millis(10), move || t10.send(10u64).unwrap());
    handle.post_after(Duration::from_millis(30), move || t30.send(30u64).unwrap());
    handle.post_after(Duration::from_millis(20), move || t20.send(20u64).unwrap());

    let order: Vec<u64> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    assert_eq!(order, vec![10, 20, 30]);

    handle.stop();
    runner.join().unwrap();
}

/// A holds the mutex, does work (sleep, then flips shared state to 2),
/// and unlocks. B, queued behind A, must not enter its critical section
/// until A's work is actually done.
#[test]
fn mutex_hands_off_only_after_the_holder_finishes_its_work() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();
    let runner = thread::spawn(move || loop_.run());

    let mutex = Arc::new(AsyncMutex::new());
    let state = Arc::new(AtomicUsize::new(0));

    let (a_acquired_tx, a_acquired_rx) = mpsc::channel();
    let mutex_a = mutex.clone();
    let state_a = state.clone();
    spawn_on(&handle, async move {
        let _guard = mutex_a.lock().await;
        state_a.store(1, Ordering::SeqCst);
        a_acquired_tx.send(()).unwrap();
        sleep(Duration::from_millis(30)).await;
        state_a.store(2, Ordering::SeqCst);
    });
    a_acquired_rx.recv_timeout(Duration::from_secs(1)).unwrap();

    let (b_done_tx, b_done_rx) = mpsc::channel();
    let mutex_b = mutex.clone();
    let state_b = state.clone();
    spawn_on(&handle, async move {
        let _guard = mutex_b.lock().await;
        b_done_tx.send(state_b.load(Ordering::SeqCst)).unwrap();
    });

    assert_eq!(b_done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);

    handle.stop();
    runner.join().unwrap();
}

/// A locks on loop 0 and holds the lock while it sleeps; B, on loop 1,
/// starts waiting before A releases. When B is finally resumed it must
/// still be running on loop 1's own thread, not loop 0's.
#[test]
fn mutex_waiter_resumes_on_its_own_loop_thread_after_cross_loop_release() {
    let mut group = ThreadedGroup::new(GroupOptions {
        size: 2,
        ..GroupOptions::default()
    })
    .unwrap();
    group.start();
    let loop0 = group.at(0).clone();
    let loop1 = group.at(1).clone();

    let mutex = Arc::new(AsyncMutex::new());

    let mutex_a = mutex.clone();
    spawn_on(&loop0, async move {
        let _guard = mutex_a.lock().await;
        sleep(Duration::from_millis(20)).await;
        // guard dropped here, releasing the lock from loop 0's thread
    });

    let (tid_tx, tid_rx) = mpsc::channel();
    let mutex_b = mutex.clone();
    spawn_on(&loop1, async move {
        let before = thread::current().id();
        let _guard = mutex_b.lock().await;
        let after = thread::current().id();
        tid_tx.send((before, after)).unwrap();
    });

    let (before, after) = tid_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(before, after);

    group.stop();
    group.join();
}

/// B queues behind A's held lock, then B's awaiter is dropped before it
/// is ever resumed. Releasing A's guard afterwards must not resume B (it
/// no longer exists) and must leave the mutex free for a new locker.
#[test]
fn dropping_a_queued_waiter_before_resumption_does_not_resume_it() {
    let mutex = AsyncMutex::new();
    let guard = mutex.try_lock().unwrap();

    let hits = AtomicUsize::new(0);
    let fut = async {
        let _g = mutex.lock().await;
        hits.fetch_add(1, Ordering::SeqCst);
    };
    pin_mut!(fut);

    let waker = noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);
    assert!(matches!(fut.as_mut().poll(&mut cx), std::task::Poll::Pending));

    drop(fut); // cancels the queued waiter
    drop(guard); // releases; must not find a resumable waiter

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(mutex.try_lock().is_some());
}

/// One task is suspended in `accept().await`; a second, concurrent
/// `accept()` on the same core must fail fast with `Busy` while the
/// first one still eventually completes.
#[test]
fn second_concurrent_accept_is_busy_while_first_completes() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();
    let runner = thread::spawn(move || loop_.run());

    let (ready_tx, ready_rx) = mpsc::channel();
    let (busy_tx, busy_rx) = mpsc::channel();
    let (accepted_tx, accepted_rx) = mpsc::channel();
    let handle2 = handle.clone();
    spawn_on(&handle, async move {
        let core = Arc::new(AcceptCore::new(handle2, listener).unwrap());
        let core2 = core.clone();
        ready_tx.send(()).unwrap();

        let first = core.accept();
        pin_mut!(first);
        // Poll once manually so the first accept registers itself as the
        // outstanding waiter before the second, concurrent one is tried.
        let waker = noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        assert!(matches!(first.as_mut().poll(&mut cx), std::task::Poll::Pending));

        let second = core2.accept().await;
        busy_tx.send(matches!(second, Err(IoErr::Busy))).unwrap();

        let (_fd, _peer) = first.await.unwrap();
        accepted_tx.send(()).unwrap();
    });

    ready_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(busy_rx.recv_timeout(Duration::from_secs(1)).unwrap());

    let _client = TcpStream::connect(addr).unwrap();
    accepted_rx.recv_timeout(Duration::from_secs(1)).unwrap();

    handle.stop();
    runner.join().unwrap();
}
