//! sync
//!
//! Suspension primitives built on top of `event_loop`: a fair mutex, a
//! timer-backed sleep, detached task spawning, and (in `signal`) a
//! loop-integrated POSIX signal wait.

pub mod mutex;
pub mod signal;
pub mod sleep;
pub mod spawn;

pub use mutex::{AsyncMutex, LockFuture, LockGuard};
pub use signal::{wait_signal, SignalInfo, SignalOptions, SignalService, SignalSet};
pub use sleep::{sleep, sleep_until, Sleep};
pub use spawn::{spawn, spawn_on};
