//! assert
//!
//! Contract-violation handling. A violated invariant here is a bug in the
//! runtime or its caller, never a recoverable condition, so these macros log
//! and abort rather than unwind — catching a corrupted invariant with
//! `catch_unwind` on another thread would be worse than crashing.

/// Logs at `error!` and aborts the process. Never returns.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort();
    }};
}

/// Like `assert!`, but aborts instead of unwinding on failure.
#[macro_export]
macro_rules! contract_assert {
    ($cond:expr) => {
        if !($cond) {
            $crate::fatal!("contract violation: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::fatal!("contract violation: {} ({})", stringify!($cond), format_args!($($arg)*));
        }
    };
}
