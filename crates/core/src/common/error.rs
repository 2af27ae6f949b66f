//! error

use std::{error, fmt, io};

/// Opaque error kind shared by every suspension primitive and I/O operation
/// in this crate. Deliberately flat (no nested source chain) the way the
/// runtime's own error enums are: a caller inspects the kind, it does not
/// walk a cause chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IoErr {
    None,
    WouldBlock,
    Interrupted,
    Invalid,
    BadFd,
    Busy,
    NotFound,
    AddrInUse,
    AddrNotAvailable,
    ConnAborted,
    ConnReset,
    ConnRefused,
    TimedOut,
    NotConnected,
    Already,
    Permission,
    BrokenPipe,
    NoMem,
    NotSupported,
    Canceled,
    Unknown,
}

impl fmt::Display for IoErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl error::Error for IoErr {}

impl IoErr {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::WouldBlock => "would_block",
            Self::Interrupted => "interrupted",
            Self::Invalid => "invalid",
            Self::BadFd => "bad_fd",
            Self::Busy => "busy",
            Self::NotFound => "not_found",
            Self::AddrInUse => "addr_in_use",
            Self::AddrNotAvailable => "addr_not_available",
            Self::ConnAborted => "conn_aborted",
            Self::ConnReset => "conn_reset",
            Self::ConnRefused => "conn_refused",
            Self::TimedOut => "timed_out",
            Self::NotConnected => "not_connected",
            Self::Already => "already",
            Self::Permission => "permission",
            Self::BrokenPipe => "broken_pipe",
            Self::NoMem => "no_mem",
            Self::NotSupported => "not_supported",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }

    /// Maps a raw `errno` value the way the source's `io_err_from_errno` does.
    pub fn from_errno(err: i32) -> Self {
        match err {
            0 => Self::None,
            libc::EAGAIN => Self::WouldBlock,
            libc::EINTR => Self::Interrupted,
            libc::EINVAL => Self::Invalid,
            libc::EBADF => Self::BadFd,
            libc::EBUSY => Self::Busy,
            libc::ENOENT => Self::NotFound,
            libc::EADDRINUSE => Self::AddrInUse,
            libc::EADDRNOTAVAIL => Self::AddrNotAvailable,
            libc::ECONNABORTED => Self::ConnAborted,
            libc::ECONNRESET => Self::ConnReset,
            libc::ECONNREFUSED => Self::ConnRefused,
            libc::ETIMEDOUT => Self::TimedOut,
            libc::ENOTCONN => Self::NotConnected,
            libc::EALREADY => Self::Already,
            libc::EACCES | libc::EPERM => Self::Permission,
            libc::EPIPE => Self::BrokenPipe,
            libc::ENOMEM => Self::NoMem,
            libc::ENOTSUP => Self::NotSupported,
            libc::ECANCELED => Self::Canceled,
            _ => Self::Unknown,
        }
    }

    pub fn to_errno(self) -> i32 {
        match self {
            Self::None => 0,
            Self::WouldBlock => libc::EAGAIN,
            Self::Interrupted => libc::EINTR,
            Self::Invalid => libc::EINVAL,
            Self::BadFd => libc::EBADF,
            Self::Busy => libc::EBUSY,
            Self::NotFound => libc::ENOENT,
            Self::AddrInUse => libc::EADDRINUSE,
            Self::AddrNotAvailable => libc::EADDRNOTAVAIL,
            Self::ConnAborted => libc::ECONNABORTED,
            Self::ConnReset => libc::ECONNRESET,
            Self::ConnRefused => libc::ECONNREFUSED,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::NotConnected => libc::ENOTCONN,
            Self::Already => libc::EALREADY,
            Self::Permission => libc::EACCES,
            Self::BrokenPipe => libc::EPIPE,
            Self::NoMem => libc::ENOMEM,
            Self::NotSupported => libc::ENOTSUP,
            Self::Canceled => libc::ECANCELED,
            Self::Unknown => libc::EINVAL,
        }
    }
}

impl From<io::Error> for IoErr {
    fn from(value: io::Error) -> Self {
        match value.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => Self::Unknown,
        }
    }
}

pub type IoResult<T> = Result<T, IoErr>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_errno() {
        for err in [
            IoErr::WouldBlock,
            IoErr::Interrupted,
            IoErr::BadFd,
            IoErr::Busy,
            IoErr::ConnReset,
            IoErr::TimedOut,
        ] {
            assert_eq!(IoErr::from_errno(err.to_errno()), err);
        }
    }

    #[test]
    fn unknown_errno_maps_to_unknown() {
        assert_eq!(IoErr::from_errno(-1), IoErr::Unknown);
    }
}
