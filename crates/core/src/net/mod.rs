//! net
//!
//! Listener glue: async accept over any non-blocking listener the loop's
//! poller can watch. Address parsing and listener construction proper stay
//! out of scope; a caller hands in an already-bindable listener type and
//! gets raw peer-address bytes back.

pub mod accept;

pub use accept::{AcceptCore, AcceptFuture, Acceptor};
