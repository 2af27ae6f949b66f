//! common

pub mod assert;
pub mod error;

pub use error::{IoErr, IoResult};
