//! Utility modules.

pub mod timeout;

pub use timeout::{bounded, with_timeout};
