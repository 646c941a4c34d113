//! Common utilities for usb-topology
//!
//! Shared plumbing for the topology crate and its binary: the error type used
//! by setup code and the tracing subscriber configuration.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{LogFormat, setup_logging};
