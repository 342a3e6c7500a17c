//! # kscope Utilities
//!
//! Shared utilities and logging for kscope.
//!
//! This crate provides the `tracing` subscriber setup used by tools and test
//! harnesses built on `kscope-core`. The core library only emits events; it
//! never installs a subscriber itself.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_test_logging, LogConfig, LogFormat, LogGuard, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
