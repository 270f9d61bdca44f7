//! Shale Core - Foundational Types and Abstractions
//!
//! This module provides the error types, preparation options, and logging
//! setup shared across the shale image inspection tool.

pub mod error;
pub mod log;
pub mod options;

// Re-export commonly used types
pub use error::{Result, ShaleError};
pub use options::{Platform, PrepareOptions};

/// Shale version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
