//! Machina Core - Foundational Types and Abstractions
//!
//! This module provides the error taxonomy and shared configuration types
//! used across the machina workspace.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::MachineConfig;
pub use error::{MachinaError, Result};

/// Machina version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
