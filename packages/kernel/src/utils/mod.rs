// packages/kernel/src/utils/mod.rs
//! Common utilities shared across the kernel
//!
//! - **config**: Layered configuration (defaults, TOML file, environment)
//! - **errors**: Kernel error type and result alias

pub mod config;
pub mod errors;

pub use config::{KernelConfig, LoggingConfig, SchedulerConfig};
pub use errors::{KernelError, Result};
