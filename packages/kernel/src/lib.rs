// packages/kernel/src/lib.rs
//! Agent Kernel Library
//!
//! Two engines for long-lived, independently managed agents:
//!
//! - **lifecycle**: Table-driven state machine driving each agent through
//!   creation, start, stop and destruction with failure isolation
//! - **scheduler**: Concurrent timer scheduler that wakes entities when
//!   their recurrence schedule comes due
//!
//! Supporting modules:
//!
//! - **kernel**: Explicit context shared by agents, and bulk control
//! - **reporting**: Diagnostic sink for isolated failures
//! - **observability**: Tracing subscriber and metrics recorder setup
//! - **utils**: Configuration and error types

pub mod kernel;
pub mod lifecycle;
pub mod observability;
pub mod reporting;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use kernel::{Kernel, KernelContext};
pub use lifecycle::{Agent, Controller, Entity, Identity, Props, State};
pub use reporting::{MemoryReporter, Reporter, TracingReporter};
pub use scheduler::{Interval, Once, Schedulable, Schedule, Scheduler};
pub use utils::config::{KernelConfig, WakeupFailurePolicy};
pub use utils::errors::{KernelError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel build information
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: VERSION,
        }
    }
}
