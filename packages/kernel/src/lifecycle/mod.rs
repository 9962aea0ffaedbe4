// packages/kernel/src/lifecycle/mod.rs
//! Agent lifecycle engine
//!
//! - **State**: Lifecycle states and the hook commands bound to them
//! - **Table**: The shared, immutable state table
//! - **Controller**: Synchronous driver for one agent
//! - **Agent**: Capability trait, identity and property bag
//!
//! # Lifecycle
//!
//! ```text
//! CREATING → STOPPED → STARTING → RUNNING → STOPPING → STOPPED
//!                   ╲
//!                    DESTROYING → DESTROYED
//!
//! any failing hook → FAILED → DESTROYING → DESTROYED
//! ```

pub mod agent;
pub mod controller;
pub mod state;
pub mod table;

pub use agent::{Agent, Entity, Identity, Props};
pub use controller::{CommandFailure, Controller, CURRENT_STATE_PROP, NEXT_STATE_PROP};
pub use state::{Command, State};
pub use table::{StateEntry, StateTable, Transition, TransitionContext};
