// packages/kernel/src/scheduler/mod.rs
//! Concurrent timer scheduler
//!
//! - **Schedule**: Recurrence rules and the schedulable capability
//! - **Heap**: Indexed min-heap with arbitrary removal
//! - **Worker**: Per-worker timer loop over a map and a heap
//! - **Dispatch**: Bounded pool that runs wakeups
//! - **Scheduler**: Facade with sticky round-robin assignment
//!
//! # Flow
//!
//! ```text
//! schedule(e) → worker map + heap → due → pool → wakeup()
//!                    ▲                              │
//!                    └──── next occurrence ◄────────┘
//! ```
//!
//! Within one worker, due entities are dispatched in deadline order (ties in
//! insertion order). There is no ordering across workers.

pub mod dispatch;
pub mod heap;
pub mod schedule;
#[allow(clippy::module_inception)]
pub mod scheduler;
mod worker;

pub use crate::utils::config::WakeupFailurePolicy;
pub use dispatch::WakeupPool;
pub use heap::{HeapEntry, TimerHeap};
pub use schedule::{Interval, Once, Schedulable, Schedule, ScheduleChangeListener, ScheduleChangeNotifier};
pub use scheduler::Scheduler;
