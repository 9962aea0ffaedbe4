// packages/kernel/src/scheduler/worker.rs
//! Scheduler worker: one timer heap, one thread
//!
//! Each worker owns a map of the entities assigned to it and a min-heap of
//! the ones currently waiting. A node is in exactly one of these states:
//!
//! ```text
//! waiting  ─ in map and heap
//! running  ─ in map only; its wakeup is on the pool
//! orphaned ─ in map only; its last wakeup failed (orphan policy)
//! absent   ─ in neither
//! ```
//!
//! Every registration gets a fresh generation number. The worker remembers
//! which generation each in-flight wakeup belongs to, so an entity that is
//! unscheduled and scheduled again while its wakeup runs is held back until
//! that wakeup completes. An entity never has two wakeups outstanding.
//!
//! The worker thread sleeps on a condition variable until the head of the
//! heap is due, pops it and hands the wakeup to the shared pool. Completion
//! puts the node back on the heap (or drops it when the schedule is
//! exhausted).

use crate::lifecycle::Entity;
use crate::reporting::Reporter;
use crate::scheduler::dispatch::WakeupPool;
use crate::scheduler::heap::TimerHeap;
use crate::scheduler::schedule::{next_fire_time, Schedulable};
use crate::utils::config::WakeupFailurePolicy;
use crate::utils::errors::guarded;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use ulid::Ulid;

/// Sticky entity → worker assignment shared by all workers
pub(crate) type Assignments = DashMap<Ulid, usize>;

/// A scheduled entity and its timing
pub(crate) struct Node {
    pub entity: Arc<dyn Schedulable>,

    /// Next due instant
    pub fire_at: DateTime<Utc>,

    /// When the last wakeup was dispatched
    pub fired_at: Option<DateTime<Utc>>,

    /// Registration this node belongs to
    pub generation: u64,
}

#[derive(Default)]
struct WorkerState {
    nodes: HashMap<Ulid, Node>,
    heap: TimerHeap,

    /// Entities with a wakeup on the pool, and the generation it fired for
    running: HashMap<Ulid, u64>,

    next_generation: u64,
    shutdown: bool,
}

/// Result of moving a node to a new deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rescheduled {
    /// Reinserted at its new position
    Moved,

    /// No further occurrence; removed
    Dropped,

    /// Wakeup in flight; left alone
    Running,

    /// Last wakeup failed and the entity is not waiting; left alone
    Orphaned,

    /// Not assigned to this worker
    Unknown,
}

pub(crate) struct Worker {
    id: usize,
    state: Mutex<WorkerState>,
    wakeup: Condvar,
    pool: Arc<WakeupPool>,
    assignments: Arc<Assignments>,
    reporter: Arc<dyn Reporter>,
    failure_policy: WakeupFailurePolicy,
}

impl Worker {
    pub fn new(
        id: usize,
        pool: Arc<WakeupPool>,
        assignments: Arc<Assignments>,
        reporter: Arc<dyn Reporter>,
        failure_policy: WakeupFailurePolicy,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(WorkerState::default()),
            wakeup: Condvar::new(),
            pool,
            assignments,
            reporter,
            failure_policy,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Add a waiting node. Returns `false` if the entity is already known.
    ///
    /// If a wakeup of a previous registration is still running, the node is
    /// recorded but only enters the heap once that wakeup completes.
    pub fn insert(&self, entity: Arc<dyn Schedulable>, fire_at: DateTime<Utc>) -> bool {
        let id = entity.identity().id();
        let mut state = self.state.lock();
        if state.nodes.contains_key(&id) {
            return false;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.nodes.insert(
            id,
            Node {
                entity,
                fire_at,
                fired_at: None,
                generation,
            },
        );

        if state.running.contains_key(&id) {
            trace!(worker = self.id, %id, "Held back until the running wakeup completes");
        } else if state.heap.push(id, fire_at) {
            self.wakeup.notify_one();
        }
        self.record_size(&state);
        true
    }

    /// Forget the entity. A running wakeup is not interrupted; it will find
    /// the node gone and drop it.
    pub fn remove(&self, id: &Ulid) -> bool {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.remove(id) else {
            return false;
        };
        // Absent from the heap when running; still a success
        if state.heap.remove(id).is_some() {
            self.wakeup.notify_one();
        }
        self.record_size(&state);

        // The entity may own the last handle to the scheduler
        drop(state);
        drop(node);
        true
    }

    /// Move a waiting node to `fire_at`, or drop it when `None`
    pub fn reschedule(&self, id: &Ulid, fire_at: Option<DateTime<Utc>>) -> Rescheduled {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(id) {
            return Rescheduled::Unknown;
        }
        if state.running.contains_key(id) {
            return Rescheduled::Running;
        }
        if !state.heap.contains(id) {
            return Rescheduled::Orphaned;
        }

        match fire_at {
            Some(fire_at) => {
                if let Some(node) = state.nodes.get_mut(id) {
                    node.fire_at = fire_at;
                }
                // Wake the loop either way: the old head may have moved later
                state.heap.push(*id, fire_at);
                self.wakeup.notify_one();
                Rescheduled::Moved
            }
            None => {
                state.heap.remove(id);
                state.nodes.remove(id);
                self.record_size(&state);
                self.wakeup.notify_one();
                Rescheduled::Dropped
            }
        }
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.state.lock().nodes.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn fire_at(&self, id: &Ulid) -> Option<DateTime<Utc>> {
        self.state.lock().nodes.get(id).map(|n| n.fire_at)
    }

    pub fn fired_at(&self, id: &Ulid) -> Option<DateTime<Utc>> {
        self.state.lock().nodes.get(id).and_then(|n| n.fired_at)
    }

    /// Deadlines of waiting nodes in the order they would fire
    pub fn pending_deadlines(&self) -> Vec<DateTime<Utc>> {
        let mut heap = self.state.lock().heap.clone();
        std::iter::from_fn(|| heap.pop().map(|e| e.fire_at)).collect()
    }

    /// Timer loop; returns after [`Worker::shutdown`]
    pub fn run(self: Arc<Self>) {
        debug!(worker = self.id, "Scheduler worker started");
        let mut state = self.state.lock();

        loop {
            if state.shutdown {
                break;
            }

            let Some(head) = state.heap.peek().copied() else {
                self.wakeup.wait(&mut state);
                continue;
            };

            let now = Utc::now();
            if head.fire_at > now {
                let delay = (head.fire_at - now).to_std().unwrap_or_default();
                // Timed out or notified, re-check either way
                self.wakeup.wait_for(&mut state, delay);
                continue;
            }

            state.heap.pop();
            let (entity, generation) = {
                let Some(node) = state.nodes.get_mut(&head.id) else {
                    continue;
                };
                node.fired_at = Some(now);
                (Arc::clone(&node.entity), node.generation)
            };
            state.running.insert(head.id, generation);

            trace!(worker = self.id, agent = entity.identity().name(), "Dispatching wakeup");
            let worker = Arc::clone(&self);
            let submitted = MutexGuard::unlocked(&mut state, || {
                self.pool
                    .submit(Box::new(move || worker.run_wakeup(entity, generation)))
            });
            if submitted.is_err() {
                // Pool already shut down; the kernel is stopping
                break;
            }
        }

        debug!(worker = self.id, "Scheduler worker stopped");
    }

    /// Runs on a pool thread
    fn run_wakeup(&self, entity: Arc<dyn Schedulable>, generation: u64) {
        let worker = self.id.to_string();
        metrics::counter!("kernel_wakeups_total", "worker" => worker.clone()).increment(1);

        match guarded(|| entity.wakeup()) {
            Ok(()) => self.wakeup_finished(entity.as_ref(), generation, true),
            Err(error) => {
                metrics::counter!("kernel_wakeup_failures_total", "worker" => worker).increment(1);
                self.reporter
                    .error(entity.identity(), "wakeup failed", Some(&*error));

                let reschedule = match self.failure_policy {
                    WakeupFailurePolicy::Orphan => {
                        warn!(
                            worker = self.id,
                            agent = entity.identity().name(),
                            "Entity will not be woken again until rescheduled"
                        );
                        false
                    }
                    WakeupFailurePolicy::Reschedule => true,
                };
                self.wakeup_finished(entity.as_ref(), generation, reschedule);
            }
        }
    }

    /// Clear the running mark of `generation`'s wakeup, then put the node
    /// back on the heap or drop it.
    ///
    /// `reschedule` is `false` for a failed wakeup under the orphan policy;
    /// that leaves the node orphaned unless it was registered again while
    /// the wakeup ran.
    pub fn wakeup_finished(&self, entity: &dyn Schedulable, generation: u64, reschedule: bool) {
        let id = entity.identity().id();
        let next = next_fire_time(entity, Utc::now());

        let dropped = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.running.remove(&id);

            if !state.nodes.contains_key(&id) {
                // Unscheduled while running; the assignment was kept for us
                trace!(worker = self.id, agent = entity.identity().name(), "Dropping unscheduled entity");
                drop(guard);
                self.release_assignment(&id);
                return;
            }
            let Some(node) = state.nodes.get_mut(&id) else {
                return;
            };
            if node.generation == generation && !reschedule {
                return;
            }

            match next {
                Some(fire_at) => {
                    node.fire_at = fire_at;
                    if state.heap.push(id, fire_at) {
                        self.wakeup.notify_one();
                    }
                    false
                }
                None => {
                    state.nodes.remove(&id);
                    self.record_size(state);
                    true
                }
            }
        };

        if dropped {
            self.reporter
                .debug(entity.identity(), "schedule exhausted, entity dropped");
            self.release_assignment(&id);
        }
    }

    /// Remove the sticky assignment unless the entity came back meanwhile
    /// or still has a wakeup running here. Must not be called with the
    /// worker lock held.
    pub fn release_assignment(&self, id: &Ulid) {
        self.assignments
            .remove_if(id, |_, worker| *worker == self.id && !self.holds(id));
    }

    /// Known here, or has a wakeup on the pool
    fn holds(&self, id: &Ulid) -> bool {
        let state = self.state.lock();
        state.nodes.contains_key(id) || state.running.contains_key(id)
    }

    /// Stop the loop
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.wakeup.notify_all();
    }

    /// Drop all nodes. Breaks reference cycles between entities that hold
    /// the scheduler and the scheduler's own maps.
    pub fn clear(&self) -> Vec<Ulid> {
        let nodes = {
            let mut state = self.state.lock();
            state.heap.clear();
            state.running.clear();
            let nodes = std::mem::take(&mut state.nodes);
            self.record_size(&state);
            nodes
        };
        nodes.into_keys().collect()
    }

    fn record_size(&self, state: &WorkerState) {
        metrics::gauge!("kernel_scheduled_entities", "worker" => self.id.to_string())
            .set(state.nodes.len() as f64);
    }
}
