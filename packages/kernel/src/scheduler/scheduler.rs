// packages/kernel/src/scheduler/scheduler.rs
//! Scheduler facade
//!
//! Spreads entities over a fixed set of [`Worker`]s and keeps the sticky
//! assignment index. An entity keeps its worker for as long as it is
//! scheduled; a fresh `schedule()` after it was dropped picks the next
//! worker in round-robin order.
//!
//! ```text
//!                  ┌──────────────────────┐
//! schedule() ────► │ assignments (DashMap) │  entity id → worker
//!                  └──────────┬───────────┘
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!          Worker 0       Worker 1       Worker N     map + heap + thread
//!              └──────────────┼──────────────┘
//!                             ▼
//!                        WakeupPool                   bounded wakeups
//! ```
//!
//! Lock order is always index shard, then worker lock. Workers never touch
//! the index while holding their own lock.

use crate::lifecycle::{Entity, Identity};
use crate::reporting::Reporter;
use crate::scheduler::dispatch::{on_pool_thread, WakeupPool};
use crate::scheduler::schedule::{next_fire_time, Schedulable, ScheduleChangeListener};
use crate::scheduler::worker::{Assignments, Rescheduled, Worker};
use crate::utils::config::SchedulerConfig;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

/// Concurrent timer scheduler
pub struct Scheduler {
    /// Timer workers, one thread each
    workers: Vec<Arc<Worker>>,

    /// Sticky entity → worker index
    assignments: Arc<Assignments>,

    /// Round-robin cursor
    next_worker: AtomicUsize,

    /// Shared wakeup executor
    pool: Arc<WakeupPool>,

    reporter: Arc<dyn Reporter>,

    /// Worker thread handles, drained on shutdown
    threads: Mutex<Vec<JoinHandle<()>>>,

    running: AtomicBool,

    /// Handle to ourselves, registered as change listener on entities
    this: Weak<Scheduler>,
}

impl Scheduler {
    /// Build the pool and workers and start the worker threads
    pub fn new(config: &SchedulerConfig, reporter: Arc<dyn Reporter>) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(WakeupPool::new(config.pool_size)?);
        let assignments = Arc::new(Assignments::new());
        let workers: Vec<Arc<Worker>> = (0..config.workers)
            .map(|id| {
                Arc::new(Worker::new(
                    id,
                    Arc::clone(&pool),
                    Arc::clone(&assignments),
                    Arc::clone(&reporter),
                    config.failure_policy,
                ))
            })
            .collect();

        let scheduler = Arc::new_cyclic(|this| Scheduler {
            workers,
            assignments,
            next_worker: AtomicUsize::new(0),
            pool,
            reporter,
            threads: Mutex::new(Vec::with_capacity(config.workers)),
            running: AtomicBool::new(true),
            this: this.clone(),
        });

        // On error the partially started scheduler is shut down by Drop
        for worker in &scheduler.workers {
            let worker = Arc::clone(worker);
            let handle = thread::Builder::new()
                .name(format!("kernel-sched-{}", worker.id()))
                .spawn(move || worker.run())?;
            scheduler.threads.lock().push(handle);
        }

        info!(
            workers = config.workers,
            pool_size = config.pool_size,
            failure_policy = ?config.failure_policy,
            "Scheduler started"
        );
        Ok(scheduler)
    }

    /// Start waking `entity` according to its schedule.
    ///
    /// Returns `false` when the entity has no next occurrence or the
    /// scheduler is shut down. Scheduling an entity that is already known
    /// changes nothing and returns `true`.
    pub fn schedule(&self, entity: Arc<dyn Schedulable>) -> bool {
        let identity = entity.identity().clone();

        if !self.is_running() {
            self.reporter
                .debug(&identity, "scheduler is shut down, not scheduled");
            return false;
        }

        let Some(fire_at) = next_fire_time(entity.as_ref(), Utc::now()) else {
            self.reporter
                .debug(&identity, "schedule has no next occurrence, not scheduled");
            return false;
        };

        let id = identity.id();
        let (worker, inserted) = {
            let slot = self
                .assignments
                .entry(id)
                .or_insert_with(|| self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len());
            let worker = *slot;
            (worker, self.workers[worker].insert(Arc::clone(&entity), fire_at))
        };

        if !inserted {
            trace!(agent = identity.name(), worker, "Already scheduled");
            return true;
        }

        let listener: Weak<dyn ScheduleChangeListener> = self.this.clone();
        entity.add_schedule_change_listener(listener);

        debug!(
            agent_id = %id,
            agent = identity.name(),
            worker,
            %fire_at,
            "Entity scheduled"
        );
        true
    }

    /// Stop waking `entity`. A wakeup already running is not interrupted.
    /// Returns `false` if the entity was not scheduled.
    pub fn unschedule(&self, entity: &dyn Schedulable) -> bool {
        let identity = entity.identity();
        let id = identity.id();

        let Some(worker) = self.worker_index(&id) else {
            return false;
        };
        let worker = &self.workers[worker];
        if !worker.remove(&id) {
            return false;
        }
        worker.release_assignment(&id);

        let listener: Weak<dyn ScheduleChangeListener> = self.this.clone();
        entity.remove_schedule_change_listener(&listener);

        debug!(agent_id = %id, agent = identity.name(), "Entity unscheduled");
        true
    }

    /// Recompute `entity`'s next deadline from now.
    ///
    /// A waiting entity moves to its new slot, or is dropped if the schedule
    /// is exhausted. A running entity is left alone; its post-wakeup
    /// reschedule reads the new schedule.
    pub fn schedule_changed(&self, entity: &dyn Schedulable) {
        let identity = entity.identity();
        let id = identity.id();
        let Some(worker) = self.worker_index(&id) else {
            return;
        };

        let next = next_fire_time(entity, Utc::now());
        let worker = &self.workers[worker];
        match worker.reschedule(&id, next) {
            Rescheduled::Moved => {
                trace!(agent = identity.name(), worker = worker.id(), "Deadline moved");
            }
            Rescheduled::Dropped => {
                worker.release_assignment(&id);
                self.reporter
                    .debug(identity, "schedule exhausted, entity dropped");
            }
            Rescheduled::Running | Rescheduled::Orphaned | Rescheduled::Unknown => {
                trace!(agent = identity.name(), "Schedule change deferred");
            }
        }
    }

    /// Number of scheduled entities, waiting or running
    pub fn size(&self) -> usize {
        self.workers.iter().map(|w| w.size()).sum()
    }

    /// Scheduled entities per worker
    pub fn worker_sizes(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.size()).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_scheduled<E: Entity + ?Sized>(&self, entity: &E) -> bool {
        let id = entity.identity().id();
        self.worker_index(&id)
            .is_some_and(|worker| self.workers[worker].contains(&id))
    }

    /// Worker the entity is assigned to
    pub fn worker_of<E: Entity + ?Sized>(&self, entity: &E) -> Option<usize> {
        self.worker_index(&entity.identity().id())
    }

    /// Current deadline of a scheduled entity
    pub fn next_fire<E: Entity + ?Sized>(&self, entity: &E) -> Option<DateTime<Utc>> {
        self.with_worker(entity.identity(), |worker, id| worker.fire_at(id))
    }

    /// When the entity's last wakeup was dispatched
    pub fn last_fired<E: Entity + ?Sized>(&self, entity: &E) -> Option<DateTime<Utc>> {
        self.with_worker(entity.identity(), |worker, id| worker.fired_at(id))
    }

    /// Deadlines waiting on one worker, in firing order
    pub fn pending_deadlines(&self, worker: usize) -> Vec<DateTime<Utc>> {
        self.workers
            .get(worker)
            .map(|w| w.pending_deadlines())
            .unwrap_or_default()
    }

    /// Wakeups executing right now
    pub fn active_wakeups(&self) -> usize {
        self.pool.active()
    }

    /// Wakeups finished since start
    pub fn completed_wakeups(&self) -> u64 {
        self.pool.completed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the worker loops, drain the pool and drop every entity.
    ///
    /// Idempotent. Wakeups already taken by the pool run to completion.
    /// Called from inside a wakeup, the worker threads are signalled but not
    /// joined: one of them may be blocked handing a task to this very thread.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for worker in &self.workers {
            worker.shutdown();
        }

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        if on_pool_thread() {
            debug!(workers = threads.len(), "Shutdown from a wakeup, worker threads detached");
        } else {
            let current = thread::current().id();
            for handle in threads {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    warn!("Scheduler worker thread panicked");
                }
            }
        }

        self.pool.shutdown();

        // Entities may hold the scheduler; break the cycle
        let dropped: usize = self.workers.iter().map(|w| w.clear().len()).sum();
        self.assignments.clear();

        info!(dropped, "Scheduler stopped");
    }

    fn worker_index(&self, id: &Ulid) -> Option<usize> {
        self.assignments.get(id).map(|worker| *worker)
    }

    fn with_worker<T>(
        &self,
        identity: &Identity,
        f: impl FnOnce(&Worker, &Ulid) -> Option<T>,
    ) -> Option<T> {
        let id = identity.id();
        let worker = self.worker_index(&id)?;
        f(&self.workers[worker], &id)
    }
}

impl ScheduleChangeListener for Scheduler {
    fn on_schedule_changed(&self, entity: &dyn Schedulable) {
        self.schedule_changed(entity);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::{MemoryReporter, ReportLevel};
    use crate::scheduler::schedule::{Interval, Once, Schedule, ScheduleChangeNotifier};
    use crate::utils::config::WakeupFailurePolicy;
    use std::time::{Duration, Instant};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Slow(Duration),
        SlowFail(Duration),
    }

    struct Ticker {
        identity: Identity,
        schedule: Mutex<Option<Arc<dyn Schedule>>>,
        fired: Mutex<Vec<Instant>>,
        behaviour: Behaviour,
        notifier: ScheduleChangeNotifier,

        /// Wakeups executing right now, and the most ever seen at once
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Ticker {
        fn new(name: &str, schedule: Option<Arc<dyn Schedule>>, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                identity: Identity::new(name),
                schedule: Mutex::new(schedule),
                fired: Mutex::new(Vec::new()),
                behaviour,
                notifier: ScheduleChangeNotifier::new(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn every(name: &str, period: Duration) -> Arc<Self> {
            Self::new(name, Some(Arc::new(Interval::every(period))), Behaviour::Succeed)
        }

        fn count(&self) -> usize {
            self.fired.lock().len()
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn set_schedule(&self, schedule: Option<Arc<dyn Schedule>>) {
            *self.schedule.lock() = schedule;
            self.notifier.notify(self);
        }
    }

    impl Entity for Ticker {
        fn identity(&self) -> &Identity {
            &self.identity
        }
    }

    impl Schedulable for Ticker {
        fn schedule(&self) -> Option<Arc<dyn Schedule>> {
            self.schedule.lock().clone()
        }

        fn wakeup(&self) -> anyhow::Result<()> {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            self.fired.lock().push(Instant::now());

            let result = match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(anyhow::anyhow!("mailbox unreachable")),
                Behaviour::Panic => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    panic!("wakeup exploded");
                }
                Behaviour::Slow(delay) => {
                    thread::sleep(delay);
                    Ok(())
                }
                Behaviour::SlowFail(delay) => {
                    thread::sleep(delay);
                    Err(anyhow::anyhow!("mailbox unreachable"))
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn add_schedule_change_listener(&self, listener: Weak<dyn ScheduleChangeListener>) {
            self.notifier.add(listener);
        }

        fn remove_schedule_change_listener(&self, listener: &Weak<dyn ScheduleChangeListener>) {
            self.notifier.remove(listener);
        }
    }

    fn scheduler(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<MemoryReporter>) {
        let reporter = Arc::new(MemoryReporter::new());
        let scheduler = Scheduler::new(&config, reporter.clone()).unwrap();
        (scheduler, reporter)
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SchedulerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(Scheduler::new(&config, Arc::new(MemoryReporter::new())).is_err());
    }

    #[test]
    fn test_schedule_without_occurrence_is_rejected() {
        let (scheduler, reporter) = scheduler(SchedulerConfig::default());

        let idle = Ticker::new("idle", None, Behaviour::Succeed);
        assert!(!scheduler.schedule(idle.clone()));

        let past = Once(Utc::now() - chrono::Duration::seconds(1));
        let expired = Ticker::new("expired", Some(Arc::new(past)), Behaviour::Succeed);
        assert!(!scheduler.schedule(expired.clone()));

        assert_eq!(scheduler.size(), 0);
        assert!(!scheduler.is_scheduled(&*idle));
        assert_eq!(reporter.at_least(ReportLevel::Debug).len(), 2);
    }

    #[test]
    fn test_round_trip_leaves_size_unchanged() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let tickers: Vec<_> = (0..5)
            .map(|i| Ticker::every(&format!("ticker-{}", i), Duration::from_secs(3600)))
            .collect();

        for ticker in &tickers {
            assert!(scheduler.schedule(ticker.clone()));
        }
        assert_eq!(scheduler.size(), 5);
        assert!(tickers.iter().all(|t| scheduler.is_scheduled(&**t)));

        for ticker in &tickers {
            assert!(scheduler.unschedule(&**ticker));
        }
        assert_eq!(scheduler.size(), 0);
        assert!(!scheduler.unschedule(&*tickers[0]));
        assert!(scheduler.worker_of(&*tickers[0]).is_none());
    }

    #[test]
    fn test_scheduling_known_entity_is_noop() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let ticker = Ticker::every("ticker", Duration::from_secs(3600));

        assert!(scheduler.schedule(ticker.clone()));
        let worker = scheduler.worker_of(&*ticker);
        let deadline = scheduler.next_fire(&*ticker);

        assert!(scheduler.schedule(ticker.clone()));
        assert_eq!(scheduler.size(), 1);
        assert_eq!(scheduler.worker_of(&*ticker), worker);
        assert_eq!(scheduler.next_fire(&*ticker), deadline);
    }

    #[test]
    fn test_assignment_is_round_robin_and_sticky() {
        let (scheduler, _) = scheduler(SchedulerConfig {
            workers: 3,
            ..Default::default()
        });
        let tickers: Vec<_> = (0..6)
            .map(|i| Ticker::every(&format!("ticker-{}", i), Duration::from_secs(3600)))
            .collect();
        for ticker in &tickers {
            scheduler.schedule(ticker.clone());
        }

        assert_eq!(scheduler.worker_sizes(), vec![2, 2, 2]);
        for (i, ticker) in tickers.iter().enumerate() {
            assert_eq!(scheduler.worker_of(&**ticker), Some(i % 3));
        }
    }

    #[test]
    fn test_worker_heap_is_ordered() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(1));
        let base = Utc::now() + chrono::Duration::hours(1);

        for offset in [40, 5, 90, 5, 60, 20, 75, 1] {
            let at = base + chrono::Duration::seconds(offset);
            let ticker = Ticker::new("later", Some(Arc::new(Once(at))), Behaviour::Succeed);
            assert!(scheduler.schedule(ticker));
        }

        let deadlines = scheduler.pending_deadlines(0);
        assert_eq!(deadlines.len(), 8);
        assert!(deadlines.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(deadlines[0], base + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_fires_at_due_times() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(2));
        let start = Instant::now();
        let schedule = Interval::after(millis(50), millis(200));
        let ticker = Ticker::new("timed", Some(Arc::new(schedule)), Behaviour::Succeed);

        assert!(scheduler.schedule(ticker.clone()));
        thread::sleep(millis(520));
        scheduler.shutdown();

        let fired: Vec<u128> = ticker
            .fired
            .lock()
            .iter()
            .map(|t| t.duration_since(start).as_millis())
            .collect();
        assert!(fired.len() >= 3, "fired {:?}", fired);
        for (fired, expected) in fired.iter().zip([50u128, 250, 450]) {
            assert!(
                *fired + 5 >= expected && *fired <= expected + 60,
                "fired at {}ms, expected ~{}ms",
                fired,
                expected
            );
        }
    }

    #[test]
    fn test_relative_rate() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(4));
        let fast = Ticker::every("fast", millis(10));
        let slow = Ticker::every("slow", millis(100));

        scheduler.schedule(fast.clone());
        scheduler.schedule(slow.clone());
        thread::sleep(Duration::from_secs(1));
        scheduler.shutdown();

        let (fast, slow) = (fast.count(), slow.count());
        assert!(slow >= 8, "slow fired {} times", slow);
        let ratio = fast as f64 / slow as f64;
        assert!((7.0..=13.0).contains(&ratio), "fast {} / slow {}", fast, slow);
    }

    #[test]
    fn test_failed_wakeup_orphans_entity() {
        let (scheduler, reporter) = scheduler(SchedulerConfig::single_worker(2));
        let schedule = Interval::every(millis(20));
        let broken = Ticker::new("broken", Some(Arc::new(schedule)), Behaviour::Fail);

        scheduler.schedule(broken.clone());
        thread::sleep(millis(250));

        assert_eq!(broken.count(), 1);
        // Still known to its worker, never fired again
        assert!(scheduler.is_scheduled(&*broken));
        assert_eq!(scheduler.size(), 1);
        assert!(scheduler.last_fired(&*broken).is_some());

        let errors = reporter.at_least(ReportLevel::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "wakeup failed");
        assert_eq!(errors[0].cause.as_deref(), Some("mailbox unreachable"));

        // An explicit reschedule revives it
        assert!(scheduler.unschedule(&*broken));
        assert!(scheduler.schedule(broken.clone()));
        thread::sleep(millis(100));
        assert_eq!(broken.count(), 2);
    }

    #[test]
    fn test_reschedule_policy_keeps_failing_entity() {
        let config =
            SchedulerConfig::single_worker(2).with_failure_policy(WakeupFailurePolicy::Reschedule);
        let (scheduler, reporter) = scheduler(config);
        let schedule = Interval::every(millis(20));
        let broken = Ticker::new("broken", Some(Arc::new(schedule)), Behaviour::Fail);

        scheduler.schedule(broken.clone());
        thread::sleep(millis(250));
        scheduler.shutdown();

        assert!(broken.count() >= 5, "fired {} times", broken.count());
        assert_eq!(reporter.at_least(ReportLevel::Error).len(), broken.count());
    }

    #[test]
    fn test_panicking_wakeup_is_isolated() {
        let (scheduler, reporter) = scheduler(SchedulerConfig::single_worker(1));
        let panicky = Ticker::new(
            "panicky",
            Some(Arc::new(Interval::every(millis(20)))),
            Behaviour::Panic,
        );
        let healthy = Ticker::every("healthy", millis(20));

        scheduler.schedule(panicky.clone());
        scheduler.schedule(healthy.clone());
        thread::sleep(millis(250));
        scheduler.shutdown();

        assert_eq!(panicky.count(), 1);
        // The only pool thread survived the panic
        assert!(healthy.count() >= 5);

        let errors = reporter.at_least(ReportLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].cause.as_deref().unwrap().contains("wakeup exploded"));
    }

    #[test]
    fn test_exhausted_schedule_is_dropped() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let once = Ticker::new("once", Some(Arc::new(Once::after(millis(20)))), Behaviour::Succeed);

        assert!(scheduler.schedule(once.clone()));
        thread::sleep(millis(150));

        assert_eq!(once.count(), 1);
        assert_eq!(scheduler.size(), 0);
        assert!(!scheduler.is_scheduled(&*once));
        assert!(scheduler.worker_of(&*once).is_none());
    }

    #[test]
    fn test_unschedule_while_running() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(2));
        let schedule = Interval::after(millis(10), millis(10));
        let slow = Ticker::new("slow", Some(Arc::new(schedule)), Behaviour::Slow(millis(150)));

        scheduler.schedule(slow.clone());
        thread::sleep(millis(60));
        assert_eq!(scheduler.active_wakeups(), 1);

        assert!(scheduler.unschedule(&*slow));
        assert_eq!(scheduler.size(), 0);

        thread::sleep(millis(250));
        assert_eq!(slow.count(), 1);
        assert_eq!(slow.max_in_flight(), 1);
        assert_eq!(scheduler.size(), 0);
        assert!(!scheduler.is_scheduled(&*slow));
        assert!(scheduler.worker_of(&*slow).is_none());
    }

    #[test]
    fn test_reschedule_while_running_never_overlaps() {
        let (scheduler, _) = scheduler(SchedulerConfig {
            workers: 2,
            pool_size: 4,
            ..Default::default()
        });
        let schedule = Interval::after(millis(10), millis(10));
        let slow = Ticker::new("slow", Some(Arc::new(schedule)), Behaviour::Slow(millis(150)));

        assert!(scheduler.schedule(slow.clone()));
        let worker = scheduler.worker_of(&*slow).unwrap();
        thread::sleep(millis(40));

        assert!(scheduler.unschedule(&*slow));
        assert!(scheduler.schedule(slow.clone()));

        // Registered again, but held off the heap until the wakeup returns
        assert_eq!(scheduler.size(), 1);
        assert_eq!(scheduler.worker_of(&*slow), Some(worker));
        assert!(scheduler.pending_deadlines(worker).is_empty());

        thread::sleep(millis(400));
        scheduler.shutdown();

        assert!(slow.count() >= 2, "fired {} times", slow.count());
        assert_eq!(slow.max_in_flight(), 1, "wakeup ran concurrently with itself");
    }

    #[test]
    fn test_registration_during_failed_wakeup_is_kept() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(4));
        let schedule = Interval::after(millis(10), millis(20));
        let broken = Ticker::new("broken", Some(Arc::new(schedule)), Behaviour::SlowFail(millis(100)));

        scheduler.schedule(broken.clone());
        thread::sleep(millis(40));
        scheduler.unschedule(&*broken);
        scheduler.schedule(broken.clone());

        // The new registration fires once the failed wakeup returns, then
        // its own failure orphans it
        thread::sleep(millis(350));
        assert_eq!(broken.count(), 2);
        assert_eq!(broken.max_in_flight(), 1);
        assert!(scheduler.is_scheduled(&*broken));
        assert!(scheduler.pending_deadlines(0).is_empty());
    }

    #[test]
    fn test_schedule_change_moves_deadline() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(2));
        let ticker = Ticker::every("ticker", Duration::from_secs(3600));

        scheduler.schedule(ticker.clone());
        assert_eq!(ticker.notifier.len(), 1);

        ticker.set_schedule(Some(Arc::new(Once::after(millis(30)))));
        let moved = scheduler.next_fire(&*ticker).unwrap();
        assert!(moved < Utc::now() + chrono::Duration::seconds(1));

        thread::sleep(millis(150));
        assert_eq!(ticker.count(), 1);
        // The one-shot schedule is exhausted after firing
        assert_eq!(scheduler.size(), 0);
    }

    #[test]
    fn test_schedule_change_to_nothing_drops_entity() {
        let (scheduler, reporter) = scheduler(SchedulerConfig::default());
        let ticker = Ticker::every("ticker", Duration::from_secs(3600));

        scheduler.schedule(ticker.clone());
        ticker.set_schedule(None);

        assert_eq!(scheduler.size(), 0);
        assert!(scheduler.worker_of(&*ticker).is_none());
        assert!(reporter
            .records()
            .iter()
            .any(|r| r.message == "schedule exhausted, entity dropped"));
    }

    #[test]
    fn test_schedule_change_during_wakeup_applies_after() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(2));
        let schedule = Interval::after(millis(10), Duration::from_secs(3600));
        let slow = Ticker::new("slow", Some(Arc::new(schedule)), Behaviour::Slow(millis(100)));

        scheduler.schedule(slow.clone());
        thread::sleep(millis(40));

        // Running: the change is picked up by the post-wakeup reschedule
        slow.set_schedule(Some(Arc::new(Interval::every(millis(20)))));
        thread::sleep(millis(300));
        scheduler.shutdown();

        assert!(slow.count() >= 2, "fired {} times", slow.count());
    }

    #[test]
    fn test_unschedule_removes_listener() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let ticker = Ticker::every("ticker", Duration::from_secs(3600));

        scheduler.schedule(ticker.clone());
        assert_eq!(ticker.notifier.len(), 1);
        scheduler.unschedule(&*ticker);
        assert!(ticker.notifier.is_empty());
    }

    /// Shuts the scheduler down from inside its own wakeup
    struct Stopper {
        identity: Identity,
        scheduler: Mutex<Weak<Scheduler>>,
        returned: AtomicBool,
    }

    impl Entity for Stopper {
        fn identity(&self) -> &Identity {
            &self.identity
        }
    }

    impl Schedulable for Stopper {
        fn schedule(&self) -> Option<Arc<dyn Schedule>> {
            Some(Arc::new(Once::after(millis(10))))
        }

        fn wakeup(&self) -> anyhow::Result<()> {
            // Give the worker time to block handing over the next wakeup
            thread::sleep(millis(60));
            if let Some(scheduler) = self.scheduler.lock().upgrade() {
                scheduler.shutdown();
            }
            self.returned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_shutdown_from_inside_a_wakeup() {
        let (scheduler, _) = scheduler(SchedulerConfig::single_worker(1));
        let stopper = Arc::new(Stopper {
            identity: Identity::new("stopper"),
            scheduler: Mutex::new(Arc::downgrade(&scheduler)),
            returned: AtomicBool::new(false),
        });
        let next = Ticker::new("next", Some(Arc::new(Once::after(millis(20)))), Behaviour::Succeed);

        scheduler.schedule(stopper.clone());
        scheduler.schedule(next.clone());
        thread::sleep(millis(300));

        assert!(stopper.returned.load(Ordering::SeqCst));
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.size(), 0);
        // The wakeup the worker was handing over still ran
        assert_eq!(next.count(), 1);
    }

    #[test]
    fn test_shutdown_stops_firing() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let ticker = Ticker::every("ticker", millis(10));

        scheduler.schedule(ticker.clone());
        thread::sleep(millis(60));
        scheduler.shutdown();

        let count = ticker.count();
        assert!(count >= 1);
        assert_eq!(scheduler.size(), 0);
        assert!(!scheduler.is_running());

        thread::sleep(millis(60));
        assert_eq!(ticker.count(), count);
        assert!(!scheduler.schedule(ticker.clone()));

        // Idempotent
        scheduler.shutdown();
    }
}
