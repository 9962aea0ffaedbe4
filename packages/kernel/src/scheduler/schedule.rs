// packages/kernel/src/scheduler/schedule.rs
//! Recurrence sources and the schedulable capability
//!
//! A [`Schedule`] only answers one question: given a reference instant, when
//! is the next occurrence? Parsing human-readable recurrence strings happens
//! elsewhere; the kernel ships two concrete rules, [`Interval`] and [`Once`].

use crate::lifecycle::Entity;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Source of future fire instants
pub trait Schedule: Send + Sync {
    /// First occurrence strictly after `reference`, or `None` if the
    /// recurrence never fires again
    fn next_occurrence(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

impl<F> Schedule for F
where
    F: Fn(DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync,
{
    fn next_occurrence(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self(reference)
    }
}

/// Fixed-rate recurrence anchored at a first occurrence.
///
/// Occurrences sit on the grid `first + k * period`, so a late wakeup skips
/// the slots it missed instead of drifting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// First occurrence
    first: DateTime<Utc>,

    /// Grid spacing; zero means `first` is the only occurrence
    period: Duration,

    /// Last instant an occurrence may fall on (inclusive)
    until: Option<DateTime<Utc>>,
}

impl Interval {
    pub fn starting_at(first: DateTime<Utc>, period: Duration) -> Self {
        Self {
            first,
            period,
            until: None,
        }
    }

    /// First occurrence `delay` from now, then every `period`
    pub fn after(delay: Duration, period: Duration) -> Self {
        let first = Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
        Self::starting_at(first, period)
    }

    /// Every `period`, starting one period from now
    pub fn every(period: Duration) -> Self {
        Self::after(period, period)
    }

    /// Stop recurring after `end`
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.until = Some(end);
        self
    }

    pub fn first(&self) -> DateTime<Utc> {
        self.first
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Schedule for Interval {
    fn next_occurrence(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let candidate = if reference < self.first {
            self.first
        } else {
            let period_ns = i64::try_from(self.period.as_nanos()).ok()?;
            if period_ns == 0 {
                return None;
            }
            let elapsed_ns = (reference - self.first).num_nanoseconds()?;
            let steps = elapsed_ns / period_ns + 1;
            let offset = ChronoDuration::nanoseconds(steps.checked_mul(period_ns)?);
            self.first.checked_add_signed(offset)?
        };

        match self.until {
            Some(end) if candidate > end => None,
            _ => Some(candidate),
        }
    }
}

/// A single occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Once(pub DateTime<Utc>);

impl Once {
    pub fn after(delay: Duration) -> Self {
        Once(Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero()))
    }
}

impl Schedule for Once {
    fn next_occurrence(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.0 > reference).then_some(self.0)
    }
}

/// Notified when an entity's schedule changes
pub trait ScheduleChangeListener: Send + Sync {
    fn on_schedule_changed(&self, entity: &dyn Schedulable);
}

/// An entity the scheduler can wake up periodically.
///
/// `wakeup()` is never invoked concurrently with itself for one entity, but
/// a schedule change may arrive while a wakeup is running.
pub trait Schedulable: Entity {
    /// Current recurrence, if any
    fn schedule(&self) -> Option<Arc<dyn Schedule>>;

    /// Called when the entity is due
    fn wakeup(&self) -> anyhow::Result<()>;

    fn add_schedule_change_listener(&self, _listener: Weak<dyn ScheduleChangeListener>) {}

    fn remove_schedule_change_listener(&self, _listener: &Weak<dyn ScheduleChangeListener>) {}
}

/// Listener list an entity can embed to support schedule change notification
#[derive(Default)]
pub struct ScheduleChangeNotifier {
    listeners: Mutex<Vec<Weak<dyn ScheduleChangeListener>>>,
}

impl ScheduleChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Weak<dyn ScheduleChangeListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| Weak::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove(&self, listener: &Weak<dyn ScheduleChangeListener>) {
        self.listeners.lock().retain(|l| !Weak::ptr_eq(l, listener));
    }

    /// Tell every live listener that `entity`'s schedule changed
    pub fn notify(&self, entity: &dyn Schedulable) {
        // Listeners may call back into the entity; don't hold the lock
        let live: Vec<Arc<dyn ScheduleChangeListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.on_schedule_changed(entity);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Next fire instant for `entity` after `now`
pub(crate) fn next_fire_time(entity: &dyn Schedulable, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    entity.schedule()?.next_occurrence(now)
}
