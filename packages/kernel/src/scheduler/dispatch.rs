// packages/kernel/src/scheduler/dispatch.rs
//! Bounded-concurrency pool for wakeup execution
//!
//! Workers hand due entities to this pool so a slow `wakeup()` never stalls
//! the timing loop of the worker that fired it. Tasks travel over a
//! rendezvous channel: `submit` returns once an idle pool thread has taken
//! the task and blocks while every thread is busy.
//!
//! ```text
//! Worker 0 ─┐                     ┌─► kernel-wakeup-0
//! Worker 1 ─┼─► rendezvous chan ──┼─► kernel-wakeup-1
//! Worker 2 ─┘                     └─► kernel-wakeup-N
//! ```

use crate::utils::errors::{KernelError, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Unit of work run by the pool
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Name prefix of pool threads
const THREAD_PREFIX: &str = "kernel-wakeup-";

/// Whether the caller is running on a pool thread, i.e. inside a wakeup
pub fn on_pool_thread() -> bool {
    thread::current()
        .name()
        .is_some_and(|name| name.starts_with(THREAD_PREFIX))
}

/// Fixed-size thread pool with blocking submission
pub struct WakeupPool {
    /// Task channel; `None` once shut down
    sender: Mutex<Option<Sender<Task>>>,

    /// Pool threads
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// Number of pool threads
    size: usize,

    /// Tasks currently executing
    active: Arc<AtomicUsize>,

    /// Tasks finished since start
    completed: Arc<AtomicU64>,
}

impl WakeupPool {
    /// Start `size` pool threads
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(KernelError::ConfigError(
                "wakeup pool needs at least one thread".into(),
            ));
        }

        let (sender, receiver) = crossbeam_channel::bounded::<Task>(0);
        let active = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicU64::new(0));

        let mut threads = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = receiver.clone();
            let active = Arc::clone(&active);
            let completed = Arc::clone(&completed);
            let handle = thread::Builder::new()
                .name(format!("{}{}", THREAD_PREFIX, i))
                .spawn(move || Self::run(receiver, active, completed))?;
            threads.push(handle);
        }

        debug!("Wakeup pool started with {} threads", size);

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
            size,
            active,
            completed,
        })
    }

    fn run(receiver: Receiver<Task>, active: Arc<AtomicUsize>, completed: Arc<AtomicU64>) {
        while let Ok(task) = receiver.recv() {
            active.fetch_add(1, Ordering::Relaxed);
            task();
            active.fetch_sub(1, Ordering::Relaxed);
            completed.fetch_add(1, Ordering::Relaxed);
        }
        trace!("Wakeup pool thread exiting");
    }

    /// Hand `task` to an idle thread, waiting for one if all are busy
    pub fn submit(&self, task: Task) -> Result<()> {
        // Clone out of the lock so shutdown is never blocked behind a submit
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender.send(task).map_err(|_| KernelError::SchedulerShutdown),
            None => Err(KernelError::SchedulerShutdown),
        }
    }

    /// Stop accepting tasks and join the pool threads.
    /// Tasks already taken by a thread run to completion.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);

        let current = thread::current().id();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            // A wakeup may itself trigger shutdown; never join ourselves
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!("Wakeup pool stopped");
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for WakeupPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    #[test]
    fn test_zero_size_rejected() {
        assert!(WakeupPool::new(0).is_err());
    }

    #[test]
    fn test_tasks_run() {
        let pool = WakeupPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.completed(), 10);
    }

    #[test]
    fn test_submit_blocks_while_pool_is_busy() {
        let pool = WakeupPool::new(1).unwrap();
        let release = Arc::new(Barrier::new(2));

        let gate = Arc::clone(&release);
        pool.submit(Box::new(move || {
            gate.wait();
        }))
        .unwrap();

        let started = Instant::now();
        let unblocker = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                release.wait();
            })
        };

        // Only returns once the single thread has finished the first task
        pool.submit(Box::new(|| {})).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));

        unblocker.join().unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_tasks_know_they_run_on_the_pool() {
        let pool = WakeupPool::new(1).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&inside);
        pool.submit(Box::new(move || {
            if on_pool_thread() {
                flag.store(1, Ordering::SeqCst);
            }
        }))
        .unwrap();
        pool.shutdown();

        assert_eq!(inside.load(Ordering::SeqCst), 1);
        assert!(!on_pool_thread());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WakeupPool::new(1).unwrap();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(KernelError::SchedulerShutdown)
        ));
        // Idempotent
        pool.shutdown();
    }
}
