// packages/kernel/src/kernel.rs
//! Kernel: explicit context plus a registry of controlled agents
//!
//! [`KernelContext`] bundles what agents need from their environment (the
//! configuration, the reporter and the scheduler) and is handed to them
//! explicitly at construction. [`Kernel`] owns one [`Controller`] per agent
//! and drives them in bulk.
//!
//! ```text
//! Kernel
//!   ├── KernelContext { config, reporter, scheduler }
//!   └── controllers: [Controller<dyn Agent>; N]   (registration order)
//! ```

use crate::lifecycle::{Agent, Controller, Identity, State};
use crate::reporting::{Reporter, TracingReporter};
use crate::scheduler::Scheduler;
use crate::utils::config::KernelConfig;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared environment of every agent in one kernel
pub struct KernelContext {
    config: KernelConfig,
    reporter: Arc<dyn Reporter>,
    scheduler: Arc<Scheduler>,
}

impl KernelContext {
    pub fn new(config: KernelConfig, reporter: Arc<dyn Reporter>) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(&config.scheduler, Arc::clone(&reporter))?;
        Ok(Self {
            config,
            reporter,
            scheduler,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

/// Owns the controllers of a set of agents
pub struct Kernel {
    context: Arc<KernelContext>,
    controllers: Mutex<Vec<Controller>>,
}

impl Kernel {
    /// Kernel reporting through `tracing`
    pub fn new(config: KernelConfig) -> Result<Self> {
        Self::with_reporter(config, Arc::new(TracingReporter))
    }

    pub fn with_reporter(config: KernelConfig, reporter: Arc<dyn Reporter>) -> Result<Self> {
        let context = Arc::new(KernelContext::new(config, reporter)?);
        Ok(Self {
            context,
            controllers: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Arc<KernelContext> {
        &self.context
    }

    /// Take control of `agent`. Runs its `CREATING` phase, leaving it
    /// `STOPPED` (or `DESTROYED` if property initialisation failed).
    pub fn add(&self, agent: Arc<dyn Agent>) -> Identity {
        let controller = Controller::new(agent, Arc::clone(&self.context.reporter));
        let identity = controller.identity().clone();
        debug!(agent = identity.name(), state = %controller.current_state(), "Agent added");
        self.controllers.lock().push(controller);
        identity
    }

    /// Start every stopped agent in registration order.
    /// Returns how many reached `RUNNING`.
    pub fn start_all(&self) -> Result<usize> {
        let mut started = 0;
        for controller in self.controllers.lock().iter_mut() {
            if controller.current_state() != State::Stopped {
                continue;
            }
            if controller.start()? == State::Running {
                started += 1;
            }
        }
        info!(started, "Agents started");
        Ok(started)
    }

    /// Stop every running agent in reverse registration order.
    /// Returns how many reached `STOPPED`.
    pub fn stop_all(&self) -> Result<usize> {
        let mut stopped = 0;
        for controller in self.controllers.lock().iter_mut().rev() {
            if controller.current_state() != State::Running {
                continue;
            }
            if controller.stop()? == State::Stopped {
                stopped += 1;
            }
        }
        info!(stopped, "Agents stopped");
        Ok(stopped)
    }

    /// Stop and destroy every agent, then stop the scheduler. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.stop_all()?;

        let mut destroyed = 0;
        for controller in self.controllers.lock().iter_mut().rev() {
            if controller.current_state() == State::Stopped {
                controller.destroy()?;
                destroyed += 1;
            }
        }

        self.context.scheduler.shutdown();
        info!(destroyed, "Kernel shut down");
        Ok(())
    }

    /// Current state of every agent, in registration order
    pub fn states(&self) -> Vec<(Identity, State)> {
        self.controllers
            .lock()
            .iter()
            .map(|c| (c.identity().clone(), c.current_state()))
            .collect()
    }

    pub fn state_of(&self, identity: &Identity) -> Option<State> {
        self.controllers
            .lock()
            .iter()
            .find(|c| c.identity().id() == identity.id())
            .map(|c| c.current_state())
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        // Agents holding the context keep the scheduler alive otherwise
        let _ = self.shutdown();
    }
}
