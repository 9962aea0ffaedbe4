// packages/kernel/src/lifecycle/controller.rs
//! Lifecycle controller
//!
//! A [`Controller`] owns one agent and drives it through a [`StateTable`].
//! Driving is synchronous: `start()`, `stop()` and `destroy()` block the
//! caller until the target state is reached or the chain dead-ends.
//!
//! Hook failures are isolated. A failing (or panicking) hook sends the agent
//! to `FAILED`, which funnels into `DESTROYED`; the failure is recorded as a
//! [`CommandFailure`] and sent to the reporter, never returned to the caller.
//! Calling an operation from the wrong state returns
//! [`KernelError::IllegalState`] and changes nothing.

use crate::lifecycle::agent::{Agent, Entity, Identity, Props};
use crate::lifecycle::state::{Command, State};
use crate::lifecycle::table::{StateTable, TransitionContext};
use crate::reporting::Reporter;
use crate::utils::errors::{guarded, KernelError, Result};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Property key mirroring the controller's current state
pub const CURRENT_STATE_PROP: &str = "current_state";

/// Property key mirroring the controller's pending state
pub const NEXT_STATE_PROP: &str = "next_state";

/// A lifecycle hook that failed
#[derive(Debug)]
pub struct CommandFailure {
    /// State whose entry command failed
    pub state: State,

    pub command: Command,

    /// Error returned by the hook, or the panic it raised
    pub error: anyhow::Error,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hook failed in state {}", self.command, self.state)
    }
}

impl std::error::Error for CommandFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.error)
    }
}

impl Command {
    fn run<A: Agent + ?Sized>(self, agent: &A, props: &Props) -> anyhow::Result<()> {
        match self {
            Command::InitProps => agent.init_props(props),
            Command::Start => agent.start(),
            Command::Stop => agent.stop(),
            Command::Destroy => agent.destroy(),
        }
    }
}

/// Drives one agent through its lifecycle
pub struct Controller<A: Agent + ?Sized = dyn Agent> {
    agent: Arc<A>,
    table: &'static StateTable,
    props: Props,
    reporter: Arc<dyn Reporter>,
    current_state: State,
    next_state: Option<State>,
    failed_in: Option<State>,
    last_failure: Option<CommandFailure>,
}

impl<A: Agent + ?Sized> Controller<A> {
    /// Take control of `agent` and run its `CREATING` phase
    pub fn new(agent: Arc<A>, reporter: Arc<dyn Reporter>) -> Self {
        Self::with_table(agent, reporter, StateTable::agent_lifecycle())
    }

    /// Like [`Controller::new`] with a custom table
    pub fn with_table(
        agent: Arc<A>,
        reporter: Arc<dyn Reporter>,
        table: &'static StateTable,
    ) -> Self {
        let mut controller = Self {
            agent,
            table,
            props: Props::new(),
            reporter,
            current_state: State::Creating,
            next_state: Some(State::Creating),
            failed_in: None,
            last_failure: None,
        };
        controller.wait_for_state(State::Stopped);
        controller
    }

    /// Drive `STOPPED → STARTING → RUNNING`
    pub fn start(&mut self) -> Result<State> {
        self.require("start", State::Stopped)?;
        self.next_state = Some(State::Starting);
        Ok(self.wait_for_state(State::Running))
    }

    /// Drive `RUNNING → STOPPING → STOPPED`
    pub fn stop(&mut self) -> Result<State> {
        self.require("stop", State::Running)?;
        self.next_state = Some(State::Stopping);
        Ok(self.wait_for_state(State::Stopped))
    }

    /// Drive `STOPPED → DESTROYING → DESTROYED`
    pub fn destroy(&mut self) -> Result<State> {
        self.require("destroy", State::Stopped)?;
        self.next_state = Some(State::Destroying);
        Ok(self.wait_for_state(State::Destroyed))
    }

    pub fn current_state(&self) -> State {
        self.current_state
    }

    pub fn next_state(&self) -> Option<State> {
        self.next_state
    }

    pub fn props(&self) -> &Props {
        &self.props
    }

    pub fn agent(&self) -> &Arc<A> {
        &self.agent
    }

    pub fn identity(&self) -> &Identity {
        self.agent.identity()
    }

    /// Most recent hook failure, if any
    pub fn last_failure(&self) -> Option<&CommandFailure> {
        self.last_failure.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.current_state.is_terminal()
    }

    fn require(&self, operation: &'static str, expected: State) -> Result<()> {
        if self.current_state == expected {
            return Ok(());
        }
        Err(KernelError::IllegalState {
            agent: self.identity().name().to_string(),
            operation,
            expected,
            actual: self.current_state,
        })
    }

    /// Advance until `target` or `DESTROYED` is reached, or no rule fires.
    /// Reaching `target` does not stop the loop if its command just failed.
    fn wait_for_state(&mut self, target: State) -> State {
        while let Some(next) = self.next_state.take() {
            self.enter(next);
            let failed = self.next_state == Some(State::Failed);
            if (self.current_state == target && !failed) || self.current_state.is_terminal() {
                break;
            }
        }
        self.sync_props();
        self.current_state
    }

    /// Enter `state`: run its command, then pick the next state
    fn enter(&mut self, state: State) {
        self.current_state = state;
        self.sync_props();

        trace!(agent = self.identity().name(), %state, "Entering state");
        self.reporter
            .debug(self.agent.identity(), &format!("entering state {}", state));
        metrics::counter!("kernel_lifecycle_transitions_total", "state" => state.as_str())
            .increment(1);

        let table = self.table;
        let entry = table.entry(state);

        if let Some(command) = entry.command {
            let agent = &self.agent;
            let props = &self.props;
            if let Err(error) = guarded(|| command.run(&**agent, props)) {
                self.fail(state, command, error);
                return;
            }
        }

        let ctx = TransitionContext {
            state,
            failed_in: self.failed_in,
        };
        self.next_state = entry.next(&ctx);
    }

    fn fail(&mut self, state: State, command: Command, error: anyhow::Error) {
        let failure = CommandFailure {
            state,
            command,
            error,
        };
        self.reporter
            .error(self.agent.identity(), &failure.to_string(), Some(&failure));
        metrics::counter!("kernel_lifecycle_failures_total", "command" => command.as_str())
            .increment(1);

        self.failed_in = Some(state);
        self.last_failure = Some(failure);
        self.next_state = Some(State::Failed);
    }

    fn sync_props(&self) {
        self.props.set(CURRENT_STATE_PROP, self.current_state.as_str());
        match self.next_state {
            Some(next) => self.props.set(NEXT_STATE_PROP, next.as_str()),
            None => self.props.remove(NEXT_STATE_PROP),
        };
    }
}

impl<A: Agent + ?Sized> fmt::Debug for Controller<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("agent", self.identity())
            .field("current_state", &self.current_state)
            .field("next_state", &self.next_state)
            .finish()
    }
}
