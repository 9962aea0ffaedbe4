// packages/kernel/src/lifecycle/table.rs
//! Static lifecycle state table
//!
//! Each state carries an optional entry command and an ordered list of
//! transition rules. After the command runs, rules are evaluated in order
//! and the first one that yields a state wins. A state without rules never
//! advances on its own.
//!
//! ```text
//! CREATING ──► STOPPED ◄──────────── STOPPING
//!                 │  ╲                   ▲
//!          start()│   ╲destroy()         │stop()
//!                 ▼    ╲                 │
//!             STARTING  ╲──► DESTROYING ──► DESTROYED
//!                 │             ▲
//!                 ▼             │
//!              RUNNING       FAILED ◄── any failing command
//! ```

use crate::lifecycle::state::{Command, State};
use once_cell::sync::Lazy;

/// Facts available to transition rules
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    /// State whose rules are being evaluated
    pub state: State,

    /// State in which the most recent command failure happened
    pub failed_in: Option<State>,
}

/// A transition rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Unconditionally move to the given state
    To(State),

    /// Move to `to` when the last failure happened in `origin`
    FailedIn { origin: State, to: State },
}

impl Transition {
    pub fn evaluate(&self, ctx: &TransitionContext) -> Option<State> {
        match *self {
            Transition::To(state) => Some(state),
            Transition::FailedIn { origin, to } => (ctx.failed_in == Some(origin)).then_some(to),
        }
    }
}

/// Command and rules for one state
#[derive(Debug, Clone, Default)]
pub struct StateEntry {
    pub command: Option<Command>,
    pub transitions: Vec<Transition>,
}

impl StateEntry {
    /// First rule that yields a next state
    pub fn next(&self, ctx: &TransitionContext) -> Option<State> {
        self.transitions.iter().find_map(|t| t.evaluate(ctx))
    }
}

/// Immutable state table shared by every controller using it
#[derive(Debug, Clone)]
pub struct StateTable {
    entries: Vec<StateEntry>,
}

static AGENT_LIFECYCLE: Lazy<StateTable> = Lazy::new(StateTable::build_agent_lifecycle);

impl StateTable {
    /// Table with every state present and inert
    pub fn empty() -> Self {
        Self {
            entries: vec![StateEntry::default(); State::ALL.len()],
        }
    }

    /// Bind a command and ordered rules to a state, replacing what was there
    pub fn with_state(
        mut self,
        state: State,
        command: Option<Command>,
        transitions: impl IntoIterator<Item = Transition>,
    ) -> Self {
        self.entries[state.index()] = StateEntry {
            command,
            transitions: transitions.into_iter().collect(),
        };
        self
    }

    pub fn entry(&self, state: State) -> &StateEntry {
        &self.entries[state.index()]
    }

    /// The standard agent lifecycle, built once per process
    pub fn agent_lifecycle() -> &'static StateTable {
        &AGENT_LIFECYCLE
    }

    fn build_agent_lifecycle() -> StateTable {
        use Transition::{FailedIn, To};

        // STOPPED, RUNNING and DESTROYED keep the inert default entry
        StateTable::empty()
            .with_state(
                State::Creating,
                Some(Command::InitProps),
                [To(State::Stopped)],
            )
            .with_state(State::Starting, Some(Command::Start), [To(State::Running)])
            .with_state(State::Stopping, Some(Command::Stop), [To(State::Stopped)])
            .with_state(
                State::Failed,
                None,
                [
                    FailedIn {
                        origin: State::Destroying,
                        to: State::Destroyed,
                    },
                    To(State::Destroying),
                ],
            )
            .with_state(
                State::Destroying,
                Some(Command::Destroy),
                [To(State::Destroyed)],
            )
    }
}
