// packages/kernel/src/lifecycle/state.rs
//! Lifecycle states and the hook commands bound to them

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Creating,
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Destroying,
    Destroyed,
}

impl State {
    /// Every state, in table order
    pub const ALL: [State; 8] = [
        State::Creating,
        State::Stopped,
        State::Starting,
        State::Running,
        State::Stopping,
        State::Failed,
        State::Destroying,
        State::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Creating => "CREATING",
            State::Stopped => "STOPPED",
            State::Starting => "STARTING",
            State::Running => "RUNNING",
            State::Stopping => "STOPPING",
            State::Failed => "FAILED",
            State::Destroying => "DESTROYING",
            State::Destroyed => "DESTROYED",
        }
    }

    /// Parse the name written into an agent's props
    pub fn from_name(name: &str) -> Option<State> {
        State::ALL.iter().copied().find(|s| s.as_str() == name)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Destroyed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent hook executed on entry to a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    InitProps,
    Start,
    Stop,
    Destroy,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::InitProps => "init_props",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
