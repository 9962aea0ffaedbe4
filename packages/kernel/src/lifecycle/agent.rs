// packages/kernel/src/lifecycle/agent.rs
//! Agent capability, identity and property bag

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;

/// Stable identity of a managed entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    id: Ulid,
    name: String,
}

impl Identity {
    /// Create an identity with a fresh id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            name: name.into(),
        }
    }

    pub fn with_id(id: Ulid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Anything the kernel manages: agents and schedulable entities alike
pub trait Entity: Send + Sync {
    fn identity(&self) -> &Identity;
}

/// A component driven through the lifecycle by a [`Controller`].
///
/// Hooks take `&self`: an agent is shared with the scheduler while it runs,
/// so mutable state lives behind the agent's own locks. A hook that returns
/// `Err` or panics sends the agent to `FAILED` and from there to `DESTROYED`.
///
/// [`Controller`]: crate::lifecycle::Controller
pub trait Agent: Entity {
    /// Seed the agent's properties. Runs once, in `CREATING`.
    fn init_props(&self, _props: &Props) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Key-value property bag attached to every controlled agent
#[derive(Debug, Default)]
pub struct Props {
    values: RwLock<BTreeMap<String, Value>>,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.read().get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.read().get(key).and_then(Value::as_bool)
    }

    /// Set a property, returning the previous value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.write().insert(key.into(), value.into())
    }

    /// Set a property unless it is already present
    pub fn set_default(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values
            .write()
            .entry(key.into())
            .or_insert_with(|| value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// Copy of every property, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values.read().clone()
    }
}
