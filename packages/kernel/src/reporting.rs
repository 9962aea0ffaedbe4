// packages/kernel/src/reporting.rs
//! Reporting sink for agent diagnostics
//!
//! Every failure the kernel isolates (hook errors, wakeup errors, panics) is
//! routed through a [`Reporter`]. Reporters never fail.

use crate::lifecycle::Identity;
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Error cause attached to a report
pub type Cause<'a> = Option<&'a (dyn std::error::Error + 'static)>;

/// Severity of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportLevel {
    Debug,
    Println,
    Warning,
    Error,
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportLevel::Debug => "debug",
            ReportLevel::Println => "println",
            ReportLevel::Warning => "warning",
            ReportLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Diagnostic sink shared by the lifecycle engine and the scheduler
pub trait Reporter: Send + Sync {
    fn report(&self, level: ReportLevel, who: &Identity, message: &str, cause: Cause<'_>);

    fn debug(&self, who: &Identity, message: &str) {
        self.report(ReportLevel::Debug, who, message, None);
    }

    fn println(&self, who: &Identity, message: &str) {
        self.report(ReportLevel::Println, who, message, None);
    }

    fn warning(&self, who: &Identity, message: &str, cause: Cause<'_>) {
        self.report(ReportLevel::Warning, who, message, cause);
    }

    fn error(&self, who: &Identity, message: &str, cause: Cause<'_>) {
        self.report(ReportLevel::Error, who, message, cause);
    }
}

/// Forwards reports to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, level: ReportLevel, who: &Identity, message: &str, cause: Cause<'_>) {
        let agent_id = who.id().to_string();
        let agent = who.name();
        let rendered = cause.map(|c| DisplayChain(c).to_string());
        let cause = rendered.as_deref();

        match level {
            ReportLevel::Debug => debug!(%agent_id, agent, cause, "{}", message),
            ReportLevel::Println => info!(%agent_id, agent, cause, "{}", message),
            ReportLevel::Warning => warn!(%agent_id, agent, cause, "{}", message),
            ReportLevel::Error => error!(%agent_id, agent, cause, "{}", message),
        }
    }
}

/// A captured report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub level: ReportLevel,

    /// Name of the reporting agent
    pub agent: String,

    pub message: String,

    /// Rendered cause chain, if any
    pub cause: Option<String>,
}

/// Keeps every report in memory. Used for inspection and in tests.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    records: Mutex<Vec<ReportRecord>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far
    pub fn records(&self) -> Vec<ReportRecord> {
        self.records.lock().clone()
    }

    /// Records at or above `level`
    pub fn at_least(&self, level: ReportLevel) -> Vec<ReportRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level >= level)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, level: ReportLevel, who: &Identity, message: &str, cause: Cause<'_>) {
        self.records.lock().push(ReportRecord {
            level,
            agent: who.name().to_string(),
            message: message.to_string(),
            cause: cause.map(|c| DisplayChain(c).to_string()),
        });
    }
}

/// Renders an error with its `source()` chain, `outer: inner: root`
struct DisplayChain<'a>(&'a (dyn std::error::Error + 'static));

impl fmt::Display for DisplayChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {}", err)?;
            source = err.source();
        }
        Ok(())
    }
}
