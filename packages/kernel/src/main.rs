// packages/kernel/src/main.rs
//! Agent Kernel
//!
//! Runs a kernel with a single heartbeat agent until Ctrl-C, then shuts the
//! agents and the scheduler down in order.

use agent_kernel::lifecycle::{Agent, Entity, Identity, Props};
use agent_kernel::observability::{init_metrics, init_tracing};
use agent_kernel::scheduler::{Interval, Schedulable, Schedule};
use agent_kernel::{Kernel, KernelConfig, KernelContext, VERSION};
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Property holding the heartbeat period
const PERIOD_PROP: &str = "period_ms";

/// Logs a heartbeat on every wakeup
struct HeartbeatAgent {
    identity: Identity,
    this: Weak<HeartbeatAgent>,
    context: Arc<KernelContext>,
    period_ms: AtomicU64,
    beats: AtomicU64,
}

impl HeartbeatAgent {
    fn new(context: &Arc<KernelContext>) -> Arc<Self> {
        Arc::new_cyclic(|this| HeartbeatAgent {
            identity: Identity::new("heartbeat"),
            this: this.clone(),
            context: Arc::clone(context),
            period_ms: AtomicU64::new(0),
            beats: AtomicU64::new(0),
        })
    }
}

impl Entity for HeartbeatAgent {
    fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Agent for HeartbeatAgent {
    fn init_props(&self, props: &Props) -> anyhow::Result<()> {
        props.set_default(PERIOD_PROP, 1000u64);
        let period = props
            .get_u64(PERIOD_PROP)
            .ok_or_else(|| anyhow::anyhow!("{} must be an integer", PERIOD_PROP))?;
        self.period_ms.store(period, Ordering::Relaxed);
        Ok(())
    }

    fn start(&self) -> anyhow::Result<()> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("agent dropped before start"))?;
        if !self.context.scheduler().schedule(this) {
            anyhow::bail!("heartbeat could not be scheduled");
        }
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.context.scheduler().unschedule(self);
        info!(beats = self.beats.load(Ordering::Relaxed), "Heartbeat stopped");
        Ok(())
    }
}

impl Schedulable for HeartbeatAgent {
    fn schedule(&self) -> Option<Arc<dyn Schedule>> {
        let period = Duration::from_millis(self.period_ms.load(Ordering::Relaxed));
        Some(Arc::new(Interval::every(period)))
    }

    fn wakeup(&self) -> anyhow::Result<()> {
        let beat = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        info!(beat, scheduled = self.context.scheduler().size(), "Heartbeat");
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = KernelConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    let metrics = init_metrics()?;

    info!("Starting Agent Kernel v{}", VERSION);
    info!("Configuration loaded: {:?}", config);

    let kernel = Kernel::new(config)?;
    kernel.add(HeartbeatAgent::new(kernel.context()));

    let started = kernel.start_all()?;
    info!(started, "Agents running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, cleaning up...");

    kernel.shutdown()?;
    debug!("Final metrics:\n{}", metrics.render());
    info!("Kernel stopped");
    Ok(())
}
