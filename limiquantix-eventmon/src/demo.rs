//! Demo workload for development mode.
//!
//! Drives the mock host's domains through a fixed lifecycle so that the
//! monitor has events to report without a real hypervisor.

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use limiquantix_connect::{MockHost, Result};

use crate::config::DevConfig;

/// One step of the demo cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    Suspend,
    Resume,
    Reboot,
    Shutdown,
    Restart,
    Crash,
}

const CYCLE: [Step; 7] = [
    Step::Start,
    Step::Suspend,
    Step::Resume,
    Step::Reboot,
    Step::Shutdown,
    Step::Restart,
    Step::Crash,
];

fn apply(host: &MockHost, name: &str, step: Step) -> Result<()> {
    match step {
        Step::Start | Step::Restart => host.start_domain(name),
        Step::Suspend => host.suspend_domain(name),
        Step::Resume => host.resume_domain(name),
        Step::Reboot => host.reboot_domain(name),
        Step::Shutdown => host.shutdown_domain(name),
        Step::Crash => host.crash_domain(name),
    }
    .map(|_| ())
}

/// Define the demo domains. Names that already exist are kept.
pub fn define_domains(host: &MockHost, config: &DevConfig) {
    for name in &config.domains {
        match host.define_domain(name) {
            Ok(domain) => info!(domain = %name, uuid = %domain.uuid, "Demo domain defined"),
            Err(e) => debug!(domain = %name, error = %e, "Demo domain not defined"),
        }
    }
}

/// Spawn the workload; each tick advances one domain by one step.
pub fn spawn(host: MockHost, config: DevConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        if config.domains.is_empty() {
            warn!("No demo domains configured, demo workload idle");
            return;
        }

        info!(
            domains = config.domains.len(),
            step_interval_ms = config.step_interval_ms,
            "Starting demo workload"
        );
        let mut timer = interval(config.step_interval());
        let mut tick: usize = 0;

        loop {
            timer.tick().await;
            let name = &config.domains[tick % config.domains.len()];
            let step = CYCLE[(tick / config.domains.len()) % CYCLE.len()];
            if let Err(e) = apply(&host, name, step) {
                warn!(domain = %name, step = ?step, error = %e, "Demo step failed");
            }
            tick = tick.wrapping_add(1);
        }
    })
}
