//! Libvirt driver and session.

use std::collections::HashMap;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use virt::connect::Connect;
use virt::sys;

use super::poller::{self, Subscriptions};
use crate::driver::{HypervisorDriver, HypervisorSession, NotificationSink};
use crate::error::{ConnectError, Result};
use crate::event::EventId;
use crate::types::*;
use crate::uri::ConnectUri;

/// Default interval between domain state polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Opens sessions to libvirtd.
///
/// Lifecycle events are synthesized by polling domain states; other event
/// kinds are not available through this driver.
#[derive(Debug, Clone)]
pub struct LibvirtDriver {
    poll_interval: Duration,
}

impl LibvirtDriver {
    pub fn new() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Default for LibvirtDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorDriver for LibvirtDriver {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    #[instrument(skip(self, sink), fields(uri = %uri))]
    async fn connect(
        &self,
        uri: &ConnectUri,
        sink: NotificationSink,
        read_only: bool,
    ) -> Result<Arc<dyn HypervisorSession>> {
        info!(read_only, "Connecting to libvirt");

        let connection = if read_only {
            Connect::open_read_only(Some(uri.as_str()))
        } else {
            Connect::open(Some(uri.as_str()))
        }
        .map_err(|e| ConnectError::ConnectionFailed(e.to_string()))?;

        let connection = Arc::new(connection);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let poller = poller::spawn(
            connection.clone(),
            sink,
            subscriptions.clone(),
            self.poll_interval,
        );

        info!("Connected to libvirt");

        Ok(Arc::new(LibvirtSession {
            uri: uri.as_str().to_string(),
            connection,
            subscriptions,
            next_token: AtomicU64::new(1),
            poller: Mutex::new(Some(poller)),
        }))
    }
}

/// One open libvirt connection.
pub struct LibvirtSession {
    uri: String,
    connection: Arc<Connect>,
    subscriptions: Subscriptions,
    next_token: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Convert libvirt domain state to DomainState.
pub(super) fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
    match state {
        sys::VIR_DOMAIN_RUNNING => DomainState::Running,
        sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
        sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
        _ => DomainState::NoState,
    }
}

/// Every defined domain with its state.
pub(super) fn list_domains(connection: &Connect) -> Result<Vec<DomainSummary>> {
    let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;

    let domains = connection
        .list_all_domains(flags)
        .map_err(|e| ConnectError::retrieve("list_all_domains", e.to_string()))?;

    let mut summaries = Vec::with_capacity(domains.len());
    for domain in domains {
        let uuid = domain
            .get_uuid_string()
            .map_err(|e| ConnectError::retrieve("list_all_domains", e.to_string()))?;
        let uuid = Uuid::parse_str(&uuid)
            .map_err(|e| ConnectError::retrieve("list_all_domains", format!("bad UUID '{}': {}", uuid, e)))?;
        let name = domain
            .get_name()
            .map_err(|e| ConnectError::retrieve("list_all_domains", e.to_string()))?;
        let (state, _) = domain
            .get_state()
            .map_err(|e| ConnectError::retrieve("list_all_domains", e.to_string()))?;

        summaries.push(DomainSummary {
            domain: Domain::new(name, uuid),
            state: state_from_libvirt(state),
        });
    }

    debug!(count = summaries.len(), "Listed domains");
    Ok(summaries)
}

// =============================================================================
// virsh Fallbacks
// =============================================================================

// The virt crate v0.4 doesn't expose every call we need; these go through
// virsh against the same URI.

fn virsh(call: &'static str, uri: &str, args: &[&str], stdin: Option<&str>) -> Result<Output> {
    let mut command = Command::new("virsh");
    command
        .arg("-c")
        .arg(uri)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    command
        .spawn()
        .and_then(|mut child| {
            use std::io::Write;
            if let (Some(input), Some(child_stdin)) = (stdin, child.stdin.as_mut()) {
                child_stdin.write_all(input.as_bytes())?;
            }
            drop(child.stdin.take());
            child.wait_with_output()
        })
        .map_err(|e| ConnectError::retrieve(call, format!("virsh command failed: {}", e)))
}

fn virsh_checked(call: &'static str, uri: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
    let output = virsh(call, uri, args, stdin)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ConnectError::retrieve(call, stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `virsh freecell --all` output into free bytes per cell.
pub(super) fn parse_freecell(output: &str) -> Vec<u64> {
    output
        .lines()
        .filter_map(|line| {
            let (cell, rest) = line.trim().split_once(':')?;
            cell.trim().parse::<u32>().ok()?;
            let kib = rest.trim().strip_suffix("KiB")?.trim().parse::<u64>().ok()?;
            Some(kib * 1024)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CapabilitiesXml {
    host: CapabilitiesHostXml,
}

#[derive(Debug, Deserialize)]
struct CapabilitiesHostXml {
    #[serde(rename = "secmodel", default)]
    secmodels: Vec<SecModelXml>,
}

#[derive(Debug, Deserialize)]
struct SecModelXml {
    #[serde(default)]
    model: String,
    #[serde(default)]
    doi: String,
}

/// First security model listed in a capabilities document.
pub(super) fn security_model_from_capabilities(xml: &str) -> std::result::Result<NodeSecurityModel, String> {
    let caps: CapabilitiesXml =
        quick_xml::de::from_str(xml).map_err(|e| format!("malformed capabilities XML: {}", e))?;
    Ok(caps
        .host
        .secmodels
        .into_iter()
        .next()
        .map(|sec| NodeSecurityModel { model: sec.model, doi: sec.doi })
        .unwrap_or_else(|| NodeSecurityModel { model: String::new(), doi: String::new() }))
}

#[async_trait]
impl HypervisorSession for LibvirtSession {
    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn disconnect(&self) -> Result<()> {
        if let Some(poller) = self.poller.lock().map_err(|_| ConnectError::poisoned())?.take() {
            poller.abort();
        }
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
        info!("Disconnected from libvirt");
        Ok(())
    }

    async fn hypervisor_type(&self) -> Result<String> {
        self.connection
            .get_type()
            .map_err(|e| ConnectError::retrieve("hypervisor_type", e.to_string()))
    }

    async fn version(&self) -> Result<u64> {
        self.connection
            .get_hyp_version()
            .map(u64::from)
            .map_err(|e| ConnectError::retrieve("version", e.to_string()))
    }

    async fn lib_version(&self) -> Result<u64> {
        self.connection
            .get_lib_version()
            .map(u64::from)
            .map_err(|e| ConnectError::retrieve("lib_version", e.to_string()))
    }

    async fn hostname(&self) -> Result<String> {
        self.connection
            .get_hostname()
            .map_err(|e| ConnectError::retrieve("hostname", e.to_string()))
    }

    async fn uri(&self) -> Result<String> {
        self.connection
            .get_uri()
            .map_err(|e| ConnectError::retrieve("uri", e.to_string()))
    }

    async fn max_vcpus(&self, guest_type: Option<&str>) -> Result<u32> {
        let mut args = vec!["maxvcpus"];
        if let Some(guest_type) = guest_type {
            args.extend(["--type", guest_type]);
        }
        let output = virsh_checked("max_vcpus", &self.uri, &args, None)?;
        output
            .trim()
            .parse::<u32>()
            .map_err(|e| ConnectError::retrieve("max_vcpus", format!("unexpected virsh output: {}", e)))
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        let info = self
            .connection
            .get_node_info()
            .map_err(|e| ConnectError::retrieve("node_info", e.to_string()))?;

        Ok(NodeInfo {
            model: info.model,
            memory_kib: info.memory as u64,
            cpus: info.cpus as u32,
            mhz: info.mhz as u32,
            nodes: info.nodes as u32,
            sockets: info.sockets as u32,
            cores: info.cores as u32,
            threads: info.threads as u32,
        })
    }

    async fn node_free_memory(&self) -> Result<u64> {
        self.connection
            .get_free_memory()
            .map(|bytes| bytes as u64)
            .map_err(|e| ConnectError::retrieve("node_free_memory", e.to_string()))
    }

    async fn node_cells_free_memory(&self, start_cell: u32, max_cells: u32) -> Result<Vec<u64>> {
        let output = virsh_checked("node_cells_free_memory", &self.uri, &["freecell", "--all"], None)?;
        let cells = parse_freecell(&output);
        if cells.is_empty() {
            return Err(ConnectError::retrieve(
                "node_cells_free_memory",
                "NUMA not supported on this host",
            ));
        }

        let start = start_cell as usize;
        if start >= cells.len() {
            return Err(ConnectError::retrieve(
                "node_cells_free_memory",
                format!("start cell {} out of range (host has {} cells)", start_cell, cells.len()),
            ));
        }
        let end = start.saturating_add(max_cells as usize).min(cells.len());
        Ok(cells[start..end].to_vec())
    }

    async fn node_security_model(&self) -> Result<NodeSecurityModel> {
        let caps = self.capabilities().await?;
        security_model_from_capabilities(&caps)
            .map_err(|e| ConnectError::retrieve("node_security_model", e))
    }

    async fn is_encrypted(&self) -> Result<bool> {
        self.connection
            .is_encrypted()
            .map_err(|e| ConnectError::retrieve("is_encrypted", e.to_string()))
    }

    async fn is_secure(&self) -> Result<bool> {
        self.connection
            .is_secure()
            .map_err(|e| ConnectError::retrieve("is_secure", e.to_string()))
    }

    async fn capabilities(&self) -> Result<String> {
        self.connection
            .get_capabilities()
            .map_err(|e| ConnectError::retrieve("capabilities", e.to_string()))
    }

    async fn compare_cpu(&self, cpu_xml: &str) -> Result<CpuCompareResult> {
        let output = virsh("compare_cpu", &self.uri, &["cpu-compare", "/dev/stdin"], Some(cpu_xml))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_lowercase();

        if stdout.contains("identical") {
            Ok(CpuCompareResult::Identical)
        } else if stdout.contains("superset") {
            Ok(CpuCompareResult::Superset)
        } else if stdout.contains("incompatible") {
            Ok(CpuCompareResult::Incompatible)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConnectError::retrieve("compare_cpu", stderr.trim().to_string()))
        }
    }

    async fn baseline_cpu(&self, cpu_xmls: &[String]) -> Result<String> {
        let document = format!("<cpus>\n{}\n</cpus>\n", cpu_xmls.join("\n"));
        virsh_checked("baseline_cpu", &self.uri, &["cpu-baseline", "/dev/stdin"], Some(&document))
    }

    async fn list_all_domains(&self) -> Result<Vec<DomainSummary>> {
        list_domains(&self.connection)
    }

    fn subscribe(&self, event_id: EventId, domain: Option<&Domain>) -> Result<SubscriptionToken> {
        if event_id != EventId::Lifecycle {
            return Err(ConnectError::remote(
                "subscribe",
                format!("{} events are not supported by the libvirt driver", event_id),
            ));
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .map_err(|_| ConnectError::poisoned())?
            .insert(token, domain.map(|d| d.uuid));

        debug!(token, "Lifecycle subscription added");
        Ok(SubscriptionToken(token))
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
        match self
            .subscriptions
            .lock()
            .map_err(|_| ConnectError::poisoned())?
            .remove(&token.0)
        {
            Some(_) => Ok(()),
            None => {
                warn!(token = token.0, "Unknown subscription token");
                Err(ConnectError::remote(
                    "unsubscribe",
                    format!("no subscription with token {}", token.0),
                ))
            }
        }
    }
}
