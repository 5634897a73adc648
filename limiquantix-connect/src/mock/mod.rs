//! In-process mock hypervisor for testing and development.
//!
//! `MockHost` keeps domains in memory and emits domain events to every open
//! session with a matching subscription, the way a real hypervisor daemon
//! filters events server-side. Cloning a `MockHost` yields another handle to
//! the same host, so a test can open connections through one handle and
//! drive domain lifecycles through another.

mod cpu;

pub use cpu::{model_rank, HostCpu, CPU_MODELS};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::driver::{HypervisorDriver, HypervisorSession, NotificationSink};
use crate::error::{ConnectError, Result};
use crate::event::{
    DefinedDetail, EventId, LifecycleEvent, ResumedDetail, StartedDetail, StoppedDetail,
    SuspendedDetail, UndefinedDetail,
};
use crate::types::*;
use crate::uri::ConnectUri;

const GIB: u64 = 1024 * 1024 * 1024;

/// Everything a mock host reports about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockHostConfig {
    /// Hypervisor driver type
    pub hypervisor_type: String,
    pub version: u64,
    pub lib_version: u64,
    /// Defaults to the local machine's hostname
    pub hostname: Option<String>,
    /// Defaults to whether the URI transport encrypts
    pub encrypted: Option<bool>,
    /// Defaults to whether the URI transport is local or encrypted
    pub secure: Option<bool>,
    pub node_info: NodeInfo,
    /// Free bytes per NUMA cell; `None` when the host has no NUMA accounting
    pub cells_free_memory: Option<Vec<u64>>,
    /// Free host memory in bytes; `None` when unavailable
    pub free_memory: Option<u64>,
    pub security_model: NodeSecurityModel,
    pub host_cpu: HostCpu,
    /// Max vCPUs when no guest type is given
    pub default_max_vcpus: u32,
    /// Max vCPUs per guest type (lowercase)
    pub max_vcpus: BTreeMap<String, u32>,
    /// Simulated round-trip time of a subscribe call, after the host has
    /// recorded the subscription
    pub subscribe_latency_ms: u64,
}

impl Default for MockHostConfig {
    fn default() -> Self {
        Self {
            hypervisor_type: "QEMU".to_string(),
            version: 8_002_000,
            lib_version: 10_000_000,
            hostname: None,
            encrypted: None,
            secure: None,
            node_info: NodeInfo {
                model: "x86_64".to_string(),
                memory_kib: 16 * 1024 * 1024,
                cpus: 8,
                mhz: 2400,
                nodes: 1,
                sockets: 1,
                cores: 4,
                threads: 2,
            },
            cells_free_memory: Some(vec![8 * GIB]),
            free_memory: Some(8 * GIB),
            security_model: NodeSecurityModel {
                model: "none".to_string(),
                doi: "0".to_string(),
            },
            host_cpu: HostCpu::default(),
            default_max_vcpus: 255,
            max_vcpus: [("kvm".to_string(), 288), ("qemu".to_string(), 255)]
                .into_iter()
                .collect(),
            subscribe_latency_ms: 0,
        }
    }
}

// =============================================================================
// Host State
// =============================================================================

#[derive(Debug, Clone)]
struct MockDomain {
    domain: Domain,
    state: DomainState,
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    event_id: EventId,
    domain: Option<Uuid>,
}

impl Subscription {
    fn matches(&self, event_id: EventId, domain: &Domain) -> bool {
        self.event_id == event_id && self.domain.map_or(true, |uuid| uuid == domain.uuid)
    }
}

/// Host-side view of one open session.
struct SessionShared {
    sink: NotificationSink,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    closed: AtomicBool,
}

struct HostState {
    domains: BTreeMap<Uuid, MockDomain>,
    next_domain_id: u32,
    sessions: Vec<Arc<SessionShared>>,
}

struct HostInner {
    config: MockHostConfig,
    host_uuid: Uuid,
    reachable: AtomicBool,
    next_token: AtomicU64,
    state: RwLock<HostState>,
}

/// In-memory hypervisor.
#[derive(Clone)]
pub struct MockHost {
    inner: Arc<HostInner>,
}

impl MockHost {
    /// A QEMU-type host with default hardware.
    pub fn new() -> Self {
        Self::with_config(MockHostConfig::default())
    }

    /// The host behind `test://` URIs.
    pub fn test_host() -> Self {
        Self::with_config(MockHostConfig {
            hypervisor_type: "Test".to_string(),
            ..MockHostConfig::default()
        })
    }

    pub fn with_config(config: MockHostConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                host_uuid: Uuid::new_v4(),
                reachable: AtomicBool::new(true),
                next_token: AtomicU64::new(1),
                state: RwLock::new(HostState {
                    domains: BTreeMap::new(),
                    next_domain_id: 1,
                    sessions: Vec::new(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &MockHostConfig {
        &self.inner.config
    }

    /// Simulate the hypervisor going away or coming back.
    ///
    /// While unreachable, connects fail, queries fail with `Retrieve` and
    /// subscription calls with `Remote`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Number of sessions currently open against this host.
    pub fn session_count(&self) -> usize {
        self.inner
            .state
            .read()
            .map(|state| state.sessions.iter().filter(|s| !s.sink.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of live subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .state
            .read()
            .map(|state| {
                state
                    .sessions
                    .iter()
                    .filter_map(|s| s.subscriptions.lock().ok().map(|subs| subs.len()))
                    .sum()
            })
            .unwrap_or(0)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Send an event to every session subscribed to it.
    ///
    /// Returns the number of sessions the event was queued for. Sessions
    /// whose connection has gone away are forgotten.
    pub fn emit(&self, domain: &Domain, event_id: EventId, event: i32, detail: i32) -> usize {
        let Ok(mut state) = self.inner.state.write() else {
            return 0;
        };
        state
            .sessions
            .retain(|session| !session.closed.load(Ordering::SeqCst) && !session.sink.is_closed());

        let mut delivered = 0;
        for session in &state.sessions {
            let interested = session
                .subscriptions
                .lock()
                .map(|subs| subs.values().any(|sub| sub.matches(event_id, domain)))
                .unwrap_or(false);
            if interested && session.sink.notify(domain.clone(), event_id, event, detail) {
                delivered += 1;
            }
        }

        debug!(
            domain = %domain.name,
            event_id = %event_id,
            event,
            detail,
            sessions = delivered,
            "Emitted domain event"
        );
        delivered
    }

    fn emit_lifecycle(&self, domain: &Domain, event: LifecycleEvent, detail: i32) {
        self.emit(domain, EventId::Lifecycle, event.code(), detail);
    }

    // =========================================================================
    // Domain Lifecycle
    // =========================================================================

    fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MockDomain, &mut u32) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.inner.state.write().map_err(|_| ConnectError::poisoned())?;
        let HostState { domains, next_domain_id, .. } = &mut *state;
        let domain = domains
            .values_mut()
            .find(|d| d.domain.name == name)
            .ok_or_else(|| ConnectError::InvalidArgument(format!("no domain named '{}'", name)))?;
        f(domain, next_domain_id)
    }

    /// Define a new, inactive domain.
    #[instrument(skip(self))]
    pub fn define_domain(&self, name: &str) -> Result<Domain> {
        let domain = {
            let mut state = self.inner.state.write().map_err(|_| ConnectError::poisoned())?;
            if state.domains.values().any(|d| d.domain.name == name) {
                return Err(ConnectError::InvalidArgument(format!(
                    "domain '{}' already exists",
                    name
                )));
            }
            let domain = Domain::new(name, Uuid::new_v4());
            state.domains.insert(
                domain.uuid,
                MockDomain { domain: domain.clone(), state: DomainState::Shutoff },
            );
            domain
        };

        info!(uuid = %domain.uuid, "Domain defined");
        self.emit_lifecycle(&domain, LifecycleEvent::Defined, DefinedDetail::Added.code());
        Ok(domain)
    }

    /// Boot an inactive domain.
    #[instrument(skip(self))]
    pub fn start_domain(&self, name: &str) -> Result<Domain> {
        let domain = self.with_domain(name, |d, next_id| {
            if d.state.is_active() {
                return Err(ConnectError::OperationInvalid("domain is already running".to_string()));
            }
            d.domain.id = Some(*next_id);
            *next_id += 1;
            d.state = DomainState::Running;
            Ok(d.domain.clone())
        })?;

        info!(id = ?domain.id, "Domain started");
        self.emit_lifecycle(&domain, LifecycleEvent::Started, StartedDetail::Booted.code());
        Ok(domain)
    }

    /// Pause a running domain.
    pub fn suspend_domain(&self, name: &str) -> Result<Domain> {
        let domain = self.with_domain(name, |d, _| {
            if d.state != DomainState::Running {
                return Err(ConnectError::OperationInvalid("domain is not running".to_string()));
            }
            d.state = DomainState::Paused;
            Ok(d.domain.clone())
        })?;

        self.emit_lifecycle(&domain, LifecycleEvent::Suspended, SuspendedDetail::Paused.code());
        Ok(domain)
    }

    /// Unpause a paused domain.
    pub fn resume_domain(&self, name: &str) -> Result<Domain> {
        let domain = self.with_domain(name, |d, _| {
            if d.state != DomainState::Paused {
                return Err(ConnectError::OperationInvalid("domain is not paused".to_string()));
            }
            d.state = DomainState::Running;
            Ok(d.domain.clone())
        })?;

        self.emit_lifecycle(&domain, LifecycleEvent::Resumed, ResumedDetail::Unpaused.code());
        Ok(domain)
    }

    fn stop(&self, name: &str) -> Result<Domain> {
        self.with_domain(name, |d, _| {
            if !d.state.is_active() {
                return Err(ConnectError::OperationInvalid("domain is not running".to_string()));
            }
            // Events carry the runtime id the domain had while running.
            let running = d.domain.clone();
            d.domain.id = None;
            d.state = DomainState::Shutoff;
            Ok(running)
        })
    }

    /// Graceful guest shutdown.
    #[instrument(skip(self))]
    pub fn shutdown_domain(&self, name: &str) -> Result<Domain> {
        let domain = self.stop(name)?;
        info!("Domain shut down");
        self.emit_lifecycle(&domain, LifecycleEvent::Shutdown, 0);
        self.emit_lifecycle(&domain, LifecycleEvent::Stopped, StoppedDetail::Shutdown.code());
        Ok(domain)
    }

    /// Hard power-off.
    #[instrument(skip(self))]
    pub fn destroy_domain(&self, name: &str) -> Result<Domain> {
        let domain = self.stop(name)?;
        info!("Domain destroyed");
        self.emit_lifecycle(&domain, LifecycleEvent::Stopped, StoppedDetail::Destroyed.code());
        Ok(domain)
    }

    /// Simulate a guest crash; the domain ends up shut off.
    #[instrument(skip(self))]
    pub fn crash_domain(&self, name: &str) -> Result<Domain> {
        let domain = self.stop(name)?;
        info!("Domain crashed");
        self.emit_lifecycle(&domain, LifecycleEvent::Stopped, StoppedDetail::Crashed.code());
        Ok(domain)
    }

    /// Guest-initiated reboot of a running domain.
    pub fn reboot_domain(&self, name: &str) -> Result<Domain> {
        let domain = self.with_domain(name, |d, _| {
            if d.state != DomainState::Running {
                return Err(ConnectError::OperationInvalid("domain is not running".to_string()));
            }
            Ok(d.domain.clone())
        })?;

        self.emit(&domain, EventId::Reboot, 0, 0);
        Ok(domain)
    }

    /// Remove an inactive domain.
    #[instrument(skip(self))]
    pub fn undefine_domain(&self, name: &str) -> Result<Domain> {
        let domain = {
            let mut state = self.inner.state.write().map_err(|_| ConnectError::poisoned())?;
            let uuid = state
                .domains
                .values()
                .find(|d| d.domain.name == name)
                .map(|d| (d.domain.uuid, d.state))
                .ok_or_else(|| ConnectError::InvalidArgument(format!("no domain named '{}'", name)))
                .and_then(|(uuid, domain_state)| {
                    if domain_state.is_active() {
                        Err(ConnectError::OperationInvalid(
                            "cannot undefine a running domain".to_string(),
                        ))
                    } else {
                        Ok(uuid)
                    }
                })?;
            state
                .domains
                .remove(&uuid)
                .map(|d| d.domain)
                .ok_or_else(|| ConnectError::Internal("domain vanished".to_string()))?
        };

        info!(uuid = %domain.uuid, "Domain undefined");
        self.emit_lifecycle(&domain, LifecycleEvent::Undefined, UndefinedDetail::Removed.code());
        Ok(domain)
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorDriver for MockHost {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(
        &self,
        uri: &ConnectUri,
        sink: NotificationSink,
        read_only: bool,
    ) -> Result<Arc<dyn HypervisorSession>> {
        if !self.is_reachable() {
            return Err(ConnectError::ConnectionFailed(format!(
                "cannot reach hypervisor at {}",
                uri
            )));
        }

        let connection_id = sink.connection_id();
        let shared = Arc::new(SessionShared {
            sink,
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        self.inner
            .state
            .write()
            .map_err(|_| ConnectError::poisoned())?
            .sessions
            .push(shared.clone());

        debug!(uri = %uri, read_only, connection_id = %connection_id, "Mock session opened");

        Ok(Arc::new(MockSession {
            host: self.clone(),
            shared,
            uri: uri.clone(),
        }))
    }
}

// =============================================================================
// Session
// =============================================================================

/// One connection's session with a [`MockHost`].
pub struct MockSession {
    host: MockHost,
    shared: Arc<SessionShared>,
    uri: ConnectUri,
}

impl MockSession {
    fn config(&self) -> &MockHostConfig {
        &self.host.inner.config
    }

    fn answer(&self, call: &'static str) -> Result<()> {
        if self.host.is_reachable() {
            Ok(())
        } else {
            Err(ConnectError::retrieve(call, "hypervisor not responding"))
        }
    }

    fn accept(&self, call: &'static str) -> Result<()> {
        if self.host.is_reachable() {
            Ok(())
        } else {
            Err(ConnectError::remote(call, "hypervisor not responding"))
        }
    }

    fn capabilities_xml(&self) -> String {
        let config = self.config();
        let cpu = &config.host_cpu;
        let info = &config.node_info;

        let features: String = cpu
            .features
            .iter()
            .map(|feature| format!("      <feature name='{}'/>\n", feature))
            .collect();

        format!(
            "<capabilities>\n\
             \x20 <host>\n\
             \x20   <uuid>{uuid}</uuid>\n\
             \x20   <cpu>\n\
             \x20     <arch>{arch}</arch>\n\
             \x20     <model>{model}</model>\n\
             \x20     <vendor>{vendor}</vendor>\n\
             \x20     <topology sockets='{sockets}' cores='{cores}' threads='{threads}'/>\n\
             {features}\
             \x20   </cpu>\n\
             \x20   <secmodel>\n\
             \x20     <model>{secmodel}</model>\n\
             \x20     <doi>{doi}</doi>\n\
             \x20   </secmodel>\n\
             \x20 </host>\n\
             \x20 <guest>\n\
             \x20   <os_type>hvm</os_type>\n\
             \x20   <arch name='{arch}'>\n\
             \x20     <domain type='qemu'/>\n\
             \x20     <domain type='kvm'/>\n\
             \x20   </arch>\n\
             \x20 </guest>\n\
             </capabilities>\n",
            uuid = self.host.inner.host_uuid,
            arch = cpu.arch,
            model = cpu.model,
            vendor = cpu.vendor,
            sockets = info.sockets,
            cores = info.cores,
            threads = info.threads,
            features = features,
            secmodel = config.security_model.model,
            doi = config.security_model.doi,
        )
    }
}

#[async_trait]
impl HypervisorSession for MockSession {
    async fn disconnect(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Ok(mut subs) = self.shared.subscriptions.lock() {
            subs.clear();
        }
        let mut state = self.host.inner.state.write().map_err(|_| ConnectError::poisoned())?;
        state.sessions.retain(|session| !Arc::ptr_eq(session, &self.shared));
        debug!(uri = %self.uri, "Mock session closed");
        Ok(())
    }

    async fn hypervisor_type(&self) -> Result<String> {
        self.answer("hypervisor_type")?;
        Ok(self.config().hypervisor_type.clone())
    }

    async fn version(&self) -> Result<u64> {
        self.answer("version")?;
        Ok(self.config().version)
    }

    async fn lib_version(&self) -> Result<u64> {
        self.answer("lib_version")?;
        Ok(self.config().lib_version)
    }

    async fn hostname(&self) -> Result<String> {
        self.answer("hostname")?;
        match &self.config().hostname {
            Some(hostname) => Ok(hostname.clone()),
            None => hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .map_err(|e| ConnectError::retrieve("hostname", e.to_string())),
        }
    }

    async fn uri(&self) -> Result<String> {
        self.answer("uri")?;
        Ok(self.uri.as_str().to_string())
    }

    async fn max_vcpus(&self, guest_type: Option<&str>) -> Result<u32> {
        self.answer("max_vcpus")?;
        match guest_type {
            None => Ok(self.config().default_max_vcpus),
            Some(guest_type) => self
                .config()
                .max_vcpus
                .get(&guest_type.to_lowercase())
                .copied()
                .ok_or_else(|| {
                    ConnectError::retrieve("max_vcpus", format!("unknown guest type '{}'", guest_type))
                }),
        }
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        self.answer("node_info")?;
        Ok(self.config().node_info.clone())
    }

    async fn node_free_memory(&self) -> Result<u64> {
        self.answer("node_free_memory")?;
        self.config()
            .free_memory
            .ok_or_else(|| ConnectError::retrieve("node_free_memory", "free memory not available"))
    }

    async fn node_cells_free_memory(&self, start_cell: u32, max_cells: u32) -> Result<Vec<u64>> {
        self.answer("node_cells_free_memory")?;
        let cells = self.config().cells_free_memory.as_ref().ok_or_else(|| {
            ConnectError::retrieve("node_cells_free_memory", "NUMA not supported on this host")
        })?;

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
        self.answer("node_security_model")?;
        Ok(self.config().security_model.clone())
    }

    async fn is_encrypted(&self) -> Result<bool> {
        self.answer("is_encrypted")?;
        Ok(self
            .config()
            .encrypted
            .unwrap_or_else(|| self.uri.is_encrypted_transport()))
    }

    async fn is_secure(&self) -> Result<bool> {
        self.answer("is_secure")?;
        Ok(self
            .config()
            .secure
            .unwrap_or_else(|| self.uri.is_secure_transport()))
    }

    async fn capabilities(&self) -> Result<String> {
        self.answer("capabilities")?;
        Ok(self.capabilities_xml())
    }

    async fn compare_cpu(&self, cpu_xml: &str) -> Result<CpuCompareResult> {
        self.answer("compare_cpu")?;
        let result = cpu::compare(&self.config().host_cpu, cpu_xml)
            .map_err(|e| ConnectError::retrieve("compare_cpu", e))?;
        Ok(match result {
            cpu::Comparison::Incompatible => CpuCompareResult::Incompatible,
            cpu::Comparison::Identical => CpuCompareResult::Identical,
            cpu::Comparison::Superset => CpuCompareResult::Superset,
        })
    }

    async fn baseline_cpu(&self, cpu_xmls: &[String]) -> Result<String> {
        self.answer("baseline_cpu")?;
        cpu::baseline(cpu_xmls).map_err(|e| ConnectError::retrieve("baseline_cpu", e))
    }

    async fn list_all_domains(&self) -> Result<Vec<DomainSummary>> {
        self.answer("list_all_domains")?;
        let state = self.host.inner.state.read().map_err(|_| ConnectError::poisoned())?;
        let mut domains: Vec<DomainSummary> = state
            .domains
            .values()
            .map(|d| DomainSummary { domain: d.domain.clone(), state: d.state })
            .collect();
        domains.sort_by(|a, b| a.domain.name.cmp(&b.domain.name));
        Ok(domains)
    }

    fn subscribe(&self, event_id: EventId, domain: Option<&Domain>) -> Result<SubscriptionToken> {
        self.accept("subscribe")?;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::remote("subscribe", "session closed"));
        }

        let token = self.host.inner.next_token.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscriptions
            .lock()
            .map_err(|_| ConnectError::poisoned())?
            .insert(token, Subscription { event_id, domain: domain.map(|d| d.uuid) });

        debug!(token, event_id = %event_id, "Subscription added");

        let latency = self.config().subscribe_latency_ms;
        if latency > 0 {
            std::thread::sleep(std::time::Duration::from_millis(latency));
        }
        Ok(SubscriptionToken(token))
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
        self.accept("unsubscribe")?;
        self.shared
            .subscriptions
            .lock()
            .map_err(|_| ConnectError::poisoned())?
            .remove(&token.0)
            .map(|_| ())
            .ok_or_else(|| {
                ConnectError::remote("unsubscribe", format!("no subscription with token {}", token.0))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Envelope;
    use crate::error::ErrorKind;
    use tokio::sync::mpsc;

    async fn open_session(
        host: &MockHost,
    ) -> (Arc<dyn HypervisorSession>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = NotificationSink::new(ConnectionId::new(), tx);
        let uri = ConnectUri::parse("qemu:///system").unwrap();
        let session = host.connect(&uri, sink, false).await.unwrap();
        (session, rx)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let host = MockHost::new();
        host.define_domain("web").unwrap();

        assert_eq!(host.start_domain("web").unwrap().id, Some(1));
        assert_eq!(
            host.start_domain("web").unwrap_err().kind(),
            ErrorKind::OperationInvalid
        );
        host.suspend_domain("web").unwrap();
        host.resume_domain("web").unwrap();
        assert_eq!(
            host.undefine_domain("web").unwrap_err().kind(),
            ErrorKind::OperationInvalid
        );
        let stopped = host.destroy_domain("web").unwrap();
        assert_eq!(stopped.id, Some(1));
        host.undefine_domain("web").unwrap();

        assert_eq!(host.start_domain("web").unwrap_err().kind(), ErrorKind::Argument);
        assert_eq!(host.define_domain("db").unwrap().id, None);
        assert_eq!(host.define_domain("db").unwrap_err().kind(), ErrorKind::Argument);
    }

    #[tokio::test]
    async fn test_emit_filters_by_subscription() {
        let host = MockHost::new();
        let web = host.define_domain("web").unwrap();
        let db = host.define_domain("db").unwrap();
        let (session, mut rx) = open_session(&host).await;

        assert_eq!(host.emit(&web, EventId::Lifecycle, 2, 0), 0);

        session.subscribe(EventId::Lifecycle, Some(&web)).unwrap();
        assert_eq!(host.emit(&web, EventId::Lifecycle, 2, 0), 1);
        assert_eq!(host.emit(&db, EventId::Lifecycle, 2, 0), 0);
        assert_eq!(host.emit(&web, EventId::Reboot, 0, 0), 0);

        assert!(matches!(rx.try_recv(), Ok(Envelope::Notify(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overlapping_subscriptions_emit_once() {
        let host = MockHost::new();
        let web = host.define_domain("web").unwrap();
        let (session, mut rx) = open_session(&host).await;

        session.subscribe(EventId::Lifecycle, None).unwrap();
        session.subscribe(EventId::Lifecycle, Some(&web)).unwrap();
        assert_eq!(host.emit(&web, EventId::Lifecycle, 2, 0), 1);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_token_is_remote_error() {
        let host = MockHost::new();
        let (session, _rx) = open_session(&host).await;

        let token = session.subscribe(EventId::Watchdog, None).unwrap();
        session.unsubscribe(token).unwrap();
        assert_eq!(session.unsubscribe(token).unwrap_err().kind(), ErrorKind::Remote);
        assert_eq!(host.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let host = MockHost::new();
        let (session, _rx) = open_session(&host).await;
        host.set_reachable(false);

        let err = session.hypervisor_type().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Retrieve);
        assert_eq!(
            session.subscribe(EventId::Lifecycle, None).unwrap_err().kind(),
            ErrorKind::Remote
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = NotificationSink::new(ConnectionId::new(), tx);
        let uri = ConnectUri::parse("qemu:///system").unwrap();
        let err = host.connect(&uri, sink, false).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Connect);
    }

    #[tokio::test]
    async fn test_capabilities_mention_host_cpu() {
        let host = MockHost::new();
        let (session, _rx) = open_session(&host).await;

        let caps = session.capabilities().await.unwrap();
        assert!(caps.starts_with("<capabilities>"));
        assert!(caps.contains("<model>Haswell</model>"));
        assert!(caps.contains("<feature name='vmx'/>"));
    }

    #[tokio::test]
    async fn test_cells_window() {
        let host = MockHost::with_config(MockHostConfig {
            cells_free_memory: Some(vec![10, 20, 30, 40]),
            ..MockHostConfig::default()
        });
        let (session, _rx) = open_session(&host).await;

        assert_eq!(session.node_cells_free_memory(1, 2).await.unwrap(), vec![20, 30]);
        assert_eq!(session.node_cells_free_memory(3, 10).await.unwrap(), vec![40]);
        assert_eq!(
            session.node_cells_free_memory(4, 1).await.unwrap_err().kind(),
            ErrorKind::Retrieve
        );
    }

    #[tokio::test]
    async fn test_disconnect_forgets_session() {
        let host = MockHost::new();
        let (session, _rx) = open_session(&host).await;
        assert_eq!(host.session_count(), 1);

        session.disconnect().await.unwrap();
        assert_eq!(host.session_count(), 0);
    }
}
