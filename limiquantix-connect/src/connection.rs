//! Hypervisor connection: session lifecycle, host queries and event
//! registration.

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::callback::{CallbackErrorHook, DomainEventCallback, Opaque};
use crate::dispatcher::{spawn_worker, DispatchStats, Dispatcher};
use crate::driver::{Envelope, HypervisorDriver, HypervisorSession, NotificationSink};
use crate::error::{ConnectError, Result};
use crate::event::EventId;
use crate::legacy::LegacyCallback;
use crate::mock::MockHost;
use crate::registry::EventRegistry;
use crate::types::*;
use crate::uri::ConnectUri;

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    uri: ConnectUri,
    driver: &'static str,
    read_only: bool,
    /// `None` once closed
    session: RwLock<Option<Arc<dyn HypervisorSession>>>,
    registry: Arc<EventRegistry>,
    dispatcher: Dispatcher,
    tx: mpsc::UnboundedSender<Envelope>,
    worker: Mutex<Option<Worker>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                worker.handle.abort();
            }
        }
        if matches!(self.session.get_mut(), Ok(Some(_))) {
            debug!(connection_id = %self.id, uri = %self.uri, "Connection dropped without close");
        }
    }
}

/// An open session to a hypervisor.
///
/// Cloning is cheap and every clone refers to the same session. Event
/// callbacks run on a dispatcher task owned by the connection, one at a
/// time, in the order the hypervisor produced the events.
///
/// Once [`close`](Connection::close) has been called every operation fails
/// with `OperationInvalid`, except [`is_closed`](Connection::is_closed).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("uri", &self.inner.uri.as_str())
            .field("driver", &self.inner.driver)
            .field("read_only", &self.inner.read_only)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a connection, picking the driver from the URI scheme.
    ///
    /// `test://` URIs open a fresh in-process mock host. Other schemes need
    /// the `libvirt` feature.
    pub async fn open(uri: &str) -> Result<Self> {
        let parsed = ConnectUri::parse(uri)?;
        let driver = driver_for(&parsed)?;
        Self::establish(driver.as_ref(), parsed, false).await
    }

    /// Like [`open`](Connection::open), but the session is read-only.
    pub async fn open_read_only(uri: &str) -> Result<Self> {
        let parsed = ConnectUri::parse(uri)?;
        let driver = driver_for(&parsed)?;
        Self::establish(driver.as_ref(), parsed, true).await
    }

    /// Open a connection through an explicit driver.
    pub async fn open_with(driver: &dyn HypervisorDriver, uri: &str) -> Result<Self> {
        Self::establish(driver, ConnectUri::parse(uri)?, false).await
    }

    pub async fn open_read_only_with(driver: &dyn HypervisorDriver, uri: &str) -> Result<Self> {
        Self::establish(driver, ConnectUri::parse(uri)?, true).await
    }

    #[instrument(skip(driver, uri), fields(uri = %uri, driver = driver.name()))]
    async fn establish(
        driver: &dyn HypervisorDriver,
        uri: ConnectUri,
        read_only: bool,
    ) -> Result<Self> {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = NotificationSink::new(id, tx.clone());

        let session = driver.connect(&uri, sink, read_only).await?;

        let registry = Arc::new(EventRegistry::new());
        let inner = Arc::new(ConnectionInner {
            id,
            uri,
            driver: driver.name(),
            read_only,
            session: RwLock::new(Some(session)),
            dispatcher: Dispatcher::new(id, registry.clone()),
            registry,
            tx,
            worker: Mutex::new(None),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = spawn_worker(Arc::downgrade(&inner), id, rx, shutdown_rx);
        *inner.worker.lock().map_err(|_| ConnectError::poisoned())? = Some(Worker {
            shutdown: shutdown_tx,
            handle,
        });

        info!(connection_id = %id, read_only, "Connection opened");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    fn session(&self) -> Result<Arc<dyn HypervisorSession>> {
        self.inner
            .session
            .read()
            .map_err(|_| ConnectError::poisoned())?
            .clone()
            .ok_or_else(ConnectError::closed)
    }

    /// Close the connection.
    ///
    /// Every registration and the legacy callback are removed and their
    /// hypervisor subscriptions withdrawn, queued notifications are dropped,
    /// the dispatcher task is stopped and the session released. Closing a
    /// closed connection fails with `OperationInvalid`.
    #[instrument(skip(self), fields(connection_id = %self.inner.id))]
    pub async fn close(&self) -> Result<()> {
        let session = self
            .inner
            .session
            .write()
            .map_err(|_| ConnectError::poisoned())?
            .take()
            .ok_or_else(|| ConnectError::OperationInvalid("connection already closed".to_string()))?;

        let (registrations, legacy) = self.inner.dispatcher.quiesce(|| self.inner.registry.drain())?;

        let tokens = registrations
            .iter()
            .map(|registration| registration.token)
            .chain(legacy.as_ref().map(|legacy| legacy.token));
        for token in tokens {
            if let Err(e) = session.unsubscribe(token) {
                warn!(token = token.0, error = %e, "Failed to withdraw subscription during close");
            }
        }

        let worker = self
            .inner
            .worker
            .lock()
            .map_err(|_| ConnectError::poisoned())?
            .take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            if let Err(e) = worker.handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Dispatcher task failed");
                }
            }
        }

        session.disconnect().await?;

        info!(
            removed_callbacks = registrations.len(),
            removed_legacy = legacy.is_some(),
            "Connection closed"
        );
        Ok(())
    }

    /// True once [`close`](Connection::close) has succeeded. Never fails.
    pub fn is_closed(&self) -> bool {
        self.inner
            .session
            .read()
            .map(|session| session.is_none())
            .unwrap_or(true)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Name of the driver behind this connection.
    pub fn driver_name(&self) -> &'static str {
        self.inner.driver
    }

    pub fn is_read_only(&self) -> Result<bool> {
        self.session()?;
        Ok(self.inner.read_only)
    }

    // =========================================================================
    // Host Queries
    // =========================================================================

    /// Hypervisor driver type, e.g. "QEMU".
    #[instrument(skip(self), fields(connection_id = %self.inner.id))]
    pub async fn hypervisor_type(&self) -> Result<String> {
        self.session()?.hypervisor_type().await
    }

    /// Hypervisor version (see [`VersionTriple`] for decoding).
    pub async fn version(&self) -> Result<u64> {
        self.session()?.version().await
    }

    pub async fn lib_version(&self) -> Result<u64> {
        self.session()?.lib_version().await
    }

    pub async fn hostname(&self) -> Result<String> {
        self.session()?.hostname().await
    }

    /// The URI of the session.
    pub async fn uri(&self) -> Result<String> {
        self.session()?.uri().await
    }

    /// Host capabilities XML, passed through untouched.
    pub async fn capabilities(&self) -> Result<String> {
        self.session()?.capabilities().await
    }

    pub async fn node_info(&self) -> Result<NodeInfo> {
        self.session()?.node_info().await
    }

    pub async fn node_security_model(&self) -> Result<NodeSecurityModel> {
        self.session()?.node_security_model().await
    }

    pub async fn is_encrypted(&self) -> Result<bool> {
        self.session()?.is_encrypted().await
    }

    pub async fn is_secure(&self) -> Result<bool> {
        self.session()?.is_secure().await
    }

    /// Maximum vCPUs for a guest type, or the hypervisor default with `None`.
    ///
    /// Unknown guest types fail with `Retrieve`.
    #[instrument(skip(self), fields(connection_id = %self.inner.id))]
    pub async fn max_vcpus(&self, guest_type: Option<&str>) -> Result<u32> {
        self.session()?.max_vcpus(guest_type).await
    }

    /// Free host memory in bytes.
    pub async fn node_free_memory(&self) -> Result<u64> {
        self.session()?.node_free_memory().await
    }

    /// Free memory in bytes per NUMA cell.
    ///
    /// `start_cell` defaults to 0 and `max_cells` to the number of NUMA
    /// cells reported by [`node_info`](Connection::node_info). Hosts without
    /// NUMA accounting fail with `Retrieve`.
    #[instrument(skip(self), fields(connection_id = %self.inner.id))]
    pub async fn node_cells_free_memory(
        &self,
        start_cell: Option<u32>,
        max_cells: Option<u32>,
    ) -> Result<Vec<u64>> {
        let session = self.session()?;
        let start_cell = start_cell.unwrap_or(0);
        let max_cells = match max_cells {
            Some(0) => {
                return Err(ConnectError::InvalidArgument(
                    "max_cells must be greater than zero".to_string(),
                ))
            }
            Some(max) => max,
            None => session.node_info().await?.nodes,
        };
        session.node_cells_free_memory(start_cell, max_cells).await
    }

    /// Compare a CPU definition against the host CPU.
    ///
    /// Malformed definitions fail with `Retrieve`.
    #[instrument(skip(self, cpu_xml), fields(connection_id = %self.inner.id))]
    pub async fn compare_cpu(&self, cpu_xml: &str) -> Result<CpuCompareResult> {
        self.session()?.compare_cpu(cpu_xml).await
    }

    /// The most capable CPU definition every given CPU can run.
    ///
    /// An empty list fails with `InvalidArgument` before the hypervisor is
    /// asked; malformed entries fail with `Retrieve`.
    #[instrument(skip(self, cpu_xmls), fields(connection_id = %self.inner.id, count = cpu_xmls.len()))]
    pub async fn baseline_cpu<S: AsRef<str>>(&self, cpu_xmls: &[S]) -> Result<String> {
        let session = self.session()?;
        if cpu_xmls.is_empty() {
            return Err(ConnectError::InvalidArgument(
                "baseline_cpu requires at least one CPU definition".to_string(),
            ));
        }
        let owned: Vec<String> = cpu_xmls.iter().map(|xml| xml.as_ref().to_string()).collect();
        session.baseline_cpu(&owned).await
    }

    // =========================================================================
    // Domain Queries
    // =========================================================================

    /// Every defined domain with its state.
    pub async fn list_all_domains(&self) -> Result<Vec<DomainSummary>> {
        self.session()?.list_all_domains().await
    }

    pub async fn num_of_domains(&self) -> Result<usize> {
        Ok(self.active_domains(true).await?.len())
    }

    /// Names of running domains.
    pub async fn list_domains(&self) -> Result<Vec<String>> {
        self.active_domains(true).await
    }

    pub async fn num_of_defined_domains(&self) -> Result<usize> {
        Ok(self.active_domains(false).await?.len())
    }

    /// Names of defined but inactive domains.
    pub async fn list_defined_domains(&self) -> Result<Vec<String>> {
        self.active_domains(false).await
    }

    async fn active_domains(&self, active: bool) -> Result<Vec<String>> {
        Ok(self
            .list_all_domains()
            .await?
            .into_iter()
            .filter(|summary| summary.state.is_active() == active)
            .map(|summary| summary.domain.name)
            .collect())
    }

    pub async fn lookup_domain_by_name(&self, name: &str) -> Result<Domain> {
        self.list_all_domains()
            .await?
            .into_iter()
            .map(|summary| summary.domain)
            .find(|domain| domain.name == name)
            .ok_or_else(|| {
                ConnectError::retrieve("lookup_domain_by_name", format!("no domain named '{}'", name))
            })
    }

    pub async fn lookup_domain_by_uuid(&self, uuid: &Uuid) -> Result<Domain> {
        self.list_all_domains()
            .await?
            .into_iter()
            .map(|summary| summary.domain)
            .find(|domain| domain.uuid == *uuid)
            .ok_or_else(|| {
                ConnectError::retrieve("lookup_domain_by_uuid", format!("no domain with UUID {}", uuid))
            })
    }

    /// Find a running domain by its runtime id.
    pub async fn lookup_domain_by_id(&self, id: u32) -> Result<Domain> {
        self.list_all_domains()
            .await?
            .into_iter()
            .filter(|summary| summary.state.is_active())
            .map(|summary| summary.domain)
            .find(|domain| domain.id == Some(id))
            .ok_or_else(|| {
                ConnectError::retrieve("lookup_domain_by_id", format!("no domain with ID {}", id))
            })
    }

    // =========================================================================
    // Event Registration
    // =========================================================================

    /// Register a callback for one kind of domain event.
    ///
    /// With `domain`, only that domain's events are delivered. The returned
    /// id is passed to [`deregister_any`](Connection::deregister_any).
    #[instrument(skip(self, callback, domain, opaque), fields(
        connection_id = %self.inner.id,
        domain = domain.map(|d| d.name.as_str()).unwrap_or("*"),
    ))]
    pub fn register_any<C: DomainEventCallback>(
        &self,
        event_id: EventId,
        callback: C,
        domain: Option<&Domain>,
        opaque: Opaque,
    ) -> Result<CallbackId> {
        let session = self.session()?;
        let token = session.subscribe(event_id, domain)?;

        match self.inner.registry.insert(
            event_id,
            domain.cloned(),
            Arc::new(callback),
            opaque,
            token,
        ) {
            Ok(id) => {
                info!(callback_id = %id, "Domain event callback registered");
                Ok(id)
            }
            Err(e) => {
                if let Err(unsubscribe_err) = session.unsubscribe(token) {
                    warn!(error = %unsubscribe_err, "Failed to withdraw orphaned subscription");
                }
                Err(e)
            }
        }
    }

    /// Remove a callback registered with [`register_any`](Connection::register_any).
    ///
    /// Once this returns the callback is never invoked again. Unknown or
    /// already removed ids fail with `InvalidArgument`. If the hypervisor
    /// then refuses to drop the subscription, the callback stays removed and
    /// the hypervisor's error is returned.
    #[instrument(skip(self), fields(connection_id = %self.inner.id))]
    pub fn deregister_any(&self, callback_id: CallbackId) -> Result<()> {
        let session = self.session()?;
        let registration = self
            .inner
            .dispatcher
            .quiesce(|| self.inner.registry.remove(callback_id))?;

        session.unsubscribe(registration.token)?;
        info!("Domain event callback deregistered");
        Ok(())
    }

    /// Install the single legacy callback, which receives every lifecycle
    /// event for every domain.
    ///
    /// Fails with `InvalidArgument` if one is already installed.
    #[instrument(skip(self, callback, opaque), fields(connection_id = %self.inner.id))]
    pub fn register<C: DomainEventCallback>(&self, callback: C, opaque: Opaque) -> Result<()> {
        let session = self.session()?;
        if self.inner.registry.legacy_active() {
            return Err(ConnectError::InvalidArgument(
                "a domain event callback is already registered; deregister it first".to_string(),
            ));
        }

        let token = session.subscribe(EventId::Lifecycle, None)?;
        let record = LegacyCallback {
            callback: Arc::new(callback),
            opaque,
            token,
            registered_at: chrono::Utc::now(),
        };

        if let Err(e) = self.inner.registry.install_legacy(record) {
            if let Err(unsubscribe_err) = session.unsubscribe(token) {
                warn!(error = %unsubscribe_err, "Failed to withdraw orphaned subscription");
            }
            return Err(e);
        }

        info!("Legacy domain event callback registered");
        Ok(())
    }

    /// Remove the legacy callback. Does nothing if none is installed.
    #[instrument(skip(self), fields(connection_id = %self.inner.id))]
    pub fn deregister(&self) -> Result<()> {
        let session = self.session()?;
        let taken = self
            .inner
            .dispatcher
            .quiesce(|| self.inner.registry.take_legacy())?;

        match taken {
            Some(legacy) => {
                session.unsubscribe(legacy.token)?;
                info!("Legacy domain event callback deregistered");
            }
            None => debug!("No legacy domain event callback registered"),
        }
        Ok(())
    }

    /// Ids of the active `register_any` registrations, in registration order.
    pub fn callback_ids(&self) -> Result<Vec<CallbackId>> {
        self.session()?;
        self.inner.registry.ids()
    }

    pub fn has_legacy_callback(&self) -> Result<bool> {
        self.session()?;
        Ok(self.inner.registry.legacy_active())
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Wait until every notification queued so far has been delivered.
    pub async fn flush_events(&self) -> Result<()> {
        self.session()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .tx
            .send(Envelope::Flush(ack_tx))
            .map_err(|_| ConnectError::closed())?;
        ack_rx.await.map_err(|_| ConnectError::closed())
    }

    /// Counters of the dispatcher. Available after close.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.inner.dispatcher.stats()
    }

    /// Receive every callback failure in addition to the warning log.
    ///
    /// The hook runs on the dispatcher task and should return quickly.
    pub fn set_callback_error_hook(&self, hook: Option<CallbackErrorHook>) {
        self.inner.dispatcher.set_error_hook(hook);
    }
}

/// Pick the driver for a URI scheme.
fn driver_for(uri: &ConnectUri) -> Result<Arc<dyn HypervisorDriver>> {
    match uri.driver() {
        "test" => Ok(Arc::new(MockHost::test_host())),
        "qemu" | "kvm" | "xen" | "lxc" | "bhyve" | "vbox" | "esx" => libvirt_driver(),
        other => Err(ConnectError::ConnectionFailed(format!(
            "no hypervisor driver for URI scheme '{}'",
            other
        ))),
    }
}

#[cfg(feature = "libvirt")]
fn libvirt_driver() -> Result<Arc<dyn HypervisorDriver>> {
    Ok(Arc::new(crate::libvirt::LibvirtDriver::new()))
}

#[cfg(not(feature = "libvirt"))]
fn libvirt_driver() -> Result<Arc<dyn HypervisorDriver>> {
    Err(ConnectError::ConnectionFailed(
        "libvirt support not compiled in (enable the 'libvirt' feature)".to_string(),
    ))
}

/// Parse a textual NUMA cell argument such as a CLI value.
///
/// Non-numeric input is the wrong kind of argument; a negative number is an
/// invalid one.
pub fn parse_cell_argument(arg: &str) -> Result<u32> {
    let arg = arg.trim();
    match arg.parse::<i64>() {
        Ok(value) => u32::try_from(value).map_err(|_| {
            ConnectError::InvalidArgument(format!("cell index {} out of range", value))
        }),
        Err(_) => Err(ConnectError::WrongType(format!(
            "expected an integer cell index, got '{}'",
            arg
        ))),
    }
}
