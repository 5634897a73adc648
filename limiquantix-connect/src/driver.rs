//! Narrow interface to the hypervisor collaborator.
//!
//! The core never talks to a hypervisor directly. A [`HypervisorDriver`]
//! opens a [`HypervisorSession`] for a URI and hands it a
//! [`NotificationSink`] through which the session pushes domain events into
//! the owning connection's delivery channel.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Connection                   │
//! │  registry ─ dispatcher ◄── delivery channel   │
//! └───────────────────────┬───────────────▲───────┘
//!                         │ queries,      │ NotificationSink
//!                         ▼ subscribe     │
//!             ┌────────────────────────────┴──┐
//!             │      HypervisorSession        │
//!             └──────────────┬────────────────┘
//!                  ┌─────────┴─────────┐
//!                  ▼                   ▼
//!          ┌──────────────┐    ┌───────────────┐
//!          │   MockHost   │    │ LibvirtDriver │
//!          └──────────────┘    └───────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::event::EventId;
use crate::types::*;
use crate::uri::ConnectUri;

/// Opens sessions to a hypervisor.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Driver name for logs (e.g. "mock", "libvirt").
    fn name(&self) -> &'static str;

    /// Establish a session.
    ///
    /// Fails with `ConnectionFailed` when the endpoint is unreachable.
    async fn connect(
        &self,
        uri: &ConnectUri,
        sink: NotificationSink,
        read_only: bool,
    ) -> Result<Arc<dyn HypervisorSession>>;
}

/// One open session to a hypervisor.
///
/// Query methods fail with `Retrieve` when the hypervisor cannot answer.
#[async_trait]
pub trait HypervisorSession: Send + Sync {
    // =========================================================================
    // Session
    // =========================================================================

    /// Release the session. No further notifications may be pushed.
    async fn disconnect(&self) -> Result<()>;

    // =========================================================================
    // Host Queries
    // =========================================================================

    /// Hypervisor driver type (e.g. "QEMU").
    async fn hypervisor_type(&self) -> Result<String>;

    /// Hypervisor version, encoded as major * 1_000_000 + minor * 1_000 + micro.
    async fn version(&self) -> Result<u64>;

    /// Management library version, same encoding as `version`.
    async fn lib_version(&self) -> Result<u64>;

    async fn hostname(&self) -> Result<String>;

    /// Canonical URI of the session.
    async fn uri(&self) -> Result<String>;

    /// Maximum vCPUs for a guest type (`None` for the hypervisor default).
    async fn max_vcpus(&self, guest_type: Option<&str>) -> Result<u32>;

    async fn node_info(&self) -> Result<NodeInfo>;

    /// Free host memory in bytes.
    async fn node_free_memory(&self) -> Result<u64>;

    /// Free memory in bytes for `max_cells` NUMA cells starting at `start_cell`.
    async fn node_cells_free_memory(&self, start_cell: u32, max_cells: u32) -> Result<Vec<u64>>;

    async fn node_security_model(&self) -> Result<NodeSecurityModel>;

    async fn is_encrypted(&self) -> Result<bool>;

    async fn is_secure(&self) -> Result<bool>;

    /// Host capabilities XML.
    async fn capabilities(&self) -> Result<String>;

    /// Compare a CPU definition against the host CPU.
    async fn compare_cpu(&self, cpu_xml: &str) -> Result<CpuCompareResult>;

    /// Compute the most capable CPU compatible with all given definitions.
    async fn baseline_cpu(&self, cpu_xmls: &[String]) -> Result<String>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// All defined domains, active and inactive.
    async fn list_all_domains(&self) -> Result<Vec<DomainSummary>>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Ask the hypervisor to start sending events of this kind.
    ///
    /// With a domain, only that domain's events need to be sent.
    fn subscribe(&self, event_id: EventId, domain: Option<&Domain>) -> Result<SubscriptionToken>;

    /// Withdraw a subscription.
    fn unsubscribe(&self, token: SubscriptionToken) -> Result<()>;
}

/// Messages on a connection's delivery channel.
#[derive(Debug)]
pub(crate) enum Envelope {
    Notify(Notification),
    /// Resolved once every earlier message has been handled
    Flush(oneshot::Sender<()>),
}

/// Producer side of a connection's delivery channel.
///
/// Every notification pushed through a sink is stamped with the id of the
/// connection that owns it.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl NotificationSink {
    pub(crate) fn new(connection: ConnectionId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { connection, tx }
    }

    /// Connection this sink delivers to.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Push one event. Returns false once the connection is gone.
    pub fn notify(&self, domain: Domain, event_id: EventId, event: i32, detail: i32) -> bool {
        let notification = Notification {
            connection: self.connection,
            domain,
            event_id,
            event,
            detail,
            received_at: Utc::now(),
        };
        self.tx.send(Envelope::Notify(notification)).is_ok()
    }

    /// True once the receiving connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_sink_stamps_connection_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let sink = NotificationSink::new(id, tx);

        assert!(sink.notify(Domain::new("vm", Uuid::new_v4()), EventId::Reboot, 0, 0));

        match rx.recv().await {
            Some(Envelope::Notify(n)) => {
                assert_eq!(n.connection, id);
                assert_eq!(n.event_id, EventId::Reboot);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = NotificationSink::new(ConnectionId::new(), tx);
        drop(rx);

        assert!(sink.is_closed());
        assert!(!sink.notify(Domain::new("vm", Uuid::new_v4()), EventId::Lifecycle, 2, 0));
    }
}
