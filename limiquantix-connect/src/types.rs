//! Type definitions for connections, domains and host information.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventId;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Process-unique identity of one connection.
///
/// Notifications are stamped with it so that a shared event source can never
/// deliver into another connection's registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by `register_any`, used to deregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub u32);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hypervisor-side subscription handle, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

// =============================================================================
// DOMAINS
// =============================================================================

/// A managed virtual machine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    /// Domain name
    pub name: String,
    /// Domain UUID
    pub uuid: Uuid,
    /// Runtime id, only present while the domain is active
    pub id: Option<u32>,
}

impl Domain {
    pub fn new(name: impl Into<String>, uuid: Uuid) -> Self {
        Self { name: name.into(), uuid, id: None }
    }

    /// Set the runtime id.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }
}

/// Domains are the same instance when their UUIDs match; name and runtime
/// id change over a domain's life.
impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Domain {}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// Domain run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Active domains have a runtime id and count towards `num_of_domains`.
    /// A crashed domain is no longer running and counts as inactive.
    pub fn is_active(&self) -> bool {
        !matches!(self, DomainState::Shutoff | DomainState::NoState | DomainState::Crashed)
    }
}

/// A domain together with its current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSummary {
    pub domain: Domain,
    pub state: DomainState,
}

// =============================================================================
// HOST INFORMATION
// =============================================================================

/// Host hardware summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// CPU model string
    pub model: String,
    /// Memory size in KiB
    pub memory_kib: u64,
    /// Number of active CPUs
    pub cpus: u32,
    /// Expected CPU frequency in MHz
    pub mhz: u32,
    /// Number of NUMA cells
    pub nodes: u32,
    /// Sockets per node
    pub sockets: u32,
    /// Cores per socket
    pub cores: u32,
    /// Threads per core
    pub threads: u32,
}

/// Host security driver information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSecurityModel {
    /// Security model name (e.g. "selinux"), empty when none
    pub model: String,
    /// Domain of interpretation
    pub doi: String,
}

/// Outcome of comparing a CPU definition against the host CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuCompareResult {
    /// The host cannot run guests with this CPU
    Incompatible,
    /// The host CPU matches exactly
    Identical,
    /// The host CPU is a strict superset
    Superset,
}

impl CpuCompareResult {
    /// Map a libvirt-style comparison code to a result; -1 and unknown codes map to `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CpuCompareResult::Incompatible),
            1 => Some(CpuCompareResult::Identical),
            2 => Some(CpuCompareResult::Superset),
            _ => None,
        }
    }
}

/// A hypervisor version number split into its parts.
///
/// Versions are encoded as `major * 1_000_000 + minor * 1_000 + micro`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl From<u64> for VersionTriple {
    fn from(version: u64) -> Self {
        Self {
            major: (version / 1_000_000) as u32,
            minor: ((version / 1_000) % 1_000) as u32,
            micro: (version % 1_000) as u32,
        }
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// One hypervisor-originated domain event.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Connection the event was produced for
    pub connection: ConnectionId,
    /// Domain the event concerns
    pub domain: Domain,
    /// Event category
    pub event_id: EventId,
    /// Event code within the category (e.g. lifecycle "started")
    pub event: i32,
    /// Sub-reason qualifying the event code
    pub detail: i32,
    /// When the connection received the event
    pub received_at: DateTime<Utc>,
}
