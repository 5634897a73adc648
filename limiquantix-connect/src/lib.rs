//! # limiquantix Connect
//!
//! Hypervisor connection handle with asynchronous domain event subscription
//! and dispatch.
//!
//! A [`Connection`] owns one session to a hypervisor. Besides host queries
//! (type, versions, node info, CPU comparison), it lets callers register
//! callbacks for domain events. Each connection runs its own dispatcher
//! task that delivers events in order, one callback at a time, isolating
//! callback failures from each other.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    Connection                    │
//! │  register_any / deregister_any / register / ...  │
//! └───────┬─────────────────────────────┬────────────┘
//!         │                             │
//!         ▼                             ▼
//! ┌────────────────┐  match   ┌───────────────────┐
//! │ EventRegistry  │◄─────────│    Dispatcher     │◄── NotificationSink
//! │ + legacy slot  │          │ (one task / conn) │
//! └────────────────┘          └───────────────────┘
//!                                       ▲
//!                   ┌───────────────────┴───────────┐
//!                   │  HypervisorDriver / Session   │
//!                   │   (MockHost, LibvirtDriver)   │
//!                   └───────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use limiquantix_connect::{callback_fn, Connection, EventId, MockHost, Opaque};
//!
//! #[tokio::main]
//! async fn main() -> limiquantix_connect::Result<()> {
//!     let host = MockHost::new();
//!     let conn = Connection::open_with(&host, "qemu:///system").await?;
//!
//!     let id = conn.register_any(
//!         EventId::Lifecycle,
//!         callback_fn(|_conn, domain, event, detail, _opaque| {
//!             println!("{}: {} {}", domain.name, event, detail);
//!             Ok(())
//!         }),
//!         None,
//!         Opaque::none(),
//!     )?;
//!
//!     host.define_domain("web-1")?;
//!     conn.flush_events().await?;
//!
//!     conn.deregister_any(id)?;
//!     conn.close().await
//! }
//! ```

pub mod callback;
pub mod connection;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod event;
pub mod legacy;
pub mod libvirt;
pub mod mock;
pub mod registry;
pub mod types;
pub mod uri;

pub use callback::{
    callback_fn, CallbackErrorHook, CallbackFailure, CallbackTarget, DomainEventCallback, Opaque,
};
pub use connection::{parse_cell_argument, Connection};
pub use dispatcher::{DeliveryOutcome, DispatchStats};
pub use driver::{HypervisorDriver, HypervisorSession, NotificationSink};
pub use error::{ConnectError, ErrorKind, Result};
pub use event::{
    describe_event, DefinedDetail, EventId, GraphicsPhase, IoErrorAction, LifecycleEvent,
    ResumedDetail, StartedDetail, StoppedDetail, SuspendedDetail, UndefinedDetail,
    WatchdogAction,
};
pub use legacy::{LegacyCallback, LegacyCallbackSlot};
pub use mock::{HostCpu, MockHost, MockHostConfig};
pub use registry::{EventRegistration, EventRegistry};
pub use types::*;
pub use uri::ConnectUri;

// Re-export libvirt driver when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDriver;
