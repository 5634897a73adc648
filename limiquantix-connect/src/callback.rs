//! Event callbacks and the opaque data handed back to them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::event::EventId;
use crate::types::{CallbackId, Domain};

/// Caller-supplied value stored with a registration and passed back
/// unchanged on every invocation.
///
/// Clones share the same allocation, so a callback sees exactly the value
/// it was registered with.
#[derive(Clone, Default)]
pub struct Opaque(Option<Arc<dyn Any + Send + Sync>>);

impl Opaque {
    /// No opaque data.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    /// Wrap an existing shared value without re-allocating it.
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(Some(value))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }

    /// True when both refer to the same allocation (or both are empty).
    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Opaque(..)"),
            None => f.write_str("Opaque(None)"),
        }
    }
}

/// A domain event callback.
///
/// Invoked with the connection, the domain, the event code, the detail code
/// and the registration's opaque data. Returning an error (or panicking) is
/// reported and isolated; it never stops delivery to other callbacks.
///
/// A callback may register and deregister on its own connection directly.
/// It must not hand a deregistration (or `close`) to another thread and wait
/// for it: that thread waits for the current delivery to end, which never
/// happens.
pub trait DomainEventCallback: Send + Sync + 'static {
    fn call(
        &self,
        conn: &Connection,
        domain: &Domain,
        event: i32,
        detail: i32,
        opaque: &Opaque,
    ) -> anyhow::Result<()>;
}

impl<F> DomainEventCallback for F
where
    F: Fn(&Connection, &Domain, i32, i32, &Opaque) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn call(
        &self,
        conn: &Connection,
        domain: &Domain,
        event: i32,
        detail: i32,
        opaque: &Opaque,
    ) -> anyhow::Result<()> {
        self(conn, domain, event, detail, opaque)
    }
}

/// Pin a closure to the callback signature.
///
/// Free functions can be registered directly; closures need their argument
/// types fixed, which this does:
///
/// ```
/// use limiquantix_connect::callback_fn;
///
/// let cb = callback_fn(|_conn, domain, event, detail, _opaque| {
///     println!("{}: {} {}", domain.name, event, detail);
///     Ok(())
/// });
/// # let _ = cb;
/// ```
pub fn callback_fn<F>(f: F) -> F
where
    F: Fn(&Connection, &Domain, i32, i32, &Opaque) -> anyhow::Result<()> + Send + Sync + 'static,
{
    f
}

/// Which callback a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackTarget {
    /// A callback registered through `register_any`
    Registered(CallbackId),
    /// The legacy lifecycle callback
    Legacy,
}

impl fmt::Display for CallbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackTarget::Registered(id) => write!(f, "callback {}", id),
            CallbackTarget::Legacy => f.write_str("legacy callback"),
        }
    }
}

/// A callback that failed while handling an event.
#[derive(Debug, Clone)]
pub struct CallbackFailure {
    pub target: CallbackTarget,
    pub event_id: EventId,
    pub domain: Domain,
    /// Error message, or the panic payload if the callback panicked
    pub message: String,
    pub panicked: bool,
}

/// Side channel receiving callback failures.
pub type CallbackErrorHook = Arc<dyn Fn(&CallbackFailure) + Send + Sync>;
