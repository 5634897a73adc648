//! Fan-out of hypervisor notifications to registered callbacks.
//!
//! Each connection runs one dispatcher task that drains the connection's
//! delivery channel. A notification is delivered to the matching
//! registrations in registration order and then, for lifecycle events, to
//! the legacy callback. Callback errors and panics are contained, counted and
//! reported; they never stop delivery to the remaining callbacks.
//!
//! Removing a callback waits on the delivery gate, so once a removal returns
//! the callback is not invoked again. A callback that removes itself (or
//! another callback) runs on the delivering thread and skips the gate.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::callback::{CallbackErrorHook, CallbackFailure, CallbackTarget, DomainEventCallback, Opaque};
use crate::connection::{Connection, ConnectionInner};
use crate::driver::Envelope;
use crate::event::describe_event;
use crate::registry::EventRegistry;
use crate::types::{ConnectionId, Notification};

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No active callback was interested, or the notification belonged to
    /// another connection
    Discarded,
    /// At least one callback was invoked
    Delivered {
        invoked: usize,
        failed: usize,
    },
}

/// Counters for one connection's dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Notifications taken off the delivery channel
    pub received: u64,
    /// Notifications that reached at least one callback
    pub delivered: u64,
    /// Notifications nobody was interested in
    pub discarded: u64,
    /// Callback invocations that returned an error or panicked
    pub callback_failures: u64,
}

#[derive(Default)]
struct DispatchCounters {
    received: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
    callback_failures: AtomicU64,
}

impl DispatchCounters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}

/// Delivers notifications for one connection.
pub(crate) struct Dispatcher {
    connection: ConnectionId,
    registry: Arc<EventRegistry>,
    /// Held for the whole delivery of one notification
    gate: Mutex<()>,
    /// Thread currently inside `deliver`, if any
    delivering_on: Mutex<Option<ThreadId>>,
    counters: DispatchCounters,
    error_hook: RwLock<Option<CallbackErrorHook>>,
}

/// Marks the current thread as delivering until dropped.
struct DeliveringGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DeliveringGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        Self { slot }
    }
}

impl Drop for DeliveringGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Dispatcher {
    pub fn new(connection: ConnectionId, registry: Arc<EventRegistry>) -> Self {
        Self {
            connection,
            registry,
            gate: Mutex::new(()),
            delivering_on: Mutex::new(None),
            counters: DispatchCounters::default(),
            error_hook: RwLock::new(None),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn set_error_hook(&self, hook: Option<CallbackErrorHook>) {
        *self.error_hook.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    fn on_delivering_thread(&self) -> bool {
        let delivering = *self.delivering_on.lock().unwrap_or_else(PoisonError::into_inner);
        delivering == Some(thread::current().id())
    }

    /// Run `f` while no notification is being delivered.
    ///
    /// Called from inside a callback, `f` runs immediately. The check is per
    /// thread: work a callback delegates to another thread blocks until the
    /// delivery is over.
    pub fn quiesce<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.on_delivering_thread() {
            return f();
        }
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Deliver one notification to every interested callback.
    pub fn deliver(&self, conn: &Connection, notification: &Notification) -> DeliveryOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if notification.connection != self.connection {
            warn!(
                connection_id = %self.connection,
                foreign_connection_id = %notification.connection,
                "Discarding notification addressed to another connection"
            );
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return DeliveryOutcome::Discarded;
        }

        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let _delivering = DeliveringGuard::enter(&self.delivering_on);

        let matches = match self.registry.match_set(notification.event_id, &notification.domain) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(error = %e, "Failed to resolve callbacks, discarding notification");
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return DeliveryOutcome::Discarded;
            }
        };

        if matches.is_empty() {
            trace!(
                event_id = %notification.event_id,
                domain = %notification.domain.name,
                "No callbacks registered, discarding notification"
            );
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return DeliveryOutcome::Discarded;
        }

        debug!(
            event_id = %notification.event_id,
            domain = %notification.domain.name,
            event = %describe_event(notification.event_id, notification.event, notification.detail),
            callbacks = matches.registrations.len(),
            legacy = matches.legacy.is_some(),
            "Delivering notification"
        );

        let mut invoked = 0;
        let mut failed = 0;

        for registration in &matches.registrations {
            // An earlier callback may have removed this one.
            if !self.registry.is_active(registration.id) {
                continue;
            }
            invoked += 1;
            let target = CallbackTarget::Registered(registration.id);
            if let Err(failure) = self.invoke(
                target,
                registration.callback.as_ref(),
                conn,
                notification,
                &registration.opaque,
            ) {
                failed += 1;
                self.report(failure);
            }
        }

        if let Some(legacy) = &matches.legacy {
            if self.registry.legacy_holds(legacy) {
                invoked += 1;
                if let Err(failure) = self.invoke(
                    CallbackTarget::Legacy,
                    legacy.callback.as_ref(),
                    conn,
                    notification,
                    &legacy.opaque,
                ) {
                    failed += 1;
                    self.report(failure);
                }
            }
        }

        if invoked == 0 {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return DeliveryOutcome::Discarded;
        }

        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        DeliveryOutcome::Delivered { invoked, failed }
    }

    fn invoke(
        &self,
        target: CallbackTarget,
        callback: &dyn DomainEventCallback,
        conn: &Connection,
        notification: &Notification,
        opaque: &Opaque,
    ) -> std::result::Result<(), CallbackFailure> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            callback.call(
                conn,
                &notification.domain,
                notification.event,
                notification.detail,
                opaque,
            )
        }));

        let (message, panicked) = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => (format!("{:#}", e), false),
            Err(payload) => (panic_message(payload.as_ref()), true),
        };

        Err(CallbackFailure {
            target,
            event_id: notification.event_id,
            domain: notification.domain.clone(),
            message,
            panicked,
        })
    }

    fn report(&self, failure: CallbackFailure) {
        self.counters.callback_failures.fetch_add(1, Ordering::Relaxed);

        warn!(
            target_callback = %failure.target,
            event_id = %failure.event_id,
            domain = %failure.domain.name,
            panicked = failure.panicked,
            error = %failure.message,
            "Domain event callback failed"
        );

        let hook = self
            .error_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(&failure);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}

// =============================================================================
// Worker Task
// =============================================================================

/// Spawn the task draining a connection's delivery channel.
///
/// The task holds only a weak reference so that dropping every `Connection`
/// handle tears the connection down.
pub(crate) fn spawn_worker(
    connection: Weak<ConnectionInner>,
    connection_id: ConnectionId,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(connection_id = %connection_id, "Dispatcher started");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!(connection_id = %connection_id, "Dispatcher shutdown requested");
                    break;
                }
                envelope = rx.recv() => match envelope {
                    Some(Envelope::Notify(notification)) => {
                        let Some(inner) = connection.upgrade() else {
                            break;
                        };
                        let conn = Connection::from_inner(inner);
                        conn.dispatcher().deliver(&conn, &notification);
                    }
                    Some(Envelope::Flush(ack)) => {
                        let _ = ack.send(());
                    }
                    None => break,
                },
            }
        }

        info!(connection_id = %connection_id, "Dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiesce_runs_closure() {
        let dispatcher = Dispatcher::new(ConnectionId::new(), Arc::new(EventRegistry::new()));
        assert_eq!(dispatcher.quiesce(|| 7), 7);
    }

    #[test]
    fn test_quiesce_skips_gate_on_delivering_thread() {
        let dispatcher = Dispatcher::new(ConnectionId::new(), Arc::new(EventRegistry::new()));
        let _gate = dispatcher.gate.lock().unwrap();
        let _delivering = DeliveringGuard::enter(&dispatcher.delivering_on);

        // Would deadlock if the gate were taken again.
        assert!(dispatcher.quiesce(|| true));
    }

    #[test]
    fn test_delivering_guard_clears_on_drop() {
        let dispatcher = Dispatcher::new(ConnectionId::new(), Arc::new(EventRegistry::new()));
        {
            let _delivering = DeliveringGuard::enter(&dispatcher.delivering_on);
            assert!(dispatcher.on_delivering_thread());
        }
        assert!(!dispatcher.on_delivering_thread());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "callback panicked");
    }

    #[test]
    fn test_stats_start_at_zero() {
        let dispatcher = Dispatcher::new(ConnectionId::new(), Arc::new(EventRegistry::new()));
        assert_eq!(dispatcher.stats(), DispatchStats::default());
    }
}
