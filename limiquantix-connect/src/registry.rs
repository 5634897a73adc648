//! Callback registrations of one connection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::callback::{DomainEventCallback, Opaque};
use crate::error::{ConnectError, Result};
use crate::event::EventId;
use crate::legacy::{LegacyCallback, LegacyCallbackSlot};
use crate::types::{CallbackId, Domain, SubscriptionToken};

/// One active `register_any` registration.
pub struct EventRegistration {
    pub id: CallbackId,
    pub event_id: EventId,
    /// Only events for this domain are delivered when set
    pub domain: Option<Domain>,
    pub callback: Arc<dyn DomainEventCallback>,
    pub opaque: Opaque,
    /// Hypervisor-side subscription backing this registration
    pub token: SubscriptionToken,
    pub registered_at: DateTime<Utc>,
}

impl EventRegistration {
    /// True if an event of this kind for this domain should reach the callback.
    pub fn matches(&self, event_id: EventId, domain: &Domain) -> bool {
        self.event_id == event_id && self.domain.as_ref().map_or(true, |filter| filter == domain)
    }
}

impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("id", &self.id)
            .field("event_id", &self.event_id)
            .field("domain", &self.domain)
            .field("opaque", &self.opaque)
            .field("token", &self.token)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

struct RegistryState {
    last_id: u32,
    registrations: BTreeMap<CallbackId, Arc<EventRegistration>>,
    legacy: LegacyCallbackSlot,
    /// Set by `drain`; no registration is accepted afterwards
    closed: bool,
}

/// Everything the dispatcher needs to deliver one notification.
pub(crate) struct MatchSet {
    pub registrations: Vec<Arc<EventRegistration>>,
    pub legacy: Option<Arc<LegacyCallback>>,
}

impl MatchSet {
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.legacy.is_none()
    }
}

/// Registrations and the legacy slot, guarded by a single mutex.
///
/// Callback ids are handed out from 1 upwards and never reused for the life
/// of the registry. Iteration follows id order, which is registration order.
pub struct EventRegistry {
    state: Mutex<RegistryState>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                last_id: 0,
                registrations: BTreeMap::new(),
                legacy: LegacyCallbackSlot::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state.lock().map_err(|_| ConnectError::poisoned())
    }

    // =========================================================================
    // Registrations
    // =========================================================================

    /// Store a registration and return its new id.
    ///
    /// Fails with `OperationInvalid` once the registry has been drained.
    pub fn insert(
        &self,
        event_id: EventId,
        domain: Option<Domain>,
        callback: Arc<dyn DomainEventCallback>,
        opaque: Opaque,
        token: SubscriptionToken,
    ) -> Result<CallbackId> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(ConnectError::closed());
        }

        let next = state
            .last_id
            .checked_add(1)
            .ok_or_else(|| ConnectError::Internal("callback IDs exhausted".to_string()))?;
        state.last_id = next;

        let id = CallbackId(next);
        state.registrations.insert(
            id,
            Arc::new(EventRegistration {
                id,
                event_id,
                domain,
                callback,
                opaque,
                token,
                registered_at: Utc::now(),
            }),
        );

        debug!(callback_id = %id, event_id = %event_id, "Registration stored");
        Ok(id)
    }

    /// Remove a registration. Unknown or already removed ids are rejected.
    pub fn remove(&self, id: CallbackId) -> Result<Arc<EventRegistration>> {
        self.lock()?
            .registrations
            .remove(&id)
            .ok_or_else(|| ConnectError::InvalidArgument(format!("invalid callback ID {}", id)))
    }

    pub fn is_active(&self, id: CallbackId) -> bool {
        self.lock()
            .map(|state| state.registrations.contains_key(&id))
            .unwrap_or(false)
    }

    /// Active registrations for this event and domain, in registration order.
    pub fn lookup_matching(
        &self,
        event_id: EventId,
        domain: &Domain,
    ) -> Result<Vec<Arc<EventRegistration>>> {
        Ok(self
            .lock()?
            .registrations
            .values()
            .filter(|registration| registration.matches(event_id, domain))
            .cloned()
            .collect())
    }

    /// Registrations plus, for lifecycle events, the legacy callback.
    pub(crate) fn match_set(&self, event_id: EventId, domain: &Domain) -> Result<MatchSet> {
        let registrations = self.lookup_matching(event_id, domain)?;
        let legacy = match event_id {
            EventId::Lifecycle => self.legacy()?,
            _ => None,
        };
        Ok(MatchSet { registrations, legacy })
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.registrations.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all active registrations.
    pub fn ids(&self) -> Result<Vec<CallbackId>> {
        Ok(self.lock()?.registrations.keys().copied().collect())
    }

    // =========================================================================
    // Legacy Slot
    // =========================================================================

    /// Fails with `OperationInvalid` once the registry has been drained.
    pub fn install_legacy(&self, callback: LegacyCallback) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(ConnectError::closed());
        }
        state.legacy.install(callback)
    }

    pub fn take_legacy(&self) -> Result<Option<Arc<LegacyCallback>>> {
        Ok(self.lock()?.legacy.take())
    }

    pub fn legacy(&self) -> Result<Option<Arc<LegacyCallback>>> {
        Ok(self.lock()?.legacy.current())
    }

    pub fn legacy_active(&self) -> bool {
        self.lock().map(|state| state.legacy.is_active()).unwrap_or(false)
    }

    /// True while `callback` is still the installed legacy record.
    pub fn legacy_holds(&self, callback: &Arc<LegacyCallback>) -> bool {
        self.lock()
            .map(|state| state.legacy.holds(callback))
            .unwrap_or(false)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Remove every registration, empty the legacy slot and refuse any
    /// further registration.
    pub fn drain(&self) -> Result<(Vec<Arc<EventRegistration>>, Option<Arc<LegacyCallback>>)> {
        let mut state = self.lock()?;
        state.closed = true;
        let registrations = std::mem::take(&mut state.registrations)
            .into_values()
            .collect();
        Ok((registrations, state.legacy.take()))
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}
