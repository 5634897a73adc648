//! The single unfiltered lifecycle callback kept for older callers.
//!
//! A connection has at most one legacy callback. It receives every lifecycle
//! event for every domain, after all `register_any` callbacks.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::callback::{DomainEventCallback, Opaque};
use crate::error::{ConnectError, Result};
use crate::types::SubscriptionToken;

/// The record held by an active slot.
pub struct LegacyCallback {
    pub callback: Arc<dyn DomainEventCallback>,
    pub opaque: Opaque,
    pub token: SubscriptionToken,
    pub registered_at: DateTime<Utc>,
}

impl fmt::Debug for LegacyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyCallback")
            .field("opaque", &self.opaque)
            .field("token", &self.token)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

/// Zero-or-one legacy callback.
///
/// Lives inside the registry state and is only touched under the registry
/// lock.
#[derive(Debug, Default)]
pub struct LegacyCallbackSlot {
    active: Option<Arc<LegacyCallback>>,
}

impl LegacyCallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Fill the slot. Fails if a callback is already installed.
    pub fn install(&mut self, callback: LegacyCallback) -> Result<()> {
        if self.active.is_some() {
            return Err(ConnectError::InvalidArgument(
                "a domain event callback is already registered; deregister it first".to_string(),
            ));
        }
        self.active = Some(Arc::new(callback));
        Ok(())
    }

    /// Empty the slot, returning what was there.
    pub fn take(&mut self) -> Option<Arc<LegacyCallback>> {
        self.active.take()
    }

    pub fn current(&self) -> Option<Arc<LegacyCallback>> {
        self.active.clone()
    }

    /// True when `callback` is still the installed record.
    ///
    /// A record taken and replaced by a new registration does not count.
    pub fn holds(&self, callback: &Arc<LegacyCallback>) -> bool {
        self.active
            .as_ref()
            .map_or(false, |active| Arc::ptr_eq(active, callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback_fn;
    use crate::error::ErrorKind;

    fn record(token: u64) -> LegacyCallback {
        LegacyCallback {
            callback: Arc::new(callback_fn(|_, _, _, _, _| Ok(()))),
            opaque: Opaque::none(),
            token: SubscriptionToken(token),
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_second_install_rejected() {
        let mut slot = LegacyCallbackSlot::new();
        slot.install(record(1)).unwrap();

        let err = slot.install(record(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(slot.current().unwrap().token, SubscriptionToken(1));
    }

    #[test]
    fn test_take_then_reinstall() {
        let mut slot = LegacyCallbackSlot::new();
        assert!(slot.take().is_none());

        slot.install(record(1)).unwrap();
        let old = slot.take().unwrap();
        assert!(!slot.is_active());

        slot.install(record(2)).unwrap();
        assert!(!slot.holds(&old));
        assert!(slot.holds(&slot.current().unwrap()));
    }
}
