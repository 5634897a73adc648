//! Lifecycle events synthesized from domain state polling.
//!
//! Polls libvirt at a fixed interval, diffs the domain list against the
//! previous poll and turns every change into lifecycle events. The first
//! poll only seeds the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;
use virt::connect::Connect;

use super::driver::list_domains;
use crate::driver::NotificationSink;
use crate::event::{
    DefinedDetail, EventId, LifecycleEvent, ResumedDetail, StartedDetail, StoppedDetail,
    SuspendedDetail, UndefinedDetail,
};
use crate::types::{Domain, DomainState, DomainSummary};

/// Lifecycle subscriptions by token, with their optional domain filter.
pub(super) type Subscriptions = Arc<Mutex<HashMap<u64, Option<Uuid>>>>;

/// Cached domain state for change detection
#[derive(Debug, Clone)]
struct CachedDomain {
    domain: Domain,
    state: DomainState,
}

struct LifecyclePoller {
    connection: Arc<Connect>,
    sink: NotificationSink,
    subscriptions: Subscriptions,
    cache: HashMap<Uuid, CachedDomain>,
    seeded: bool,
}

pub(super) fn spawn(
    connection: Arc<Connect>,
    sink: NotificationSink,
    subscriptions: Subscriptions,
    poll_interval: Duration,
) -> JoinHandle<()> {
    let mut poller = LifecyclePoller {
        connection,
        sink,
        subscriptions,
        cache: HashMap::new(),
        seeded: false,
    };

    tokio::spawn(async move {
        info!(poll_interval_ms = poll_interval.as_millis() as u64, "Starting lifecycle poller");
        let mut timer = interval(poll_interval);

        loop {
            timer.tick().await;
            if poller.sink.is_closed() {
                debug!("Connection gone, stopping lifecycle poller");
                break;
            }
            match list_domains(&poller.connection) {
                Ok(domains) => poller.reconcile(domains),
                Err(e) => warn!(error = %e, "Failed to poll domain states"),
            }
        }
    })
}

impl LifecyclePoller {
    fn reconcile(&mut self, domains: Vec<DomainSummary>) {
        let current: HashMap<Uuid, CachedDomain> = domains
            .into_iter()
            .map(|summary| {
                (
                    summary.domain.uuid,
                    CachedDomain { domain: summary.domain, state: summary.state },
                )
            })
            .collect();

        let previous = std::mem::replace(&mut self.cache, current);
        if !self.seeded {
            self.seeded = true;
            debug!(count = self.cache.len(), "Seeded domain state cache");
            return;
        }

        for (uuid, now) in &self.cache {
            let before = previous.get(uuid).map(|cached| cached.state);
            for (event, detail) in transitions(before, Some(now.state)) {
                self.publish(&now.domain, event, detail);
            }
        }
        for (uuid, gone) in &previous {
            if !self.cache.contains_key(uuid) {
                for (event, detail) in transitions(Some(gone.state), None) {
                    self.publish(&gone.domain, event, detail);
                }
            }
        }
    }

    fn publish(&self, domain: &Domain, event: LifecycleEvent, detail: i32) {
        let interested = self
            .subscriptions
            .lock()
            .map(|subs| {
                subs.values()
                    .any(|filter| filter.map_or(true, |uuid| uuid == domain.uuid))
            })
            .unwrap_or(false);

        if interested {
            debug!(domain = %domain.name, event = %event, "Publishing lifecycle event");
            self.sink.notify(domain.clone(), EventId::Lifecycle, event.code(), detail);
        }
    }
}

/// Lifecycle events explaining a state change; `None` means not defined.
pub(super) fn transitions(
    before: Option<DomainState>,
    after: Option<DomainState>,
) -> Vec<(LifecycleEvent, i32)> {
    use DomainState::*;

    let started = (LifecycleEvent::Started, StartedDetail::Booted.code());
    let stopped = |detail: StoppedDetail| (LifecycleEvent::Stopped, detail.code());

    match (before, after) {
        (None, None) => vec![],
        (None, Some(state)) => {
            let mut events = vec![(LifecycleEvent::Defined, DefinedDetail::Added.code())];
            if state.is_active() {
                events.push(started);
            }
            events
        }
        (Some(state), None) => {
            let mut events = Vec::new();
            if state.is_active() {
                events.push(stopped(StoppedDetail::Shutdown));
            }
            events.push((LifecycleEvent::Undefined, UndefinedDetail::Removed.code()));
            events
        }
        (Some(before), Some(after)) if before == after => vec![],
        (Some(before), Some(after)) => match after {
            Crashed => vec![stopped(StoppedDetail::Crashed)],
            Shutoff | NoState if before.is_active() => vec![stopped(StoppedDetail::Shutdown)],
            Shutoff | NoState => vec![],
            _ if !before.is_active() => {
                let mut events = vec![started];
                if after == Paused {
                    events.push((LifecycleEvent::Suspended, SuspendedDetail::Paused.code()));
                }
                events
            }
            Paused => vec![(LifecycleEvent::Suspended, SuspendedDetail::Paused.code())],
            Running | Blocked if before == Paused || before == PmSuspended => {
                vec![(LifecycleEvent::Resumed, ResumedDetail::Unpaused.code())]
            }
            Running | Blocked => vec![],
            Shutdown => vec![(LifecycleEvent::Shutdown, 0)],
            PmSuspended => vec![(LifecycleEvent::PmSuspended, 0)],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(before: Option<DomainState>, after: Option<DomainState>) -> Vec<LifecycleEvent> {
        transitions(before, after).into_iter().map(|(event, _)| event).collect()
    }

    #[test]
    fn test_transitions() {
        use DomainState::*;

        assert_eq!(events(None, Some(Shutoff)), vec![LifecycleEvent::Defined]);
        assert_eq!(
            events(None, Some(Running)),
            vec![LifecycleEvent::Defined, LifecycleEvent::Started]
        );
        assert_eq!(events(Some(Shutoff), Some(Running)), vec![LifecycleEvent::Started]);
        assert_eq!(events(Some(Running), Some(Paused)), vec![LifecycleEvent::Suspended]);
        assert_eq!(events(Some(Paused), Some(Running)), vec![LifecycleEvent::Resumed]);
        assert_eq!(events(Some(Running), Some(Shutoff)), vec![LifecycleEvent::Stopped]);
        assert_eq!(events(Some(Running), Some(Blocked)), vec![]);
        assert_eq!(
            events(Some(Running), None),
            vec![LifecycleEvent::Stopped, LifecycleEvent::Undefined]
        );
        assert_eq!(
            transitions(Some(Running), Some(Crashed)),
            vec![(LifecycleEvent::Stopped, StoppedDetail::Crashed.code())]
        );
        // The crash already reported the stop.
        assert_eq!(events(Some(Crashed), Some(Shutoff)), vec![]);
        assert_eq!(events(Some(Crashed), Some(Running)), vec![LifecycleEvent::Started]);
        assert_eq!(events(Some(Crashed), None), vec![LifecycleEvent::Undefined]);
    }
}
