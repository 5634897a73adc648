//! Event callbacks that report domain events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use limiquantix_connect::{
    describe_event, CallbackId, Connection, Domain, DomainEventCallback, EventId, Opaque,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, OutputFormat};

/// One reported event, as printed in JSON mode.
#[derive(Debug, Serialize)]
pub struct EventRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub connection: String,
    pub domain: &'a str,
    pub uuid: String,
    pub event_id: EventId,
    pub event: i32,
    pub detail: i32,
    pub description: String,
}

/// Reports every event of one kind.
///
/// The registration's opaque data is the shared event counter.
pub struct EventPrinter {
    event_id: EventId,
    format: OutputFormat,
}

impl EventPrinter {
    pub fn new(event_id: EventId, format: OutputFormat) -> Self {
        Self { event_id, format }
    }

    fn record<'a>(&self, conn: &Connection, domain: &'a Domain, event: i32, detail: i32) -> EventRecord<'a> {
        EventRecord {
            timestamp: Utc::now(),
            connection: conn.id().to_string(),
            domain: &domain.name,
            uuid: domain.uuid.to_string(),
            event_id: self.event_id,
            event,
            detail,
            description: describe_event(self.event_id, event, detail),
        }
    }
}

impl DomainEventCallback for EventPrinter {
    fn call(
        &self,
        conn: &Connection,
        domain: &Domain,
        event: i32,
        detail: i32,
        opaque: &Opaque,
    ) -> anyhow::Result<()> {
        if let Some(counter) = opaque.downcast_ref::<AtomicU64>() {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let record = self.record(conn, domain, event, detail);
        match self.format {
            OutputFormat::Log => info!(
                domain = %record.domain,
                uuid = %record.uuid,
                event_id = %record.event_id,
                event = record.event,
                detail = record.detail,
                "{}",
                record.description
            ),
            OutputFormat::Json => {
                let line = serde_json::to_string(&record).context("Failed to encode event")?;
                println!("{}", line);
            }
        }
        Ok(())
    }
}

/// Callbacks installed on a connection.
pub struct Subscriptions {
    ids: Vec<CallbackId>,
    legacy: bool,
    seen: Arc<AtomicU64>,
}

impl Subscriptions {
    /// Register callbacks for the configured events.
    pub async fn install(conn: &Connection, config: &Config) -> Result<Self> {
        let seen = Arc::new(AtomicU64::new(0));
        let format = config.output.format;

        if config.events.legacy {
            if config.events.domain.is_some() {
                warn!("Domain filter is ignored by the legacy callback");
            }
            conn.register(
                EventPrinter::new(EventId::Lifecycle, format),
                Opaque::from_arc(seen.clone()),
            )
            .context("Failed to register legacy callback")?;
            info!("Watching lifecycle events through the legacy callback");
            return Ok(Self { ids: Vec::new(), legacy: true, seen });
        }

        let domain = match &config.events.domain {
            Some(name) => Some(
                conn.lookup_domain_by_name(name)
                    .await
                    .with_context(|| format!("Cannot filter on domain '{}'", name))?,
            ),
            None => None,
        };

        let mut ids = Vec::new();
        for event_id in config.events.event_ids()? {
            let id = conn
                .register_any(
                    event_id,
                    EventPrinter::new(event_id, format),
                    domain.as_ref(),
                    Opaque::from_arc(seen.clone()),
                )
                .with_context(|| format!("Failed to register callback for {} events", event_id))?;
            info!(
                callback_id = %id,
                event_id = %event_id,
                domain = domain.as_ref().map(|d| d.name.as_str()).unwrap_or("*"),
                "Watching domain events"
            );
            ids.push(id);
        }

        Ok(Self { ids, legacy: false, seen })
    }

    /// Number of events reported so far.
    pub fn events_seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    /// Remove every installed callback, logging failures.
    pub fn remove(&self, conn: &Connection) {
        for id in &self.ids {
            if let Err(e) = conn.deregister_any(*id) {
                warn!(callback_id = %id, error = %e, "Failed to deregister callback");
            }
        }
        if self.legacy {
            if let Err(e) = conn.deregister() {
                warn!(error = %e, "Failed to deregister legacy callback");
            }
        }
    }
}
