//! # limiquantix Event Monitor
//!
//! Opens a hypervisor connection, prints host information and reports domain
//! events until interrupted.
//!
//! ## Features
//! - Per-event callbacks with optional domain filter
//! - Legacy single lifecycle callback
//! - Log or JSON-lines output
//! - Development mode against a mock host with a demo workload
//!
//! ## Usage
//! ```bash
//! limiquantix-eventmon --uri qemu:///system --event lifecycle --event reboot
//! limiquantix-eventmon --dev --json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use limiquantix_connect::{Connection, MockHost, VersionTriple};

mod cli;
mod config;
mod demo;
mod monitor;

use cli::Args;
use config::{Config, ConnectionConfig};
use monitor::Subscriptions;

const DEFAULT_CONFIG_PATH: &str = "/etc/limiquantix/eventmon.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    limiquantix_common::init_logging_with_format(&args.log_level, args.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting limiquantix Event Monitor"
    );

    let config = load_config(&args)?;

    if let Err(e) = run(config).await {
        error!(error = %e, "Event monitor failed");
        return Err(e);
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    Ok(cfg.with_cli_overrides(args))
                }
                Err(e) => {
                    error!(error = %e, path = %config_path, "Failed to load configuration");
                    Err(e)
                }
            }
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                Ok(cfg.with_cli_overrides(args))
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Ok(Config::default().with_cli_overrides(args))
            }
        },
    }
}

async fn run(config: Config) -> Result<()> {
    let (conn, workload) = if config.dev.enabled {
        let host = MockHost::new();
        demo::define_domains(&host, &config.dev);
        let conn = Connection::open_with(&host, &config.connection.uri)
            .await
            .context("Failed to open mock connection")?;
        let workload = demo::spawn(host, config.dev.clone());
        (conn, Some(workload))
    } else {
        (open_connection(&config.connection).await?, None)
    };

    info!(
        uri = %config.connection.uri,
        driver = conn.driver_name(),
        read_only = conn.is_read_only()?,
        dev = config.dev.enabled,
        "Connected to hypervisor"
    );
    log_host_info(&conn).await;

    let subscriptions = match Subscriptions::install(&conn, &config).await {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            if let Err(close_err) = conn.close().await {
                warn!(error = %close_err, "Failed to close connection");
            }
            return Err(e);
        }
    };

    info!("Watching for domain events, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    if let Some(workload) = workload {
        workload.abort();
    }

    subscriptions.remove(&conn);
    if let Err(e) = conn.flush_events().await {
        warn!(error = %e, "Failed to flush pending events");
    }

    let stats = conn.dispatch_stats();
    info!(
        events_reported = subscriptions.events_seen(),
        received = stats.received,
        delivered = stats.delivered,
        discarded = stats.discarded,
        callback_failures = stats.callback_failures,
        "Dispatch statistics"
    );

    conn.close().await.context("Failed to close connection")?;
    info!("Event monitor stopped");
    Ok(())
}

#[cfg(feature = "libvirt")]
async fn open_connection(config: &ConnectionConfig) -> Result<Connection> {
    use limiquantix_connect::{ConnectUri, LibvirtDriver};

    let uri = ConnectUri::parse(&config.uri)?;
    let conn = if uri.driver() == "test" {
        if config.read_only {
            Connection::open_read_only(&config.uri).await
        } else {
            Connection::open(&config.uri).await
        }
    } else {
        let driver = LibvirtDriver::new().with_poll_interval(config.poll_interval());
        if config.read_only {
            Connection::open_read_only_with(&driver, &config.uri).await
        } else {
            Connection::open_with(&driver, &config.uri).await
        }
    };
    conn.with_context(|| format!("Failed to connect to {}", config.uri))
}

#[cfg(not(feature = "libvirt"))]
async fn open_connection(config: &ConnectionConfig) -> Result<Connection> {
    let conn = if config.read_only {
        Connection::open_read_only(&config.uri).await
    } else {
        Connection::open(&config.uri).await
    };
    conn.with_context(|| format!("Failed to connect to {}", config.uri))
}

/// Log what the hypervisor reports about itself. Failures are not fatal.
async fn log_host_info(conn: &Connection) {
    match conn.hypervisor_type().await {
        Ok(hypervisor) => {
            let version = conn.version().await.map(VersionTriple::from);
            let lib_version = conn.lib_version().await.map(VersionTriple::from);
            info!(
                hypervisor = %hypervisor,
                version = %version.map(|v| v.to_string()).unwrap_or_else(|_| "unknown".to_string()),
                lib_version = %lib_version.map(|v| v.to_string()).unwrap_or_else(|_| "unknown".to_string()),
                "Hypervisor"
            );
        }
        Err(e) => warn!(error = %e, "Failed to query hypervisor type"),
    }

    match conn.hostname().await {
        Ok(hostname) => info!(hostname = %hostname, "Host"),
        Err(e) => warn!(error = %e, "Failed to query hostname"),
    }

    match conn.node_info().await {
        Ok(node) => info!(
            model = %node.model,
            cpus = node.cpus,
            memory_mib = node.memory_kib / 1024,
            numa_nodes = node.nodes,
            "Node"
        ),
        Err(e) => warn!(error = %e, "Failed to query node info"),
    }

    if let (Ok(encrypted), Ok(secure)) = (conn.is_encrypted().await, conn.is_secure().await) {
        info!(encrypted, secure, "Transport");
    }

    match conn.list_all_domains().await {
        Ok(domains) => {
            let active = domains.iter().filter(|d| d.state.is_active()).count();
            info!(total = domains.len(), active, "Domains");
        }
        Err(e) => warn!(error = %e, "Failed to list domains"),
    }
}
