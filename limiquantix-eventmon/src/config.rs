//! Configuration management for the Event Monitor.

use anyhow::{Context, Result};
use limiquantix_connect::EventId;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor connection configuration
    pub connection: ConnectionConfig,
    /// Which events to watch
    pub events: EventsConfig,
    /// How events are reported
    pub output: OutputConfig,
    /// Development mode settings
    pub dev: DevConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref uri) = args.uri {
            self.connection.uri = uri.clone();
        }

        if args.read_only {
            self.connection.read_only = true;
        }

        if let Some(secs) = args.poll_interval {
            self.connection.poll_interval_secs = secs;
        }

        if !args.events.is_empty() {
            self.events.ids = args.events.clone();
        }

        if let Some(ref domain) = args.domain {
            self.events.domain = Some(domain.clone());
        }

        if args.legacy {
            self.events.legacy = true;
        }

        if args.json {
            self.output.format = OutputFormat::Json;
        }

        if args.dev {
            self.dev.enabled = true;
        }

        self
    }
}

/// Hypervisor connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connection URI
    pub uri: String,
    /// Open read-only
    pub read_only: bool,
    /// Domain state poll interval for the libvirt driver
    pub poll_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            read_only: false,
            poll_interval_secs: 2,
        }
    }
}

impl ConnectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Event selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Event names or numbers, e.g. `lifecycle`, `reboot`, `4`
    pub ids: Vec<String>,
    /// Restrict to one domain by name
    pub domain: Option<String>,
    /// Use the legacy lifecycle callback
    pub legacy: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ids: vec!["lifecycle".to_string()],
            domain: None,
            legacy: false,
        }
    }
}

impl EventsConfig {
    /// Resolve the configured names, dropping duplicates but keeping order.
    pub fn event_ids(&self) -> Result<Vec<EventId>> {
        let mut resolved = Vec::with_capacity(self.ids.len());
        for raw in &self.ids {
            let id: EventId = raw
                .parse()
                .with_context(|| format!("Invalid event '{}' in configuration", raw))?;
            if !resolved.contains(&id) {
                resolved.push(id);
            }
        }
        Ok(resolved)
    }
}

/// Output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

/// How each event is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Structured log line
    #[default]
    Log,
    /// JSON object on stdout
    Json,
}

/// Development mode configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    /// Run against an in-process mock host
    pub enabled: bool,
    /// Demo domains driven through their lifecycle
    pub domains: Vec<String>,
    /// Milliseconds between demo workload steps
    pub step_interval_ms: u64,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domains: vec!["demo-web".to_string(), "demo-db".to_string()],
            step_interval_ms: 1500,
        }
    }
}

impl DevConfig {
    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection.uri, "qemu:///system");
        assert_eq!(config.events.event_ids().unwrap(), vec![EventId::Lifecycle]);
        assert_eq!(config.output.format, OutputFormat::Log);
        assert!(!config.dev.enabled);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
connection:
  uri: "test:///default"
events:
  ids: [lifecycle, io_error, "1", lifecycle]
  domain: web-1
output:
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.connection.uri, "test:///default");
        assert_eq!(config.connection.poll_interval_secs, 2);
        assert_eq!(
            config.events.event_ids().unwrap(),
            vec![EventId::Lifecycle, EventId::IoError, EventId::Reboot]
        );
        assert_eq!(config.events.domain.as_deref(), Some("web-1"));
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.dev.domains.len(), 2);
    }

    #[test]
    fn test_invalid_event_name() {
        let events = EventsConfig { ids: vec!["hello".to_string()], ..Default::default() };
        assert!(events.event_ids().is_err());

        let events = EventsConfig { ids: vec!["456789".to_string()], ..Default::default() };
        assert!(events.event_ids().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "limiquantix-eventmon",
            "--uri",
            "test:///default",
            "--event",
            "reboot",
            "--json",
            "--dev",
            "--poll-interval",
            "5",
        ]);
        let config = Config::default().with_cli_overrides(&args);

        assert_eq!(config.connection.uri, "test:///default");
        assert_eq!(config.connection.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.events.ids, vec!["reboot"]);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert!(config.dev.enabled);
        assert!(!config.events.legacy);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/eventmon.yaml").is_err());
    }
}
