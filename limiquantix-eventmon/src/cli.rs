//! Command-line argument parsing.

use clap::Parser;
use limiquantix_common::LogFormat;

/// limiquantix Event Monitor - Watch hypervisor domain events
#[derive(Parser, Debug)]
#[command(name = "limiquantix-eventmon")]
#[command(about = "limiquantix Event Monitor - Watch hypervisor domain events")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "LIMIQUANTIX_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Hypervisor connection URI (e.g., qemu:///system, test:///default)
    #[arg(short, long, env = "LIMIQUANTIX_URI")]
    pub uri: Option<String>,

    /// Open the connection read-only
    #[arg(long)]
    pub read_only: bool,

    /// Event to watch, by name or number (repeatable; default: lifecycle)
    #[arg(short, long = "event")]
    pub events: Vec<String>,

    /// Only report events for this domain
    #[arg(short, long)]
    pub domain: Option<String>,

    /// Use the single legacy lifecycle callback instead of per-event callbacks
    #[arg(long)]
    pub legacy: bool,

    /// Print one JSON object per event on stdout instead of logging
    #[arg(long)]
    pub json: bool,

    /// Seconds between domain state polls (libvirt driver)
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Enable development mode (mock hypervisor with a demo workload)
    #[arg(long)]
    pub dev: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["limiquantix-eventmon"]).unwrap();
        assert_eq!(args.log_level, "info");
        assert_eq!(args.log_format, LogFormat::Pretty);
        assert!(args.events.is_empty());
        assert!(!args.dev);
        assert!(!args.json);
    }

    #[test]
    fn test_repeated_events() {
        let args = Args::try_parse_from([
            "limiquantix-eventmon",
            "--event",
            "lifecycle",
            "-e",
            "reboot",
            "--log-format",
            "json",
            "--domain",
            "web-1",
        ])
        .unwrap();
        assert_eq!(args.events, vec!["lifecycle", "reboot"]);
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.domain.as_deref(), Some("web-1"));
    }

    #[test]
    fn test_bad_log_format_rejected() {
        assert!(Args::try_parse_from(["limiquantix-eventmon", "--log-format", "xml"]).is_err());
    }
}
