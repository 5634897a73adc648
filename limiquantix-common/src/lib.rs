//! # limiquantix Common
//!
//! Shared utilities for the limiquantix connect tooling.
//!
//! ## Logging
//!
//! ```no_run
//! use limiquantix_common::{init_logging_with_format, LogFormat};
//!
//! init_logging_with_format("info", LogFormat::Pretty).unwrap();
//! tracing::info!(uri = "qemu:///system", "Connected");
//! ```

pub mod logging;

pub use logging::{
    init_logging,
    init_logging_json,
    init_logging_with_format,
    LogFormat,
};
