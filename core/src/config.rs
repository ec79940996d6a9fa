//! Checker configuration and probe defaults
//!
//! All knobs are provided by the daemon's command line; this module holds the
//! shared defaults and validates the combination before anything connects to
//! the store.

use crate::{CheckerError, Result};
use hyper::Method;
use std::time::Duration;

/// HTTP method used for each probe
pub const DEFAULT_HTTP_METHOD: &str = "HEAD";
/// Request path probed on each backend
pub const DEFAULT_PROBE_URI: &str = "/CloudHealthCheck";
/// Host header sent with each probe
pub const DEFAULT_PROBE_HOST: &str = "ping";
/// User-Agent header sent with each probe
pub const DEFAULT_USER_AGENT: &str = concat!("hchecker/", env!("CARGO_PKG_VERSION"));
/// Probe cadence in seconds
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 3;
/// TCP dial timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 3;
/// Socket read/write deadline in seconds
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 3;
/// Network address of the shared Redis store
pub const DEFAULT_REDIS_ADDRESS: &str = "localhost:6379";

/// Runtime configuration for one checker process
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// HTTP method for probes
    pub http_method: String,
    /// Request path override; empty keeps the backend URL's own path
    pub probe_uri: String,
    /// Host header override; empty sends the backend's own authority
    pub probe_host: String,
    /// User-Agent header for probes
    pub user_agent: String,
    /// Interval between two probes of the same backend
    pub check_interval: Duration,
    /// TCP dial timeout
    pub connect_timeout: Duration,
    /// Socket read/write deadline after the dial
    pub io_timeout: Duration,
    /// Address of the shared Redis store
    pub redis_address: String,
    /// Optional suffix partitioning the store keyspace between fleets
    pub key_suffix: String,
    /// Suppress all mutating writes to proxy-visible state
    pub dry_run: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            http_method: DEFAULT_HTTP_METHOD.to_string(),
            probe_uri: DEFAULT_PROBE_URI.to_string(),
            probe_host: DEFAULT_PROBE_HOST.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            redis_address: DEFAULT_REDIS_ADDRESS.to_string(),
            key_suffix: String::new(),
            dry_run: false,
        }
    }
}

impl CheckerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if Method::from_bytes(self.http_method.as_bytes()).is_err() {
            return Err(CheckerError::Configuration(format!(
                "invalid HTTP method {:?}",
                self.http_method
            )));
        }
        if !self.probe_uri.is_empty() && !self.probe_uri.starts_with('/') {
            return Err(CheckerError::Configuration(format!(
                "probe URI must start with '/', got {:?}",
                self.probe_uri
            )));
        }
        if self.check_interval.is_zero() {
            return Err(CheckerError::Configuration(
                "check interval must be greater than 0".to_string(),
            ));
        }
        if self.redis_address.is_empty() {
            return Err(CheckerError::Configuration(
                "store address cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
