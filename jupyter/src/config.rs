//! Proxy configuration
//!
//! Defaults can be overridden through the environment:
//!
//! - `BEAKER_RUNTIME_DIR`: directory holding `kernel-<id>.json` connection
//!   files (falls back to `JUPYTER_RUNTIME_DIR`, then a temp directory)
//! - `BEAKER_KERNEL_INFO_TIMEOUT_MS`: how long to wait for a real
//!   `kernel_info_reply` before answering on the kernel's behalf (default 3000)
//! - `BEAKER_KERNEL_INFO_GRACE_MS`: how long after a placeholder reply a late
//!   real reply is still swallowed (default 60000)
//! - `BEAKER_DRAIN_MS`: how long an internal execution waits for straggling
//!   iopub output after its reply (default 200)
//! - `BEAKER_EXECUTE_TIMEOUT_MS`: outer timeout for internal executions
//!   (unset: wait for the reply forever)

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub runtime_dir: PathBuf,
    pub kernel_info_timeout: Duration,
    /// How long a request answered with the placeholder is remembered
    pub kernel_info_grace: Duration,
    pub drain_interval: Duration,
    pub execute_timeout: Option<Duration>,
    /// How long a kernel gets to acknowledge `shutdown_request`
    pub shutdown_grace: Duration,
    /// How long a launched kernel gets to start listening
    pub kernel_start_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir().join("beaker-runtime"),
            kernel_info_timeout: Duration::from_secs(3),
            kernel_info_grace: Duration::from_secs(60),
            drain_interval: Duration::from_millis(200),
            execute_timeout: None,
            shutdown_grace: Duration::from_secs(2),
            kernel_start_timeout: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    /// Initialize from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Initialize from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("BEAKER_RUNTIME_DIR").or_else(|| lookup("JUPYTER_RUNTIME_DIR")) {
            config.runtime_dir = PathBuf::from(dir);
        }
        if let Some(ms) = millis(&lookup, "BEAKER_KERNEL_INFO_TIMEOUT_MS")? {
            config.kernel_info_timeout = ms;
        }
        if let Some(ms) = millis(&lookup, "BEAKER_KERNEL_INFO_GRACE_MS")? {
            config.kernel_info_grace = ms;
        }
        if let Some(ms) = millis(&lookup, "BEAKER_DRAIN_MS")? {
            config.drain_interval = ms;
        }
        config.execute_timeout = millis(&lookup, "BEAKER_EXECUTE_TIMEOUT_MS")?;

        Ok(config)
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ProxyError::Config(format!("{} must be milliseconds, got '{}'", name, value))),
    }
}
