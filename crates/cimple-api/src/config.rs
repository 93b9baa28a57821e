//! Server configuration.

use cimple_core::Result;
use cimple_scheduler::WorkPoolConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often the work pool tries to hand a queued build to an agent.
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
    /// How long an agent may take to report a build complete. Zero waits
    /// forever.
    #[serde(default = "default_perform_timeout")]
    pub perform_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_check_interval() -> u64 {
    1000
}

fn default_stats_interval() -> u64 {
    10_000
}

fn default_perform_timeout() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            check_interval_ms: default_check_interval(),
            stats_interval_ms: default_stats_interval(),
            perform_timeout_secs: default_perform_timeout(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn perform_timeout(&self) -> Option<Duration> {
        (self.perform_timeout_secs > 0).then(|| Duration::from_secs(self.perform_timeout_secs))
    }

    pub fn work_pool_config(&self) -> WorkPoolConfig {
        WorkPoolConfig::default()
            .with_check_interval(Duration::from_millis(self.check_interval_ms))
            .with_stats_interval(Duration::from_millis(self.stats_interval_ms))
    }
}
