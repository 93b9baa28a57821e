//! Agent configuration.

use cimple_core::ids::AgentId;
use cimple_core::Result;
use cimple_core::project::PROJECT_FILE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Server host name or address.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Connect with `wss://` instead of `ws://`.
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,
    /// Longest silence tolerated from the server before the connection is
    /// considered dead. Must exceed the ping period.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Directory builds are checked out into.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// Run context handed to builds, matched against `limit_to`.
    #[serde(default = "default_run_context")]
    pub run_context: String,
    /// Project file inside the checked out repository.
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
}

fn default_server_addr() -> String {
    "localhost".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_tls() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_ping_period() -> u64 {
    6
}

fn default_pong_wait() -> u64 {
    60
}

fn default_write_wait() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_workspace_dir() -> PathBuf {
    std::env::temp_dir().join("cimple-agent")
}

fn default_run_context() -> String {
    "server".to_string()
}

fn default_config_file() -> PathBuf {
    PathBuf::from(PROJECT_FILE)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            server_port: default_server_port(),
            tls: default_tls(),
            reconnect_delay_ms: default_reconnect_delay(),
            ping_period_secs: default_ping_period(),
            pong_wait_secs: default_pong_wait(),
            write_wait_secs: default_write_wait(),
            connect_timeout_secs: default_connect_timeout(),
            workspace_dir: default_workspace_dir(),
            run_context: default_run_context(),
            config_file: default_config_file(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn with_server(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.server_addr = addr.into();
        self.server_port = port;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Websocket URL the agent connects to.
    pub fn connection_url(&self, agent_id: AgentId) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{}://{}:{}/agents/connection?id={}",
            scheme,
            self.server_addr,
            self.server_port,
            agent_id.as_uuid()
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
