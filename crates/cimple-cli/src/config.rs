//! CLI configuration management.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where the API commands find the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_server_addr() -> String {
    "localhost".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            server_port: default_server_port(),
        }
    }
}

impl CliConfig {
    /// Load configuration from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Ok(serde_yaml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, addr: Option<String>, port: Option<u16>) -> Self {
        if let Some(addr) = addr {
            self.server_addr = addr;
        }
        if let Some(port) = port {
            self.server_port = port;
        }
        self
    }

    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.server_addr, self.server_port)
    }
}
