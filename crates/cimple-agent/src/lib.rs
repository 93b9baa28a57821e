//! Build agent for Cimple.

pub mod agent;
pub mod config;
pub mod connection;
pub mod executor;

pub use agent::BuildAgent;
pub use config::AgentConfig;
pub use connection::{ConnectionState, ServerConnection};
pub use executor::{BuildExecutor, BuildRequest, GitBuildExecutor};
