//! Cimple Core
//!
//! Shared vocabulary for the Cimple build orchestrator: error taxonomy,
//! typed identifiers, the agent wire protocol, the message router,
//! journal events, the project model and the port traits implemented by
//! the scheduler, runner and transport crates.

pub mod error;
pub mod events;
pub mod ids;
pub mod messages;
pub mod ports;
pub mod project;
pub mod router;
pub mod secrets;

pub use error::{ConfigError, Error, Result};
pub use ids::*;

/// Version reported to builds through `CIMPLE_VERSION`.
pub const CIMPLE_VERSION: &str = env!("CARGO_PKG_VERSION");
