//! Request handlers organized by resource.

pub mod agents;
pub mod builds;
pub mod health;
