//! Application state shared across handlers.

use cimple_scheduler::{AgentPool, BuildQueue};
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub build_queue: Arc<dyn BuildQueue>,
    pub agents: AgentPool,
    /// Deadline applied to every build dispatched to an agent.
    pub perform_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(build_queue: Arc<dyn BuildQueue>, agents: AgentPool) -> Self {
        Self {
            build_queue,
            agents,
            perform_timeout: None,
        }
    }

    pub fn with_perform_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.perform_timeout = timeout;
        self
    }
}
