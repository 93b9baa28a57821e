//! Work pool scheduling and agent dispatch for Cimple.

pub mod agents;
pub mod queue;
pub mod workpool;

pub use agents::{AgentHandle, AgentPool, AgentSnapshot};
pub use queue::{BuildJob, BuildQueue, BuildSource, WorkPoolBuildQueue};
pub use workpool::{
    Chore, ChoreHandle, ChoreId, ChoreOutcome, PoolStats, WorkPool, WorkPoolConfig, Worker,
};
