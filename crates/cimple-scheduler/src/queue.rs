//! Build submission in front of the work pool.

use crate::workpool::{ChoreId, ChoreOutcome, WorkPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cimple_core::Result;
use cimple_core::ids::BuildId;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildSource {
    Git { url: String, commit: String },
}

/// A build request waiting for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: BuildId,
    pub submitted_at: DateTime<Utc>,
    pub source: BuildSource,
}

impl BuildJob {
    pub fn git(url: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            id: BuildId::new(),
            submitted_at: Utc::now(),
            source: BuildSource::Git {
                url: url.into(),
                commit: commit.into(),
            },
        }
    }

    /// Human readable location of the sources, e.g. `https://host/repo.git#abc123`.
    pub fn build_url(&self) -> String {
        match &self.source {
            BuildSource::Git { url, commit } => format!("{}#{}", url, commit),
        }
    }
}

/// Job submission and introspection.
#[async_trait]
pub trait BuildQueue: Send + Sync {
    /// Queue a build and return as soon as it is accepted.
    async fn queue(&self, job: BuildJob) -> Result<ChoreId>;

    /// Builds not yet handed to an agent.
    async fn queued(&self) -> Result<Vec<BuildJob>>;
}

/// [`BuildQueue`] backed by a [`WorkPool`] of agents.
#[derive(Clone)]
pub struct WorkPoolBuildQueue {
    pool: WorkPool<BuildJob>,
}

impl WorkPoolBuildQueue {
    pub fn new(pool: WorkPool<BuildJob>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &WorkPool<BuildJob> {
        &self.pool
    }
}

#[async_trait]
impl BuildQueue for WorkPoolBuildQueue {
    async fn queue(&self, job: BuildJob) -> Result<ChoreId> {
        let build_id = job.id;
        let build_url = job.build_url();
        let mut handle = self.pool.queue_chore(job)?;
        let chore_id = handle.id();

        info!(build_id = %build_id, chore_id = %chore_id, build_url = %build_url, "Build queued");

        tokio::spawn(async move {
            match handle.wait().await {
                ChoreOutcome::Completed => {
                    info!(build_id = %build_id, "Build completed");
                }
                ChoreOutcome::Failed(reason) => {
                    error!(build_id = %build_id, reason = %reason, "Build failed");
                }
            }
        });

        Ok(chore_id)
    }

    async fn queued(&self) -> Result<Vec<BuildJob>> {
        let chores = self.pool.queued_chores().await?;
        Ok(chores.into_iter().map(|c| c.job).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workpool::WorkPoolConfig;

    #[tokio::test]
    async fn test_queued_build_is_listed_until_dispatched() {
        let queue = WorkPoolBuildQueue::new(WorkPool::start(WorkPoolConfig::default()));
        let job = BuildJob::git("https://test.local", "master");

        queue.queue(job.clone()).await.unwrap();
        let queued = queue.queued().await.unwrap();

        assert_eq!(queued, vec![job]);
        assert_eq!(queued[0].build_url(), "https://test.local#master");
    }

    #[test]
    fn test_build_job_serializes_source() {
        let job = BuildJob::git("https://x", "abc");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["source"]["type"], "git");
        assert_eq!(value["source"]["commit"], "abc");
    }
}
