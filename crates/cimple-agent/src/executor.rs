//! Runs builds requested by the server.

use async_trait::async_trait;
use cimple_core::ports::SecretStore;
use cimple_core::secrets::StaticSecretStore;
use cimple_core::{BuildId, Error, Result};
use cimple_runner::vcs::git;
use cimple_runner::{JournalDriver, LocalRunOptions, RunSummary, run_local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

/// A repository and commit to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub url: String,
    pub commit: String,
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(&self, request: BuildRequest) -> Result<RunSummary>;
}

/// Clones the repository into a fresh workspace, checks out the commit and
/// runs the project's build there. The workspace is removed afterwards.
pub struct GitBuildExecutor {
    workspace_dir: PathBuf,
    run_context: String,
    project_file: PathBuf,
    secrets: Arc<dyn SecretStore>,
}

impl GitBuildExecutor {
    pub fn new(workspace_dir: PathBuf, run_context: impl Into<String>) -> Self {
        Self {
            workspace_dir,
            run_context: run_context.into(),
            project_file: PathBuf::from(cimple_core::project::PROJECT_FILE),
            secrets: Arc::new(StaticSecretStore::new()),
        }
    }

    pub fn with_project_file(mut self, path: PathBuf) -> Self {
        self.project_file = path;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    async fn setup_workspace(&self) -> Result<PathBuf> {
        let workspace = self.workspace_dir.join(BuildId::new().to_string());
        fs::create_dir_all(&self.workspace_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create workspace: {}", e)))?;

        info!(path = %workspace.display(), "Workspace created");
        Ok(workspace)
    }

    async fn cleanup_workspace(&self, workspace: &Path) {
        if workspace.exists()
            && let Err(e) = fs::remove_dir_all(workspace).await
        {
            warn!(path = %workspace.display(), error = %e, "Failed to cleanup workspace");
        }
    }

    async fn build_in(&self, workspace: &Path, request: &BuildRequest) -> Result<RunSummary> {
        let dest = workspace.display().to_string();
        git(&self.workspace_dir, &["clone", "--quiet", &request.url, &dest]).await?;
        git(workspace, &["checkout", "--quiet", &request.commit]).await?;

        let mut options = LocalRunOptions::new(workspace);
        options.project_file = self.project_file.clone();
        options.run_context = self.run_context.clone();
        options.journal_driver = JournalDriver::None;
        options.secrets = Arc::clone(&self.secrets);
        options.host_env = std::env::vars().collect();
        options.repo = Some(request.url.clone());

        run_local(options).await
    }
}

#[async_trait]
impl BuildExecutor for GitBuildExecutor {
    async fn execute(&self, request: BuildRequest) -> Result<RunSummary> {
        info!(url = %request.url, commit = %request.commit, "Starting build");

        let workspace = self.setup_workspace().await?;
        let result = self.build_in(&workspace, &request).await;
        self.cleanup_workspace(&workspace).await;

        result
    }
}
