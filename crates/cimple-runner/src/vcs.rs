//! Version control information exposed to steps.

use cimple_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsInformation {
    pub vcs: String,
    pub branch: String,
    pub revision: String,
    pub remote_url: String,
    pub remote_name: String,
}

impl VcsInformation {
    /// Inspect the git checkout at `dir`.
    ///
    /// Branch and revision are required; remote name and url are left empty
    /// when the branch does not track a remote.
    pub async fn load(dir: &Path) -> Result<Self> {
        let branch = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let revision = git(dir, &["log", "-n", "1", "--pretty=format:%H"]).await?;

        let remote_name = git(dir, &["config", "--get", &format!("branch.{}.remote", branch)])
            .await
            .unwrap_or_default();
        let remote_url = if remote_name.is_empty() {
            String::new()
        } else {
            git(dir, &["config", "--get", &format!("remote.{}.url", remote_name)])
                .await
                .unwrap_or_default()
        };

        Ok(Self {
            vcs: "git".to_string(),
            branch,
            revision,
            remote_url,
            remote_name,
        })
    }
}

/// Run git in `dir` and return its trimmed stdout.
pub async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    debug!(args = ?args, dir = %dir.display(), "Running git");
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| Error::Internal(format!("Failed to run git: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
