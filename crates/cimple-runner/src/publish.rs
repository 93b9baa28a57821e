//! Publish steps: upload build artifacts to HTTP destinations.

use crate::output::{OutputLine, OutputStream};
use crate::vars::StepVars;
use cimple_core::ports::SecretStore;
use cimple_core::project::PublishDestination;
use cimple_core::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Secret kind holding publish passwords, keyed by destination username.
pub const SECRET_KIND: &str = "publish";

/// A publish step with templates and credentials resolved.
#[derive(Debug, Clone)]
pub struct PublishPlan {
    /// Glob patterns, relative to the working directory unless absolute.
    pub patterns: Vec<String>,
    pub targets: Vec<PublishTarget>,
}

#[derive(Clone)]
pub struct PublishTarget {
    pub url: String,
    pub username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishTarget")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl PublishPlan {
    pub fn resolve(
        files: &[String],
        destinations: &[PublishDestination],
        vars: &StepVars,
    ) -> Result<Self> {
        let patterns = files
            .iter()
            .map(|pattern| vars.render(pattern))
            .collect::<Result<Vec<_>>>()?;

        let mut targets = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let username = destination
                .username
                .as_deref()
                .map(|name| vars.render(name))
                .transpose()?;
            let password = match &username {
                Some(name) => Some(vars.secrets.get(SECRET_KIND, name)?),
                None => None,
            };
            targets.push(PublishTarget {
                url: vars.render(&destination.url)?,
                username,
                password,
            });
        }

        Ok(Self { patterns, targets })
    }

    /// Expand every pattern against `working_dir`. A pattern matching no
    /// file is an error.
    pub fn files(&self, working_dir: &Path) -> std::result::Result<Vec<PathBuf>, String> {
        let mut files = Vec::new();
        for pattern in &self.patterns {
            let full_pattern = if Path::new(pattern).is_absolute() {
                pattern.clone()
            } else {
                working_dir.join(pattern).display().to_string()
            };

            let entries = glob::glob(&full_pattern)
                .map_err(|e| format!("Invalid pattern {}: {}", pattern, e))?;
            let mut matched: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .filter(|path| path.is_file())
                .collect();
            if matched.is_empty() {
                return Err(format!("No files match {}", pattern));
            }
            matched.sort();
            files.extend(matched);
        }
        files.dedup();
        Ok(files)
    }
}

impl PublishTarget {
    fn upload_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), file_name)
    }
}

/// Upload every matched file to every target with an HTTP PUT.
pub async fn publish(
    client: &reqwest::Client,
    step_id: &str,
    plan: &PublishPlan,
    working_dir: &Path,
    output_tx: mpsc::Sender<OutputLine>,
) -> Result<()> {
    let fail = |message: String| Error::StepExecution {
        step: step_id.to_string(),
        message,
    };

    let files = plan.files(working_dir).map_err(fail)?;
    let mut line_number = 0u32;

    for target in &plan.targets {
        for path in &files {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let url = target.upload_url(&file_name);
            let body = tokio::fs::read(path).await?;
            let size = body.len();

            info!(step = %step_id, file = %path.display(), url = %url, "Publishing file");

            let mut request = client.put(&url).body(body);
            if let Some(username) = &target.username {
                request = request.basic_auth(username, target.password.as_deref());
            }
            let response = request
                .send()
                .await
                .map_err(|e| fail(format!("Failed to publish {}: {}", file_name, e)))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(fail(format!(
                    "Failed to publish {} to {}: {} - {}",
                    file_name, url, status, text
                )));
            }

            debug!(step = %step_id, file = %file_name, size, "Published file");
            line_number += 1;
            let line = OutputLine {
                stream: OutputStream::Stdout,
                content: format!("Published {} ({} bytes) to {}", file_name, size, url),
                line_number,
                timestamp: chrono::Utc::now(),
            };
            if output_tx.send(line).await.is_err() {
                debug!(step = %step_id, "Output receiver dropped");
            }
        }
    }

    Ok(())
}
