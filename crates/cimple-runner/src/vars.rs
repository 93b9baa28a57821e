//! Per-step variables and `{{ .Path }}` templating.

use crate::vcs::VcsInformation;
use chrono::{DateTime, SecondsFormat, Utc};
use cimple_core::ports::SecretStore;
use cimple_core::{Error, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("static expression pattern"));

static SECRET_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\.Secrets\.Get\s+"([^"]*)"\s+"([^"]*)"$"#).expect("static secret pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CimpleEnvironment {
    pub version: String,
}

impl Default for CimpleEnvironment {
    fn default() -> Self {
        Self {
            version: cimple_core::CIMPLE_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectInfo {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
}

/// Everything a step may reference from its environment or templates.
#[derive(Clone)]
pub struct StepVars {
    pub cimple: CimpleEnvironment,
    pub build_date: DateTime<Utc>,
    pub project: ProjectInfo,
    pub vcs: VcsInformation,
    pub task_name: String,
    pub working_dir: String,
    pub host_env: BTreeMap<String, String>,
    /// Project, task and step env merged, step values last.
    pub step_env: BTreeMap<String, String>,
    pub secrets: Arc<dyn SecretStore>,
}

impl StepVars {
    pub fn formatted_build_date(&self) -> String {
        self.build_date.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Values provided by cimple itself.
    pub fn cimple_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("CIMPLE_BUILD_DATE".to_string(), self.formatted_build_date()),
            ("CIMPLE_VERSION".to_string(), self.cimple.version.clone()),
            ("CIMPLE_PROJECT_NAME".to_string(), self.project.name.clone()),
            ("CIMPLE_PROJECT_VERSION".to_string(), self.project.version.clone()),
            ("CIMPLE_TASK_NAME".to_string(), self.task_name.clone()),
            ("CIMPLE_WORKING_DIR".to_string(), self.working_dir.clone()),
            ("CIMPLE_VCS".to_string(), self.vcs.vcs.clone()),
            ("CIMPLE_VCS_BRANCH".to_string(), self.vcs.branch.clone()),
            ("CIMPLE_VCS_REVISION".to_string(), self.vcs.revision.clone()),
            ("CIMPLE_VCS_REMOTE_URL".to_string(), self.vcs.remote_url.clone()),
            ("CIMPLE_VCS_REMOTE_NAME".to_string(), self.vcs.remote_name.clone()),
        ])
    }

    /// Untemplated environment: host values, overridden by cimple values,
    /// overridden by step values.
    pub fn map(&self) -> BTreeMap<String, String> {
        let mut env = self.host_env.clone();
        env.extend(self.cimple_env());
        env.extend(self.step_env.clone());
        env
    }

    /// Environment handed to a step: [`StepVars::map`] with every configured
    /// step value rendered as a template.
    pub fn resolved_env(&self) -> Result<BTreeMap<String, String>> {
        let mut env = self.map();
        for (key, value) in &self.step_env {
            env.insert(key.clone(), self.render(value)?);
        }
        Ok(env)
    }

    /// Expand every `{{ ... }}` expression in `template`.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut rendered = String::with_capacity(template.len());
        let mut last = 0;

        for caps in EXPRESSION.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            rendered.push_str(&template[last..whole.start()]);
            rendered.push_str(&self.evaluate(&caps)?);
            last = whole.end();
        }
        rendered.push_str(&template[last..]);

        Ok(rendered)
    }

    fn evaluate(&self, caps: &Captures<'_>) -> Result<String> {
        let expr = caps.get(1).map_or("", |m| m.as_str());

        if let Some(call) = SECRET_CALL.captures(expr) {
            let kind = call.get(1).map_or("", |m| m.as_str());
            let key = call.get(2).map_or("", |m| m.as_str());
            return self.secrets.get(kind, key);
        }

        let Some(path) = expr.strip_prefix('.') else {
            return Err(Error::Template(format!("Unsupported expression {:?}", expr)));
        };
        let segments: Vec<&str> = path.split('.').collect();

        let value = match segments.as_slice() {
            ["Cimple", "Version"] => self.cimple.version.clone(),
            ["BuildDate"] => self.build_date.to_rfc3339(),
            ["FormattedBuildDate"] => self.formatted_build_date(),
            ["Project", "Name"] => self.project.name.clone(),
            ["Project", "Version"] => self.project.version.clone(),
            ["Project", "Description"] => self.project.description.clone().unwrap_or_default(),
            ["Vcs", "Vcs"] => self.vcs.vcs.clone(),
            ["Vcs", "Branch"] => self.vcs.branch.clone(),
            ["Vcs", "Revision"] => self.vcs.revision.clone(),
            ["Vcs", "RemoteUrl"] => self.vcs.remote_url.clone(),
            ["Vcs", "RemoteName"] => self.vcs.remote_name.clone(),
            ["TaskName"] => self.task_name.clone(),
            ["WorkingDir"] => self.working_dir.clone(),
            ["HostEnv", key] => self.host_env.get(*key).cloned().unwrap_or_default(),
            ["StepEnv", key] => self.step_env.get(*key).cloned().unwrap_or_default(),
            _ => return Err(Error::Template(format!("Unknown variable {:?}", expr))),
        };

        Ok(value)
    }
}
