//! Project configuration (`cimple.yaml`) and its load-time validation.

use crate::{ConfigError, Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

/// Default file name looked up in a repository root.
pub const PROJECT_FILE: &str = "cimple.yaml";

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_]+$").expect("static name pattern")
});

/// A validated project.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub env: BTreeMap<String, String>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub description: Option<String>,
    pub depends: Vec<String>,
    pub skip: bool,
    /// Run context this task is restricted to, if any.
    pub limit_to: Option<String>,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub env: BTreeMap<String, String>,
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Run an executable directly with templated arguments.
    Command { command: String, args: Vec<String> },
    /// Write a templated body to a temporary file and run it with the system shell.
    Script { body: String },
    /// Upload files matching templated glob patterns to every destination.
    Publish {
        files: Vec<String>,
        destinations: Vec<PublishDestination>,
    },
}

/// Upload target of a publish step. Files are PUT to `<url>/<file name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishDestination {
    #[serde(default)]
    pub url: String,
    /// Basic auth user. The password is the `publish` secret keyed by this name.
    #[serde(default)]
    pub username: Option<String>,
}

impl Project {
    /// Load and validate a project file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML. All issues are reported together.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let file: ProjectFile = serde_yaml::from_str(contents)?;
        file.validate().map_err(Error::Config)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }
}

impl Task {
    /// Journal identifier of a step: `<task>.<step>`.
    pub fn step_id(&self, step: &Step) -> String {
        format!("{}.{}", self.name, step.name)
    }
}

/// Raw shape of `cimple.yaml` before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: Vec<TaskFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub limit_to: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<StepFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub publish: Option<PublishFile>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub skip: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishFile {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<PublishDestination>,
}

impl ProjectFile {
    pub fn validate(self) -> std::result::Result<Project, ConfigError> {
        let mut issues = ConfigError::default();

        if self.name.trim().is_empty() {
            issues.push("Project name is required");
        }
        if self.version.trim().is_empty() {
            issues.push("Project version is required");
        }

        let mut task_names = HashSet::new();
        for task in &self.tasks {
            check_name(&mut issues, "Task", &task.name);
            if !task_names.insert(task.name.clone()) {
                issues.push(format!("Duplicate task name: {}", task.name));
            }
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            for dep in &task.depends {
                if !task_names.contains(dep) {
                    issues.push(format!("Task {} depends on unknown task {}", task.name, dep));
                }
            }

            let mut step_names = HashSet::new();
            let mut steps = Vec::with_capacity(task.steps.len());
            for step in task.steps {
                check_name(&mut issues, "Step", &step.name);
                if !step_names.insert(step.name.clone()) {
                    issues.push(format!(
                        "Duplicate step name {} in task {}",
                        step.name, task.name
                    ));
                }

                let id = format!("{}.{}", task.name, step.name);
                let action = match (step.command, step.script, step.publish) {
                    (Some(command), None, None) => StepAction::Command {
                        command,
                        args: step.args,
                    },
                    (None, Some(body), None) => StepAction::Script { body },
                    (None, None, Some(publish)) => {
                        if publish.files.is_empty() {
                            issues.push(format!("Step {} publishes no files", id));
                        }
                        if publish.destinations.is_empty() {
                            issues.push(format!("Step {} has no publish destinations", id));
                        }
                        for destination in &publish.destinations {
                            if destination.url.trim().is_empty() {
                                issues.push(format!("Step {} destination url is required", id));
                            }
                        }
                        StepAction::Publish {
                            files: publish.files,
                            destinations: publish.destinations,
                        }
                    }
                    (None, None, None) => {
                        issues.push(format!(
                            "Step {} declares none of command, script or publish",
                            id
                        ));
                        continue;
                    }
                    _ => {
                        issues.push(format!(
                            "Step {} declares more than one of command, script or publish",
                            id
                        ));
                        continue;
                    }
                };

                steps.push(Step {
                    name: step.name,
                    action,
                    env: step.env,
                    skip: step.skip,
                });
            }

            tasks.push(Task {
                name: task.name,
                description: task.description,
                depends: task.depends,
                skip: task.skip,
                limit_to: task.limit_to,
                env: task.env,
                steps,
            });
        }

        issues.into_result()?;

        Ok(Project {
            name: self.name,
            version: self.version,
            description: self.description,
            env: self.env,
            tasks,
        })
    }
}

fn check_name(issues: &mut ConfigError, what: &str, name: &str) {
    if name.is_empty() {
        issues.push(format!("{} name is required", what));
    } else if !NAME_PATTERN.is_match(name) {
        issues.push(format!(
            "{} name {:?} may only contain lowercase letters, digits and underscores",
            what, name
        ));
    }
}
