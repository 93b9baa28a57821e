//! A single build: task selection, dependency ordering and step execution.

use crate::graph::BuildGraph;
use crate::journal::Journal;
use crate::output::OutputLine;
use crate::step::{StepRunner, StepRunnerConfig};
use crate::vars::{CimpleEnvironment, ProjectInfo, StepVars};
use crate::vcs::VcsInformation;
use chrono::{DateTime, Utc};
use cimple_core::events::{
    BuildFailedPayload, BuildFinishedPayload, BuildStartedPayload, Event, StepFailedPayload,
    StepPayload, StepStartedPayload, TaskPayload, TaskSkippedPayload, TaskStartedPayload,
};
use cimple_core::ports::SecretStore;
use cimple_core::project::{Project, Step, Task};
use cimple_core::secrets::StaticSecretStore;
use cimple_core::{BuildId, Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Run context used when no other is configured.
pub const DEFAULT_RUN_CONTEXT: &str = "local";

/// Everything a build needs besides the output channel.
#[derive(Clone)]
pub struct BuildConfig {
    pub build_id: BuildId,
    pub build_date: DateTime<Utc>,
    pub project: Project,
    pub explicit_tasks: Vec<String>,
    pub run_context: String,
    pub vcs: VcsInformation,
    pub host_env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub secrets: Arc<dyn SecretStore>,
    pub journal: Journal,
    /// Repository the build was requested for, if any.
    pub repo: Option<String>,
    pub step_runner: StepRunnerConfig,
}

impl BuildConfig {
    pub fn new(project: Project, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_id: BuildId::new(),
            build_date: Utc::now(),
            project,
            explicit_tasks: Vec::new(),
            run_context: DEFAULT_RUN_CONTEXT.to_string(),
            vcs: VcsInformation::default(),
            host_env: BTreeMap::new(),
            working_dir: working_dir.into(),
            secrets: Arc::new(StaticSecretStore::new()),
            journal: Journal::discard(),
            repo: None,
            step_runner: StepRunnerConfig::default(),
        }
    }

    pub fn with_build_id(mut self, build_id: BuildId) -> Self {
        self.build_id = build_id;
        self
    }

    pub fn with_explicit_tasks(mut self, tasks: Vec<String>) -> Self {
        self.explicit_tasks = tasks;
        self
    }

    pub fn with_run_context(mut self, context: impl Into<String>) -> Self {
        self.run_context = context.into();
        self
    }

    pub fn with_vcs(mut self, vcs: VcsInformation) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_host_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.host_env = env;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_step_runner(mut self, config: StepRunnerConfig) -> Self {
        self.step_runner = config;
        self
    }
}

/// Mark every task not named in `explicit` as skipped and un-skip the ones
/// that are. Returns the reason for each task skipped by the filter.
///
/// An empty filter leaves the tasks untouched.
pub fn apply_explicit_tasks(tasks: &mut [Task], explicit: &[String]) -> HashMap<String, String> {
    let mut reasons = HashMap::new();
    if explicit.is_empty() {
        return reasons;
    }

    for task in tasks.iter_mut() {
        if explicit.contains(&task.name) {
            if task.skip {
                info!(task = %task.name, "Unskipping task as explicitly specified");
                task.skip = false;
            }
        } else {
            info!(task = %task.name, "Skipping task as not explicitly specified");
            task.skip = true;
            reasons.insert(task.name.clone(), "Not explicitly specified".to_string());
        }
    }

    reasons
}

pub struct Build {
    config: BuildConfig,
    graph: BuildGraph,
    runner: StepRunner,
    skip_reasons: HashMap<String, String>,
}

impl Build {
    pub fn new(mut config: BuildConfig) -> Result<Self> {
        if let Some(unknown) = config
            .explicit_tasks
            .iter()
            .find(|name| config.project.task(name).is_none())
        {
            return Err(Error::UnknownTask(unknown.clone()));
        }

        let skip_reasons = apply_explicit_tasks(&mut config.project.tasks, &config.explicit_tasks);
        let graph = BuildGraph::populate(&config.project.tasks)?;
        let runner = StepRunner::new(config.step_runner.clone());

        Ok(Self {
            config,
            graph,
            runner,
            skip_reasons,
        })
    }

    pub fn id(&self) -> BuildId {
        self.config.build_id
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    /// Run every task in dependency order, streaming step output to
    /// `output_tx`. Stops at the first failing step.
    pub async fn run(&self, output_tx: mpsc::Sender<OutputLine>) -> Result<()> {
        let start = Instant::now();
        let journal = &self.config.journal;
        let build_id = self.config.build_id;

        info!(
            build_id = %build_id,
            project = %self.config.project.name,
            run_context = %self.config.run_context,
            "Running build"
        );

        journal
            .record(Event::BuildStarted(BuildStartedPayload {
                build_id,
                project: self.config.project.name.clone(),
                repo: self.config.repo.clone(),
                tasks: self.graph.execution_order(),
            }))
            .await;

        let result = self
            .graph
            .build(|id| self.run_task(id, output_tx.clone()))
            .await;

        match &result {
            Ok(()) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                info!(build_id = %build_id, duration_ms, "Build finished successfully");
                journal
                    .record(Event::BuildSucceeded(BuildFinishedPayload {
                        build_id,
                        duration_ms,
                    }))
                    .await;
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "Build failed");
                journal
                    .record(Event::BuildFailed(BuildFailedPayload {
                        build_id,
                        reason: e.to_string(),
                    }))
                    .await;
            }
        }

        result
    }

    fn skip_reason(&self, task: &Task) -> Option<String> {
        if task.skip {
            return Some(
                self.skip_reasons
                    .get(&task.name)
                    .cloned()
                    .unwrap_or_else(|| "Marked as skipped".to_string()),
            );
        }

        match &task.limit_to {
            Some(context) if *context != self.config.run_context => {
                Some(format!("Limited to {} context", context))
            }
            _ => None,
        }
    }

    async fn run_task(&self, id: String, output_tx: mpsc::Sender<OutputLine>) -> Result<()> {
        let journal = &self.config.journal;
        let task = self
            .config
            .project
            .task(&id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;

        if let Some(reason) = self.skip_reason(task) {
            info!(task = %id, reason = %reason, "Skipping task");
            journal
                .record(Event::TaskSkipped(TaskSkippedPayload { id, reason }))
                .await;
            return Ok(());
        }

        let steps = task
            .steps
            .iter()
            .filter(|step| !step.skip)
            .map(|step| task.step_id(step))
            .collect();
        journal
            .record(Event::TaskStarted(TaskStartedPayload {
                id: id.clone(),
                steps,
            }))
            .await;

        for step in &task.steps {
            let step_id = task.step_id(step);

            if step.skip {
                journal
                    .record(Event::StepSkipped(StepPayload { id: step_id }))
                    .await;
                continue;
            }

            if let Err(e) = self.run_step(task, step, &step_id, output_tx.clone()).await {
                journal
                    .record(Event::StepFailed(StepFailedPayload {
                        id: step_id,
                        reason: e.to_string(),
                    }))
                    .await;
                journal
                    .record(Event::TaskFailed(TaskPayload { id }))
                    .await;
                return Err(e);
            }

            journal
                .record(Event::StepSuccessful(StepPayload { id: step_id }))
                .await;
        }

        journal
            .record(Event::TaskSuccessful(TaskPayload { id }))
            .await;
        Ok(())
    }

    async fn run_step(
        &self,
        task: &Task,
        step: &Step,
        step_id: &str,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<()> {
        let vars = self.step_vars(task, step);
        let prepared = self.runner.prepare(step_id, &step.action, &vars)?;

        self.config
            .journal
            .record(Event::StepStarted(StepStartedPayload {
                id: step_id.to_string(),
                env: prepared.declared_env.clone(),
                step: prepared.program.clone(),
                args: prepared.args.clone(),
            }))
            .await;

        self.runner
            .execute(&prepared, &self.config.working_dir, output_tx)
            .await?;
        Ok(())
    }

    fn step_vars(&self, task: &Task, step: &Step) -> StepVars {
        let project = &self.config.project;

        let mut step_env = project.env.clone();
        step_env.extend(task.env.clone());
        step_env.extend(step.env.clone());

        StepVars {
            cimple: CimpleEnvironment::default(),
            build_date: self.config.build_date,
            project: ProjectInfo {
                name: project.name.clone(),
                version: project.version.clone(),
                description: project.description.clone(),
            },
            vcs: self.config.vcs.clone(),
            task_name: task.name.clone(),
            working_dir: self.config.working_dir.display().to_string(),
            host_env: self.config.host_env.clone(),
            step_env,
            secrets: self.config.secrets.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournalWriter;
    use crate::output::OutputSink;
    use pretty_assertions::assert_eq;

    fn project(yaml: &str) -> Project {
        Project::from_yaml(yaml).unwrap()
    }

    fn host_env() -> BTreeMap<String, String> {
        BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())])
    }

    fn config(yaml: &str, journal: Journal) -> BuildConfig {
        BuildConfig::new(project(yaml), std::env::temp_dir())
            .with_host_env(host_env())
            .with_journal(journal)
    }

    async fn run(build: &Build) -> (Result<()>, Vec<String>) {
        let sink = OutputSink::capturing();
        let result = build.run(sink.sender()).await;
        (result, sink.finish().await)
    }

    const PROJECT: &str = r#"
name: demo
version: 1.0.0
env:
  LEVEL: project
tasks:
  - name: one
    steps:
      - name: hello
        command: echo
        args: ["one {{ .TaskName }}"]
  - name: two
    depends: [one]
    env:
      LEVEL: task
    steps:
      - name: level
        script: echo "$LEVEL"
      - name: ignored
        command: "false"
        skip: true
"#;

    #[test]
    fn test_explicit_tasks_skip_and_unskip() {
        let mut project = project(
            r#"
name: demo
version: 1.0.0
tasks:
  - name: one
    steps: [{ name: a, command: "true" }]
  - name: two
    skip: true
    steps: [{ name: a, command: "true" }]
"#,
        );

        let reasons = apply_explicit_tasks(&mut project.tasks, &["two".to_string()]);

        assert!(project.task("one").unwrap().skip);
        assert!(!project.task("two").unwrap().skip);
        assert!(reasons.contains_key("one"));
    }

    #[test]
    fn test_empty_filter_leaves_tasks_alone() {
        let mut project = project(PROJECT);
        let reasons = apply_explicit_tasks(&mut project.tasks, &[]);
        assert!(reasons.is_empty());
        assert!(project.tasks.iter().all(|t| !t.skip));
    }

    #[test]
    fn test_unknown_explicit_task_is_rejected() {
        let config = config(PROJECT, Journal::discard()).with_explicit_tasks(vec!["three".into()]);
        assert!(matches!(Build::new(config), Err(Error::UnknownTask(name)) if name == "three"));
    }

    #[tokio::test]
    async fn test_build_records_lifecycle_in_order() {
        let memory = Arc::new(MemoryJournalWriter::new());
        let build = Build::new(config(PROJECT, Journal::new(vec![memory.clone()]))).unwrap();

        let (result, output) = run(&build).await;

        assert!(result.is_ok());
        assert_eq!(output, vec!["one one", "task"]);
        assert_eq!(
            memory.types(),
            vec![
                "build_started",
                "task_started",
                "step_started",
                "step_successful",
                "task_successful",
                "task_started",
                "step_started",
                "step_successful",
                "step_skipped",
                "task_successful",
                "build_succeeded",
            ]
        );

        let events = memory.events();
        match &events[1] {
            Event::TaskStarted(payload) => assert_eq!(payload.steps, vec!["one.hello"]),
            other => panic!("unexpected event {:?}", other),
        }
        match &events[2] {
            Event::StepStarted(payload) => {
                assert_eq!(payload.step, "echo");
                assert_eq!(payload.args, vec!["one one"]);
                assert_eq!(payload.env.get("LEVEL").map(String::as_str), Some("project"));
                assert!(!payload.env.contains_key("PATH"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_step_aborts_build() {
        let memory = Arc::new(MemoryJournalWriter::new());
        let yaml = r#"
name: demo
version: 1.0.0
tasks:
  - name: one
    steps:
      - name: broken
        script: exit 1
      - name: never
        command: echo
        args: [unreachable]
  - name: two
    depends: [one]
    steps: [{ name: a, command: echo, args: [unreachable] }]
"#;
        let build = Build::new(config(yaml, Journal::new(vec![memory.clone()]))).unwrap();

        let (result, output) = run(&build).await;

        assert!(matches!(result, Err(Error::StepExecution { ref step, .. }) if step == "one.broken"));
        assert!(output.is_empty());
        assert_eq!(
            memory.types(),
            vec![
                "build_started",
                "task_started",
                "step_started",
                "step_failed",
                "task_failed",
                "build_failed",
            ]
        );
    }

    #[tokio::test]
    async fn test_task_limited_to_other_context_is_skipped() {
        let memory = Arc::new(MemoryJournalWriter::new());
        let yaml = r#"
name: demo
version: 1.0.0
tasks:
  - name: publish
    limit_to: server
    steps: [{ name: a, command: echo, args: [published] }]
"#;

        let local = Build::new(config(yaml, Journal::new(vec![memory.clone()]))).unwrap();
        let (result, output) = run(&local).await;
        assert!(result.is_ok());
        assert!(output.is_empty());
        match &memory.events()[1] {
            Event::TaskSkipped(payload) => {
                assert_eq!(payload.id, "publish");
                assert_eq!(payload.reason, "Limited to server context");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let server = Build::new(config(yaml, Journal::discard()).with_run_context("server")).unwrap();
        let (result, output) = run(&server).await;
        assert!(result.is_ok());
        assert_eq!(output, vec!["published"]);
    }

    #[tokio::test]
    async fn test_filtered_task_reports_reason() {
        let memory = Arc::new(MemoryJournalWriter::new());
        let build = Build::new(
            config(PROJECT, Journal::new(vec![memory.clone()])).with_explicit_tasks(vec!["two".into()]),
        )
        .unwrap();

        let (result, output) = run(&build).await;

        assert!(result.is_ok());
        assert_eq!(output, vec!["task"]);
        match &memory.events()[1] {
            Event::TaskSkipped(payload) => assert_eq!(payload.reason, "Not explicitly specified"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
