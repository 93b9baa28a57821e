//! Execution of a single step on the host.

use crate::output::{OutputLine, OutputStream};
use crate::publish::{self, PublishPlan};
use crate::vars::StepVars;
use cimple_core::project::StepAction;
use cimple_core::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

const SHELL: &str = "/bin/sh";
const PUBLISH: &str = "publish";

/// Configuration for step execution.
#[derive(Debug, Clone, Default)]
pub struct StepRunnerConfig {
    pub timeout_seconds: Option<u64>,
}

/// Result of a successful step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// A step with every template resolved, ready to spawn.
#[derive(Debug)]
pub struct PreparedStep {
    pub id: String,
    pub program: String,
    pub args: Vec<String>,
    /// Full process environment.
    pub env: BTreeMap<String, String>,
    /// Cimple and configured values only, as recorded in the journal.
    pub declared_env: BTreeMap<String, String>,
    script: Option<NamedTempFile>,
    publish: Option<PublishPlan>,
}

impl PreparedStep {
    pub fn script_path(&self) -> Option<&Path> {
        self.script.as_ref().map(|f| f.path())
    }

    pub fn publish_plan(&self) -> Option<&PublishPlan> {
        self.publish.as_ref()
    }
}

/// Runs command and script steps with an environment built from scratch,
/// and uploads the artifacts of publish steps.
#[derive(Debug, Clone, Default)]
pub struct StepRunner {
    config: StepRunnerConfig,
    client: reqwest::Client,
}

impl StepRunner {
    pub fn new(config: StepRunnerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Resolve templates in the environment, arguments and script body.
    pub fn prepare(&self, id: &str, action: &StepAction, vars: &StepVars) -> Result<PreparedStep> {
        let env = vars.resolved_env()?;
        let cimple_env = vars.cimple_env();
        let declared_env = env
            .iter()
            .filter(|(key, _)| cimple_env.contains_key(*key) || vars.step_env.contains_key(*key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut publish = None;
        let (program, args, script) = match action {
            StepAction::Command { command, args } => {
                let args = args
                    .iter()
                    .map(|arg| vars.render(arg))
                    .collect::<Result<Vec<_>>>()?;
                (command.clone(), args, None)
            }
            StepAction::Publish {
                files,
                destinations,
            } => {
                let plan = PublishPlan::resolve(files, destinations, vars)?;
                let args = plan.patterns.clone();
                publish = Some(plan);
                (PUBLISH.to_string(), args, None)
            }
            StepAction::Script { body } => {
                let body = vars.render(body)?;
                let mut file = tempfile::Builder::new().prefix("step").tempfile()?;
                file.write_all(body.as_bytes())?;
                file.flush()?;
                let path = file.path().display().to_string();
                (SHELL.to_string(), vec![path], Some(file))
            }
        };

        Ok(PreparedStep {
            id: id.to_string(),
            program,
            args,
            env,
            declared_env,
            script,
            publish,
        })
    }

    /// Run the step and stream its output. A non-zero exit is an error.
    pub async fn execute(
        &self,
        step: &PreparedStep,
        working_dir: &Path,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();

        if let Some(plan) = &step.publish {
            return self.execute_publish(step, plan, working_dir, output_tx, start).await;
        }

        info!(
            step = %step.id,
            program = %step.program,
            args = ?step.args,
            working_dir = %working_dir.display(),
            "Executing step"
        );

        let mut child = Command::new(&step.program)
            .args(&step.args)
            .current_dir(working_dir)
            .env_clear()
            .envs(&step.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| step_error(step, format!("Failed to spawn {}: {}", step.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| step_error(step, "stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| step_error(step, "stderr was not captured".to_string()))?;

        let stdout_handle = stream_lines(stdout, OutputStream::Stdout, output_tx.clone());
        let stderr_handle = stream_lines(stderr, OutputStream::Stderr, output_tx);

        let wait_result = if let Some(timeout_secs) = self.config.timeout_seconds {
            match timeout(Duration::from_secs(timeout_secs), child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(step = %step.id, timeout_secs, "Step timed out, killing process");
                    let _ = child.kill().await;
                    return Err(step_error(
                        step,
                        format!("timed out after {} seconds", timeout_secs),
                    ));
                }
            }
        } else {
            child.wait().await
        };

        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let status = wait_result
            .map_err(|e| step_error(step, format!("Failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(step = %step.id, exit_code, duration_ms, "Step finished");

        if !status.success() {
            return Err(step_error(step, format!("exited with status {}", exit_code)));
        }

        Ok(StepResult {
            exit_code,
            duration_ms,
        })
    }

    async fn execute_publish(
        &self,
        step: &PreparedStep,
        plan: &PublishPlan,
        working_dir: &Path,
        output_tx: mpsc::Sender<OutputLine>,
        start: std::time::Instant,
    ) -> Result<StepResult> {
        let upload = publish::publish(&self.client, &step.id, plan, working_dir, output_tx);
        match self.config.timeout_seconds {
            Some(timeout_secs) => timeout(Duration::from_secs(timeout_secs), upload)
                .await
                .map_err(|_| {
                    step_error(step, format!("timed out after {} seconds", timeout_secs))
                })??,
            None => upload.await?,
        }

        Ok(StepResult {
            exit_code: 0,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn step_error(step: &PreparedStep, message: String) -> Error {
    Error::StepExecution {
        step: step.id.clone(),
        message,
    }
}

fn stream_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0u32;

        while let Ok(Some(content)) = lines.next_line().await {
            line_number += 1;
            let line = OutputLine {
                stream,
                content,
                line_number,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(line).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::{CimpleEnvironment, ProjectInfo};
    use crate::vcs::VcsInformation;
    use cimple_core::secrets::StaticSecretStore;
    use std::sync::Arc;

    fn vars(step_env: &[(&str, &str)]) -> StepVars {
        StepVars {
            cimple: CimpleEnvironment::default(),
            build_date: chrono::Utc::now(),
            project: ProjectInfo {
                name: "demo".into(),
                version: "0.1.0".into(),
                description: None,
            },
            vcs: VcsInformation {
                branch: "main".into(),
                ..Default::default()
            },
            task_name: "build".into(),
            working_dir: "/tmp".into(),
            host_env: BTreeMap::from([
                ("PATH".into(), "/usr/bin:/bin".into()),
                ("HOST_ONLY".into(), "leak".into()),
            ]),
            step_env: step_env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            secrets: Arc::new(StaticSecretStore::new()),
        }
    }

    async fn run(action: StepAction, vars: &StepVars) -> (Result<StepResult>, Vec<OutputLine>) {
        let runner = StepRunner::default();
        let (tx, mut rx) = mpsc::channel(100);
        let prepared = runner.prepare("build.step", &action, vars).unwrap();
        let result = runner.execute(&prepared, Path::new("/tmp"), tx).await;

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        (result, lines)
    }

    #[tokio::test]
    async fn test_command_with_templated_args() {
        let vars = vars(&[]);
        let (result, lines) = run(
            StepAction::Command {
                command: "echo".into(),
                args: vec!["branch={{ .Vcs.Branch }}".into()],
            },
            &vars,
        )
        .await;

        assert_eq!(result.unwrap().exit_code, 0);
        assert_eq!(lines[0].content, "branch=main");
        assert_eq!(lines[0].stream, OutputStream::Stdout);
    }

    #[tokio::test]
    async fn test_script_sees_only_built_environment() {
        let vars = vars(&[("GREETING", "hello {{ .Project.Name }}")]);
        let action = StepAction::Script {
            body: "echo \"$GREETING\"\necho \"$CIMPLE_TASK_NAME\"\necho \"${UNSET_ELSEWHERE:-none}\"\n"
                .into(),
        };

        let (result, lines) = run(action, &vars).await;

        assert!(result.is_ok());
        let contents: Vec<_> = lines.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, vec!["hello demo", "build", "none"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_step_error() {
        let vars = vars(&[]);
        let (result, lines) = run(
            StepAction::Script {
                body: "echo failing >&2\nexit 3\n".into(),
            },
            &vars,
        )
        .await;

        match result {
            Err(Error::StepExecution { step, message }) => {
                assert_eq!(step, "build.step");
                assert!(message.contains('3'));
            }
            other => panic!("expected step error, got {:?}", other),
        }
        assert_eq!(lines[0].stream, OutputStream::Stderr);
    }

    #[tokio::test]
    async fn test_missing_program_is_step_error() {
        let vars = vars(&[]);
        let (result, _) = run(
            StepAction::Command {
                command: "/definitely/not/here".into(),
                args: vec![],
            },
            &vars,
        )
        .await;

        assert!(matches!(result, Err(Error::StepExecution { .. })));
    }

    #[test]
    fn test_declared_env_excludes_host_values() {
        let vars = vars(&[("TOKEN", "abc")]);
        let prepared = StepRunner::default()
            .prepare("build.step", &StepAction::Command { command: "true".into(), args: vec![] }, &vars)
            .unwrap();

        assert_eq!(prepared.env["HOST_ONLY"], "leak");
        assert!(!prepared.declared_env.contains_key("HOST_ONLY"));
        assert!(!prepared.declared_env.contains_key("PATH"));
        assert_eq!(prepared.declared_env["TOKEN"], "abc");
        assert_eq!(prepared.declared_env["CIMPLE_TASK_NAME"], "build");
    }

    #[test]
    fn test_script_materialized_to_temp_file() {
        let vars = vars(&[]);
        let prepared = StepRunner::default()
            .prepare(
                "build.step",
                &StepAction::Script {
                    body: "echo {{ .TaskName }}".into(),
                },
                &vars,
            )
            .unwrap();

        assert_eq!(prepared.program, SHELL);
        let body = std::fs::read_to_string(prepared.script_path().unwrap()).unwrap();
        assert_eq!(body, "echo build");
    }

    #[tokio::test]
    async fn test_publish_step_uploads_from_working_dir() {
        use cimple_core::project::PublishDestination;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/demo/report-build.txt"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report-build.txt"), "ok").unwrap();
        let action = StepAction::Publish {
            files: vec!["report-{{ .TaskName }}.txt".into()],
            destinations: vec![PublishDestination {
                url: format!("{}/{{{{ .Project.Name }}}}", server.uri()),
                username: None,
            }],
        };
        let runner = StepRunner::default();
        let prepared = runner.prepare("build.upload", &action, &vars(&[])).unwrap();
        let (tx, mut rx) = mpsc::channel(10);

        assert_eq!(prepared.program, "publish");
        assert_eq!(prepared.args, vec!["report-build.txt"]);
        assert!(prepared.script_path().is_none());

        let result = runner.execute(&prepared, dir.path(), tx).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(rx.recv().await.unwrap().content.contains("report-build.txt"));
    }
}
