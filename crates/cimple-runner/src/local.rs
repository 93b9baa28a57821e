//! Running a project's build in a directory on this machine.

use crate::build::{Build, BuildConfig, DEFAULT_RUN_CONTEXT};
use crate::journal::{ConsoleJournalWriter, FileJournalWriter, Journal, JournalFormat, JournalWriter};
use crate::output::OutputSink;
use crate::step::StepRunnerConfig;
use crate::vcs::VcsInformation;
use cimple_core::ports::SecretStore;
use cimple_core::project::{PROJECT_FILE, Project};
use cimple_core::secrets::StaticSecretStore;
use cimple_core::{BuildId, Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Directory, relative to the working directory, holding run state.
pub const STATE_DIR: &str = ".cimple";

/// Where journal records are shown besides the journal file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JournalDriver {
    #[default]
    Console,
    None,
}

impl FromStr for JournalDriver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "console" => Ok(JournalDriver::Console),
            "none" => Ok(JournalDriver::None),
            other => Err(Error::Serialization(format!("Unknown journal driver: {}", other))),
        }
    }
}

/// Files written by one run: `<state>/<project>/<run_id>/{output,journal}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
    pub output: PathBuf,
    pub journal: PathBuf,
}

impl RunPaths {
    pub fn new(state_dir: &Path, project: &str, run_id: &str) -> Self {
        let root = state_dir.join(project).join(run_id);
        Self {
            output: root.join("output"),
            journal: root.join("journal"),
            root,
        }
    }
}

#[derive(Clone)]
pub struct LocalRunOptions {
    pub working_dir: PathBuf,
    /// Project file, relative to the working directory unless absolute.
    pub project_file: PathBuf,
    pub explicit_tasks: Vec<String>,
    pub journal_driver: JournalDriver,
    pub journal_format: JournalFormat,
    pub run_context: String,
    pub secrets: Arc<dyn SecretStore>,
    pub host_env: BTreeMap<String, String>,
    pub repo: Option<String>,
    /// Echo step output to stdout as well as the output file.
    pub echo_output: bool,
    pub step_runner: StepRunnerConfig,
}

impl LocalRunOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            project_file: PathBuf::from(PROJECT_FILE),
            explicit_tasks: Vec::new(),
            journal_driver: JournalDriver::default(),
            journal_format: JournalFormat::default(),
            run_context: DEFAULT_RUN_CONTEXT.to_string(),
            secrets: Arc::new(StaticSecretStore::new()),
            host_env: BTreeMap::new(),
            repo: None,
            echo_output: true,
            step_runner: StepRunnerConfig::default(),
        }
    }

    pub fn project_path(&self) -> PathBuf {
        self.working_dir.join(&self.project_file)
    }
}

/// Outcome of a local run. Setup failures are returned as errors instead.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub build_id: BuildId,
    pub run_id: String,
    pub project: String,
    pub paths: RunPaths,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

fn run_id() -> String {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}

/// Load the project in `options.working_dir` and run its build, writing the
/// journal and output under `.cimple/`.
pub async fn run_local(options: LocalRunOptions) -> Result<RunSummary> {
    let project = Project::load(&options.project_path())?;
    let run_id = run_id();
    let paths = RunPaths::new(&options.working_dir.join(STATE_DIR), &project.name, &run_id);

    let mut writers: Vec<Arc<dyn JournalWriter>> =
        vec![Arc::new(FileJournalWriter::create(&paths.journal).await?)];
    if options.journal_driver == JournalDriver::Console {
        writers.push(Arc::new(ConsoleJournalWriter::new(options.journal_format)));
    }
    let journal = Journal::new(writers);

    let vcs = match VcsInformation::load(&options.working_dir).await {
        Ok(vcs) => vcs,
        Err(e) => {
            warn!(error = %e, "Could not load VCS information");
            VcsInformation::default()
        }
    };

    let mut config = BuildConfig::new(project.clone(), options.working_dir.clone())
        .with_explicit_tasks(options.explicit_tasks)
        .with_run_context(options.run_context)
        .with_vcs(vcs)
        .with_host_env(options.host_env)
        .with_secrets(options.secrets)
        .with_journal(journal)
        .with_step_runner(options.step_runner);
    if let Some(repo) = options.repo {
        config = config.with_repo(repo);
    }

    let build = Build::new(config)?;
    let sink = OutputSink::new(options.echo_output, Some(&paths.output)).await?;

    info!(
        build_id = %build.id(),
        run_id = %run_id,
        output = %paths.output.display(),
        "Starting local run"
    );

    let result = build.run(sink.sender()).await;
    sink.finish().await;

    Ok(RunSummary {
        build_id: build.id(),
        run_id,
        project: project.name,
        paths,
        error: result.err().map(|e| e.to_string()),
    })
}
