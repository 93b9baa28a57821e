//! Build graph execution and step runner for Cimple.

pub mod build;
pub mod graph;
pub mod journal;
pub mod local;
pub mod output;
pub mod publish;
pub mod step;
pub mod vars;
pub mod vcs;

pub use build::{Build, BuildConfig, apply_explicit_tasks};
pub use graph::{BuildGraph, TaskNode};
pub use journal::{
    ConsoleJournalWriter, FileJournalWriter, Journal, JournalFormat, JournalWriter,
    MemoryJournalWriter,
};
pub use local::{JournalDriver, LocalRunOptions, RunPaths, RunSummary, run_local};
pub use output::{OutputLine, OutputSink, OutputStream};
pub use publish::{PublishPlan, PublishTarget};
pub use step::{PreparedStep, StepResult, StepRunner, StepRunnerConfig};
pub use vars::{CimpleEnvironment, ProjectInfo, StepVars};
pub use vcs::VcsInformation;
