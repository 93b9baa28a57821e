//! Error types for Cimple.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    // Scheduling errors
    #[error("Unable to find a worker for chore {0}")]
    NoWorkerAvailable(u64),

    #[error("Agent disconnected: {0}")]
    AgentDisconnected(String),

    #[error("Agent {agent} refused the build: {reason}")]
    BuildRefused { agent: String, reason: String },

    #[error("Agent did not complete the job within {seconds} seconds")]
    PerformTimeout { seconds: u64 },

    // Build errors
    #[error("Step {step} failed: {message}")]
    StepExecution { step: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Cycle detected in task dependencies involving {0}")]
    CycleDetected(String),

    #[error("Unknown task dependency: {0}")]
    UnknownDependency(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure belongs to the transport or scheduling layer and
    /// the affected chore should be handed to another worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ConnectionClosed
                | Error::NoWorkerAvailable(_)
                | Error::AgentDisconnected(_)
                | Error::BuildRefused { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Every problem found while loading a project configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigError {
    issues: Vec<String>,
}

impl ConfigError {
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    pub fn push(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// `Ok(())` when no issue was collected.
    pub fn into_result(self) -> std::result::Result<(), ConfigError> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration has {} issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "\n  - {}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}
