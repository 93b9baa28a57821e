//! Append-only journal of build events, fanned out to writers.

use async_trait::async_trait;
use cimple_core::events::{Event, JournalRecord};
use cimple_core::{Error, Result};
use console::{Term, style};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// A destination for journal records. Writers may be called from several
/// tasks at once and serialize internally.
#[async_trait]
pub trait JournalWriter: Send + Sync {
    async fn write(&self, record: &JournalRecord) -> Result<()>;
}

/// Fans every recorded event out to all writers.
#[derive(Clone, Default)]
pub struct Journal {
    writers: Arc<Vec<Arc<dyn JournalWriter>>>,
}

impl Journal {
    pub fn new(writers: Vec<Arc<dyn JournalWriter>>) -> Self {
        Self {
            writers: Arc::new(writers),
        }
    }

    /// A journal that records nothing.
    pub fn discard() -> Self {
        Self::default()
    }

    /// Record an event. A failing writer is logged and skipped.
    pub async fn record(&self, event: Event) {
        let record = JournalRecord::now(event);
        for writer in self.writers.iter() {
            if let Err(e) = writer.write(&record).await {
                warn!(event = record.event.type_name(), error = %e, "Failed to write journal record");
            }
        }
    }
}

/// How the console writer renders records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JournalFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for JournalFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(JournalFormat::Text),
            "json" => Ok(JournalFormat::Json),
            other => Err(Error::Serialization(format!("Unknown journal format: {}", other))),
        }
    }
}

impl JournalFormat {
    pub fn format(&self, record: &JournalRecord) -> Result<String> {
        match self {
            JournalFormat::Json => Ok(serde_json::to_string(record)?),
            JournalFormat::Text => Ok(style(format!(
                "[{} - {}]",
                record.time.to_rfc3339(),
                record.event.type_name()
            ))
            .blue()
            .to_string()),
        }
    }
}

/// Writes records to stderr.
pub struct ConsoleJournalWriter {
    format: JournalFormat,
    term: Mutex<Term>,
}

impl ConsoleJournalWriter {
    pub fn new(format: JournalFormat) -> Self {
        Self {
            format,
            term: Mutex::new(Term::stderr()),
        }
    }
}

#[async_trait]
impl JournalWriter for ConsoleJournalWriter {
    async fn write(&self, record: &JournalRecord) -> Result<()> {
        let line = self.format.format(record)?;
        let term = self
            .term
            .lock()
            .map_err(|_| Error::Internal("Console journal lock poisoned".to_string()))?;
        term.write_line(&line)?;
        Ok(())
    }
}

/// Appends one JSON record per line and syncs the file after each write.
pub struct FileJournalWriter {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl FileJournalWriter {
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JournalWriter for FileJournalWriter {
    async fn write(&self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemoryJournalWriter {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournalWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.records().iter().map(|r| r.event.type_name()).collect()
    }
}

#[async_trait]
impl JournalWriter for MemoryJournalWriter {
    async fn write(&self, record: &JournalRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| Error::Internal("Memory journal lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}
