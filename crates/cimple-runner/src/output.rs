//! Step output lines and the sink they are written to.

use chrono::{DateTime, Utc};
use cimple_core::Result;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Collects the output of every step of a build and writes it to the
/// console and/or an output file.
pub struct OutputSink {
    tx: mpsc::Sender<OutputLine>,
    task: JoinHandle<()>,
    captured: Option<Arc<Mutex<Vec<String>>>>,
}

#[derive(Default)]
struct Targets {
    echo: bool,
    file: Option<BufWriter<File>>,
    captured: Option<Arc<Mutex<Vec<String>>>>,
}

impl OutputSink {
    /// Echo lines to the process stdout and, if given, append them to `path`.
    pub async fn new(echo: bool, path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Some(BufWriter::new(File::create(path).await?))
            }
            None => None,
        };

        Ok(Self::spawn(Targets {
            echo,
            file,
            captured: None,
        }))
    }

    /// Keep lines in memory only.
    pub fn capturing() -> Self {
        Self::spawn(Targets {
            captured: Some(Arc::new(Mutex::new(Vec::new()))),
            ..Default::default()
        })
    }

    fn spawn(mut targets: Targets) -> Self {
        let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
        let captured = targets.captured.clone();

        let task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if targets.echo {
                    println!("{}", line.content);
                }
                if let Some(file) = targets.file.as_mut() {
                    let written = async {
                        file.write_all(line.content.as_bytes()).await?;
                        file.write_all(b"\n").await
                    };
                    if let Err(e) = written.await {
                        warn!(error = %e, "Failed to write build output");
                    }
                }
                if let Some(captured) = &targets.captured
                    && let Ok(mut lines) = captured.lock()
                {
                    lines.push(line.content);
                }
            }

            if let Some(file) = targets.file.as_mut()
                && let Err(e) = file.flush().await
            {
                warn!(error = %e, "Failed to flush build output");
            }
        });

        Self { tx, task, captured }
    }

    pub fn sender(&self) -> mpsc::Sender<OutputLine> {
        self.tx.clone()
    }

    /// Wait until every line sent so far has been written.
    pub async fn finish(self) -> Vec<String> {
        drop(self.tx);
        let _ = self.task.await;
        let Some(captured) = self.captured else {
            return Vec::new();
        };
        let lines = match captured.lock() {
            Ok(lines) => lines.clone(),
            Err(_) => Vec::new(),
        };
        lines
    }
}
