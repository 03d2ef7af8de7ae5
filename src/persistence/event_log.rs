//! Append-only audit log
//!
//! Engines push records onto an unbounded channel; a single writer task
//! drains it and appends one JSON line per record, in emission order. The
//! log is never read back by the engines.

use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Sender side handed to the engines
#[derive(Debug, Clone)]
pub struct EventLog {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl EventLog {
    /// Start the writer task for `path`
    pub fn spawn(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();

        let handle = tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        error!("Cannot create log directory {}: {}", parent.display(), e);
                    }
                }
            }

            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Unserializable audit record: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');

                let written: std::io::Result<()> = async {
                    let mut file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await?;
                    file.write_all(&line).await?;
                    file.flush().await
                }
                .await;

                if let Err(e) = written {
                    error!("Failed to append to {}: {}", path.display(), e);
                }
            }

            debug!("Audit log writer for {} stopped", path.display());
        });

        (Self { tx }, handle)
    }

    /// A log that drops everything, for engines running without a data directory
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Queue a record for appending
    pub fn append<T: Serialize>(&self, record: &T) {
        match serde_json::to_value(record) {
            Ok(value) => {
                // Receiver gone means the writer shut down; nothing left to do
                let _ = self.tx.send(value);
            }
            Err(e) => error!("Unserializable audit record: {}", e),
        }
    }
}
