//! Append-only transcript of every broadcast line
//!
//! The file is opened lazily in create+append mode and kept open. Writers
//! are serialized so a line is always written in one piece. When a write
//! fails the handle is dropped and the next call reopens the file.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ChatError, Result};

/// Default transcript location, relative to the working directory
pub const DEFAULT_TRANSCRIPT_PATH: &str = "history.log";

#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Transcript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `text` verbatim
    pub async fn log(&self, text: &str) -> Result<()> {
        let mut file = self.file.lock().await;

        if file.is_none() {
            *file = Some(self.open().await?);
        }

        let Some(handle) = file.as_mut() else {
            return Err(ChatError::internal("Transcript handle missing after open"));
        };

        let written = async {
            handle.write_all(text.as_bytes()).await?;
            handle.flush().await
        }
        .await;

        if let Err(e) = written {
            *file = None;
            return Err(ChatError::transcript(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e
            )));
        }

        Ok(())
    }

    async fn open(&self) -> Result<File> {
        debug!("Opening transcript {}", self.path.display());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                ChatError::transcript(format!("Failed to open {}: {}", self.path.display(), e))
            })
    }
}
