// src/file_manager.rs - loads G-code files for upload
use std::path::Path;
use thiserror::Error;
use tokio::fs;

use crate::upload::UploadJob;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot derive an SD file name from {0}")]
    NoFileName(String),
}

#[derive(Debug, Clone, Default)]
pub struct FileManager;

impl FileManager {
    pub fn new() -> Self {
        Self
    }

    pub async fn read_gcode_file(&self, path: &Path) -> Result<String, FileError> {
        tracing::info!("Reading G-code file: {}", path.display());
        fs::read_to_string(path).await.map_err(|source| FileError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    /// Lines for SD upload. Kept verbatim apart from line endings; the firmware
    /// stores exactly what it receives.
    pub async fn read_upload_lines(&self, path: &Path) -> Result<Vec<String>, FileError> {
        let content = self.read_gcode_file(path).await?;
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        tracing::info!("Loaded {} lines from {}", lines.len(), path.display());
        Ok(lines)
    }

    /// Build an upload job, naming it after the file unless `name` is given.
    pub async fn read_upload_job(&self, path: &Path, name: Option<&str>) -> Result<UploadJob, FileError> {
        let file_name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| FileError::NoFileName(path.display().to_string()))?,
        };
        let lines = self.read_upload_lines(path).await?;
        Ok(UploadJob::new(file_name, lines))
    }
}
