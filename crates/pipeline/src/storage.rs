//! Persisting converted images to the output directory.
//!
//! Files are named `<submission id>_<stem>.<ext>` and created with
//! create-new semantics, so an existing file is never overwritten; on a
//! collision a `_<n>` counter is appended to the stem.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Give up after this many collisions for one name.
const MAX_COLLISION_SUFFIX: u32 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free file name for {}", .path.display())]
    Exhausted { path: PathBuf },
}

/// Output directory writer.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` under a fresh name derived from `submission_id` and
    /// `filename`, returning the path written.
    pub async fn save(
        &self,
        submission_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let (stem, ext) = split_filename(filename);
        let base = format!("{}_{}", sanitize(submission_id), sanitize(stem));

        for n in 0..=MAX_COLLISION_SUFFIX {
            let name = match n {
                0 => format!("{base}.{ext}"),
                n => format!("{base}_{n}.{ext}"),
            };
            let path = self.dir.join(name);

            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(StorageError::Write { path, source }),
            };

            if let Err(source) = write_all(&mut file, bytes).await {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(StorageError::Write { path, source });
            }

            tracing::debug!(path = %path.display(), bytes = bytes.len(), "Saved output image");
            return Ok(path);
        }

        Err(StorageError::Exhausted {
            path: self.dir.join(format!("{base}.{ext}")),
        })
    }

    /// Best-effort removal of files written for a job that later failed.
    pub async fn discard(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial output");
            }
        }
    }
}

async fn write_all(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

fn split_filename(filename: &str) -> (&str, &str) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, ext),
        _ => (filename, "bin"),
    }
}

/// Keep names inside the output directory: anything but ASCII
/// alphanumerics, `-`, `_` and `.` becomes `_`.
fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "output".to_string()
    } else {
        trimmed.to_string()
    }
}
