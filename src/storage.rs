//! On-disk storage for original evidence files.
//!
//! Layout: `<root>/<submission_id>/<submission_id>_<index>_<sanitized_name>`.
//! Files are write-once; a startup janitor removes directories that have
//! no matching submission row and are older than the grace period.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::SourceFile;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("File not found")]
    NotFound,
}

/// A stored file and its relative URL path.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub absolute: PathBuf,
    /// `<submission_id>/<stored_name>`, served under `/api/v1/files/`.
    pub relative: String,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist one uploaded file under its submission directory.
    pub fn store(
        &self,
        submission_id: &Uuid,
        index: usize,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StorageError> {
        let dir = self.root.join(submission_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let stored_name = format!(
            "{submission_id}_{index}_{}",
            sanitize_filename(original_name)
        );
        let absolute = dir.join(&stored_name);
        std::fs::write(&absolute, bytes)?;
        Ok(StoredFile {
            relative: format!("{submission_id}/{stored_name}"),
            absolute,
        })
    }

    /// Resolve a client-supplied relative path to an absolute path under
    /// the root. Traversal components are rejected before touching the
    /// filesystem.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        if relative.is_empty()
            || relative.starts_with('/')
            || relative.contains('\\')
            || relative.contains("..")
            || relative.contains('\0')
        {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        let candidate = self.root.join(relative);
        let canonical_root = self.root.canonicalize()?;
        let canonical = candidate.canonicalize().map_err(|_| StorageError::NotFound)?;
        if !canonical.starts_with(&canonical_root) {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        Ok(canonical)
    }

    /// Re-read the stored originals for a submission, for rerun.
    pub fn read_submission_files(
        &self,
        submission_id: &Uuid,
    ) -> Result<Vec<SourceFile>, StorageError> {
        let dir = self.root.join(submission_id.to_string());
        if !dir.is_dir() {
            return Err(StorageError::NotFound);
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let bytes = std::fs::read(dir.join(&name))?;
            files.push(SourceFile {
                mime: mime_for_filename(&name).to_string(),
                filename: name,
                bytes,
            });
        }
        if files.is_empty() {
            return Err(StorageError::NotFound);
        }
        Ok(files)
    }

    /// Delete submission directories with no database row that are older
    /// than `max_age`. Returns the number of directories removed.
    pub fn reap_orphans(&self, known_ids: &HashSet<String>, max_age: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if known_ids.contains(name) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if !old_enough {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!(dir = %path.display(), "Janitor removed orphan upload");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "Janitor failed to remove orphan");
                }
            }
        }
        removed
    }
}

/// Reduce an original filename to a safe single component: final path
/// segment only, conservative character set, bounded length.
pub fn sanitize_filename(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original);
    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        cleaned = "upload".to_string();
    }
    if cleaned.len() > 80 {
        cleaned = cleaned[cleaned.len() - 80..].to_string();
    }
    cleaned
}

/// MIME type by file extension, for serving and rerun.
pub fn mime_for_filename(name: &str) -> &'static str {
    let extension = name.rsplit('.').next().unwrap_or_default().to_lowercase();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Whether an uploaded MIME type is accepted for ingestion.
pub fn is_supported_mime(mime: &str) -> bool {
    mime.starts_with("image/") || mime == "application/pdf"
}
