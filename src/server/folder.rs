//! The one directory a server shares.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::common::{AppError, SessionError, TransferError};
use crate::utils::security::{ensure_within, join_filename};

/// A file found while listing the shared folder. Not kept past one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SharedFolder {
    /// Canonical
    root: PathBuf,
}

impl SharedFolder {
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        let shared_folder = |source| AppError::SharedFolder {
            path: path.to_path_buf(),
            source,
        };

        let root = tokio::fs::canonicalize(path).await.map_err(shared_folder)?;
        let metadata = tokio::fs::metadata(&root).await.map_err(shared_folder)?;
        if !metadata.is_dir() {
            return Err(shared_folder(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a directory",
            )));
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a peer-supplied name to a file directly inside the folder.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, TransferError> {
        let candidate =
            join_filename(&self.root, name).map_err(|e| TransferError::invalid_name(name, e))?;

        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|source| TransferError::FileNotFound {
                path: candidate.clone(),
                source,
            })?;

        // symlinks may point anywhere
        ensure_within(&self.root, &resolved).map_err(|e| TransferError::invalid_name(name, e))?;
        Ok(resolved)
    }

    /// Lists regular files in the folder, fresh on every call, in filesystem order.
    pub async fn list(&self) -> Result<Vec<DirectoryEntry>, SessionError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_blocking(&root))
            .await
            .map_err(io::Error::other)
            .and_then(|listed| listed)
            .map_err(|source| SessionError::Listing {
                path: self.root.clone(),
                source,
            })
    }
}

fn list_blocking(root: &Path) -> io::Result<Vec<DirectoryEntry>> {
    // an unreadable root is an error, not an empty listing
    std::fs::read_dir(root)?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            tracing::debug!(entry = %entry.path().display(), "skipping non-file entry");
            continue;
        }

        entries.push(DirectoryEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.into_path(),
        });
    }

    Ok(entries)
}
