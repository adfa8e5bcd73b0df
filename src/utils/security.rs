use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Path contains parent directory (..)")]
    ContainsParentDir,

    #[error("File path is absolute")]
    AbsolutePath,

    #[error("File path contains invalid component")]
    InvalidComponent,

    #[error("File path contains null byte")]
    NullByte,

    #[error("File path is empty")]
    Empty,

    #[error("Filename contains directory separator")]
    ContainsDirectorySeparator,

    #[error("Resolved path escapes the shared folder")]
    EscapesRoot,
}

//===============
// Path Handling
//===============

// Checks for: empty strings, null bytes, parent directory traversal, absolute paths
fn validate_path_components(path_str: &str) -> Result<(), ValidationError> {
    if path_str.is_empty() {
        return Err(ValidationError::Empty);
    }

    // \0 would end the name early at the OS boundary
    if path_str.contains('\0') {
        return Err(ValidationError::NullByte);
    }

    for component in Path::new(path_str).components() {
        match component {
            Component::Normal(_) => continue,
            Component::ParentDir => return Err(ValidationError::ContainsParentDir),
            Component::RootDir => return Err(ValidationError::AbsolutePath),
            Component::CurDir => continue,
            Component::Prefix(_) => return Err(ValidationError::InvalidComponent), // Windows
        }
    }

    Ok(())
}

/// A peer-supplied name must be one plain file name inside a single directory.
pub fn validate_filename(filename: &str) -> Result<(), ValidationError> {
    validate_path_components(filename)?;

    // backslash too, a name from a windows peer could still carry a dir
    if filename.contains('/') || filename.contains('\\') {
        return Err(ValidationError::ContainsDirectorySeparator);
    }
    if filename == "." {
        return Err(ValidationError::InvalidComponent);
    }

    Ok(())
}

/// Joins a validated name onto `dir`.
pub fn join_filename(dir: &Path, filename: &str) -> Result<PathBuf, ValidationError> {
    // join is only safe because the name was checked first
    validate_filename(filename)?;
    Ok(dir.join(filename))
}

/// `resolved` and `root` must both be canonical.
pub fn ensure_within(root: &Path, resolved: &Path) -> Result<(), ValidationError> {
    // canonicalize already followed symlinks, so a link pointing out fails here
    if resolved.parent() == Some(root) {
        Ok(())
    } else {
        Err(ValidationError::EscapesRoot)
    }
}
