use log::trace;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error in [`Directory`] adapter.
#[derive(Error, Clone, Debug)]
pub enum DirectoryError {
    /// Failed to open or create the directory.
    #[error("failed to open directory {path}: {message}")]
    OpenError { path: PathBuf, message: String },

    /// Failed to list the content.
    #[error("failed to list directory {path}: {message}")]
    ListError { path: PathBuf, message: String },

    /// Failed to resolve absolute path.
    #[error("failed to resolve {path}: {message}")]
    CanonicalizeError { path: PathBuf, message: String },
}

/// Directory adapter.
///
/// Holds an absolute, canonical path to an existing directory.
#[derive(Clone, PartialEq, Eq)]
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    /// Open existing directory.
    ///
    /// # Errors
    ///
    /// - Returns error if `path` does not exist or is not a directory.
    pub fn open(path: &Path) -> Result<Self, DirectoryError> {
        let metadata = fs::metadata(path).map_err(|e| DirectoryError::OpenError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(DirectoryError::OpenError {
                path: path.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }
        let path = fs::canonicalize(path).map_err(|e| DirectoryError::CanonicalizeError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self { path })
    }

    /// Open directory, creating it (with parents) if it doesn't exist.
    pub fn open_or_create(path: &Path) -> Result<Self, DirectoryError> {
        if !path.exists() {
            trace!("mkdir: {}", path.display());
            fs::create_dir_all(path).map_err(|e| DirectoryError::OpenError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        Self::open(path)
    }

    /// Path to directory.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Regular files directly inside the directory whose names end with `suffix`.
    ///
    /// Hidden files (starting with `.`) are skipped. Result is sorted by name.
    pub fn files_with_suffix(&self, suffix: &str) -> Result<Vec<PathBuf>, DirectoryError> {
        let list_err = |e: std::io::Error| DirectoryError::ListError {
            path: self.path.clone(),
            message: e.to_string(),
        };
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(suffix) {
                continue;
            }
            if entry.file_type().map_err(list_err)?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path.display()))
    }
}
