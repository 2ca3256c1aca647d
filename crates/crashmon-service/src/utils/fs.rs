//! A small directory abstraction over the on-disk stores.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use glob::Pattern;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Runs `f` and maps a `NotFound` error to `Ok(None)`.
pub fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(result) => Ok(Some(result)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Writes `contents` to `path` through a temporary sibling file and an atomic rename.
///
/// Readers observe either the previous or the new contents, never a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// A directory on the local file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens the directory at `path`, creating it and all its parents if necessary.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let directory = Self::new(path);
        fs::create_dir_all(&directory.path)?;
        Ok(directory)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Path of the file `name` inside this directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// The subdirectory `name`, which is not created.
    pub fn directory(&self, name: &str) -> Directory {
        Directory::new(self.path.join(name))
    }

    /// Lists the regular files whose names match the glob `pattern`, sorted by name.
    ///
    /// A missing directory has no files.
    pub fn files(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let pattern = Pattern::new(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let Some(entries) = catch_not_found(|| fs::read_dir(&self.path))? else {
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if name.to_str().is_some_and(|name| pattern.matches(name)) {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Lists the immediate subdirectories, sorted by name.
    pub fn directories(&self) -> io::Result<Vec<Directory>> {
        let Some(entries) = catch_not_found(|| fs::read_dir(&self.path))? else {
            return Ok(Vec::new());
        };

        let mut directories = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                directories.push(Directory::new(entry.path()));
            }
        }

        directories.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(directories)
    }

    /// Total size in bytes of all files below this directory.
    pub fn size(&self) -> io::Result<u64> {
        let mut total = 0;
        for entry in WalkDir::new(&self.path) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.io_error().map(|e| e.kind()) == Some(io::ErrorKind::NotFound) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if entry.file_type().is_file() {
                total += catch_not_found(|| entry.metadata().map_err(io::Error::from))?
                    .map_or(0, |metadata| metadata.len());
            }
        }
        Ok(total)
    }

    /// Removes the directory with all its contents. Removing a missing directory succeeds.
    pub fn remove(&self) -> io::Result<()> {
        catch_not_found(|| fs::remove_dir_all(&self.path))?;
        Ok(())
    }
}
