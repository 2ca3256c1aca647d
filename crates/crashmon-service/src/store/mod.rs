//! The on-disk store of raw crash reports.

use std::io;
use std::path::{Path, PathBuf};

use glob::Pattern;
use thiserror::Error;

use crate::report::Report;
use crate::utils::fs::{catch_not_found, write_atomic};
use crate::utils::{Directory, Size};

mod records;

pub use records::{CrashId, Record, Records};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt records file {}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// The reports directory. Files are named by their canonical report names.
#[derive(Clone, Debug)]
pub struct ReportStore {
    reports: Directory,
    size_limit: Size,
}

impl ReportStore {
    /// Opens the store in `reports`, creating the directory if necessary.
    pub fn open(reports: Directory, size_limit: Size) -> Result<Self, StoreError> {
        std::fs::create_dir_all(reports.path())
            .map_err(|source| StoreError::io(reports.path(), source))?;
        Ok(Self {
            reports,
            size_limit,
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.reports
    }

    pub fn size_limit(&self) -> Size {
        self.size_limit
    }

    /// Path of the file `name`, which may not exist.
    pub fn path(&self, name: &str) -> PathBuf {
        self.reports.file(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Stores a report file, replacing a previous version atomically.
    pub async fn write(&self, name: &str, content: bytes::Bytes) -> io::Result<()> {
        let path = self.path(name);
        tokio::task::spawn_blocking(move || write_atomic(&path, &content))
            .await
            .map_err(io::Error::other)?
    }

    /// Existing files of `report` and its generated artifacts, sorted by name.
    ///
    /// Other reports sharing the stem are not included.
    pub fn files(&self, report: &Report) -> io::Result<Vec<PathBuf>> {
        let artifacts = report.artifacts();
        let mask = format!("{}.*", Pattern::escape(report.stem()));
        let mut files = self.reports.files(&mask)?;
        files.retain(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| artifacts.iter().any(|artifact| artifact == name))
        });
        Ok(files)
    }

    /// Removes the file of the report `name` and its generated artifacts. Returns how many
    /// files existed.
    pub fn remove(&self, name: &str) -> io::Result<usize> {
        let files = match Report::parse(name) {
            Ok(report) => report.artifacts(),
            Err(_) => vec![name.to_owned()],
        };

        let mut removed = 0;
        for file in files {
            let path = self.path(&file);
            if catch_not_found(|| std::fs::remove_file(&path))?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn size(&self) -> io::Result<u64> {
        self.reports.size()
    }

    /// Removes the files of unanalyzable reports if the store is over its size limit.
    ///
    /// The records stay as tombstones, so the reports are not downloaded again. Returns the
    /// number of removed files.
    pub fn enforce_budget(&self, records: &Records) -> io::Result<usize> {
        let size = self.size()?;
        metric!(gauge("store.size.bytes") = size, "store" => "reports");
        if size <= self.size_limit.bytes() {
            return Ok(0);
        }

        tracing::info!(
            "Reports size {} is over the limit {}",
            Size::from_bytes(size),
            self.size_limit
        );
        let mut removed = 0;
        for (name, _) in records.iter().filter(|(_, record)| record.is_failed()) {
            removed += self.remove(name)?;
        }

        if removed > 0 {
            tracing::info!("Removed {} files of unanalyzable reports", removed);
            metric!(counter("reports.removed") += removed as i64);
        }
        Ok(removed)
    }
}
