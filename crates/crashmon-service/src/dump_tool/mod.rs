//! Bounded on-disk cache of the binaries and debug information needed to analyze minidumps.
//!
//! Every build gets its own key directory `<full_version>-<customization>-<pubtype>`, which is
//! materialised from the build distributions at most once at a time and reused afterwards.

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinError;

use crate::report::Report;
use crate::utils::{Directory, KeyedLocks, Size};

mod cdb;
mod dist;

pub use cdb::{CdbDumpAnalyzer, DumpAnalyzer};
pub use dist::Distributions;

/// Marks a completely materialised key directory.
const READY_MARKER: &str = ".ready";

/// Key directories of release builds end with this and survive cleanups.
const RELEASE_SENTINEL: &str = "release";

/// Alternative customization names used in report names.
const CUSTOMIZATION_ALIASES: &[(&str, &str)] = &[
    ("nx", "default"),
    ("networkoptix", "default"),
    ("dw", "digitalwatchdog"),
];

/// Failure to provide the tools for a build.
#[derive(Debug, Error)]
pub enum DumpToolError {
    #[error("no distribution found for build {0}")]
    BuildNotFound(String),
    #[error("no distribution archives found in {0}")]
    NoArchives(String),
    #[error("failed to download {url}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to download {url}: {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("invalid distribution archive {name}")]
    Archive {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("invalid distribution url")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("extraction task failed")]
    Worker(#[from] JoinError),
}

/// The dump tool cache shared by all analysis workers.
#[derive(Debug)]
pub struct DumpToolCache {
    directory: Directory,
    size_limit: Size,
    locks: KeyedLocks,
    dists: Distributions,
    analyzer: Arc<dyn DumpAnalyzer>,
}

impl DumpToolCache {
    pub fn new(
        directory: Directory,
        size_limit: Size,
        dists: Distributions,
        analyzer: Arc<dyn DumpAnalyzer>,
    ) -> Self {
        Self {
            directory,
            size_limit,
            locks: KeyedLocks::new(),
            dists,
            analyzer,
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// The key directory holding the tools for the build of `report`.
    pub fn key_directory(&self, report: &Report) -> Directory {
        let pubtype = if report.is_beta() { "beta" } else { "release" };
        let name = format!(
            "{}-{}-{}",
            report.full_version(),
            customization(report),
            pubtype
        );
        self.directory.directory(&name)
    }

    /// Produces the cdb backtrace text of the minidump `dump` belonging to `report`.
    pub async fn backtrace(&self, report: &Report, dump: &Path) -> Result<String, DumpToolError> {
        let tools = self.materialise(report).await?;
        Ok(self.analyzer.backtrace(dump, tools.path()).await)
    }

    /// Makes sure the key directory of `report` contains the build's tools.
    ///
    /// Concurrent calls for the same build are serialised, so only the first one downloads.
    pub async fn materialise(&self, report: &Report) -> Result<Directory, DumpToolError> {
        let tools = self.key_directory(report);
        let _guard = self.locks.lock(tools.name()).await;

        if tokio::fs::try_exists(tools.file(READY_MARKER)).await? {
            tracing::trace!("Reusing tools in {}", tools.path().display());
            return Ok(tools);
        }

        remove_tools(&tools).await?;
        tokio::fs::create_dir_all(tools.path()).await?;
        match self.dists.download(report, customization(report), &tools).await {
            Ok(count) => {
                tokio::fs::write(tools.file(READY_MARKER), b"").await?;
                tracing::info!("Prepared {} tool files in {}", count, tools.path().display());
                Ok(tools)
            }
            Err(e) => {
                if let Err(remove_error) = remove_tools(&tools).await {
                    tracing::warn!(
                        "Unable to remove {}: {}",
                        tools.path().display(),
                        remove_error
                    );
                }
                Err(e)
            }
        }
    }

    pub fn size(&self) -> io::Result<u64> {
        self.directory.size()
    }

    /// Removes all non-release key directories if the cache is over its size limit.
    ///
    /// Must not run while workers use the cache. Returns the number of removed directories.
    pub fn cleanup(&self) -> io::Result<usize> {
        let size = self.size()?;
        metric!(gauge("store.size.bytes") = size, "store" => "dump_tool");
        if size <= self.size_limit.bytes() {
            return Ok(0);
        }

        tracing::info!(
            "Dump tool cache size {} is over the limit {}",
            Size::from_bytes(size),
            self.size_limit
        );
        let mut removed = 0;
        for tools in self.directory.directories()? {
            if !tools.name().ends_with(RELEASE_SENTINEL) {
                tracing::debug!("Removing tools {}", tools.path().display());
                tools.remove()?;
                removed += 1;
            }
        }

        self.locks.prune();
        Ok(removed)
    }
}

async fn remove_tools(tools: &Directory) -> Result<(), DumpToolError> {
    let tools = tools.clone();
    tokio::task::spawn_blocking(move || tools.remove()).await??;
    Ok(())
}

fn customization(report: &Report) -> &str {
    let customization = report.customization();
    CUSTOMIZATION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == customization)
        .map_or(customization, |(_, name)| name)
}
