//! Downloading of new reports from the crash server.

use std::io;

use futures::{StreamExt, stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::crash_server::{CrashServer, CrashServerError};
use crate::report::Report;
use crate::store::{ReportStore, Records};

/// Failure to download a single report.
#[derive(Debug, Error)]
enum DownloadError {
    #[error(transparent)]
    Server(#[from] CrashServerError),
    #[error("unable to store report")]
    Io(#[from] io::Error),
    #[error("fetch was cancelled")]
    Cancelled,
}

/// Downloads reports unknown to the records into the store.
#[derive(Debug)]
pub struct Fetcher {
    server: CrashServer,
    store: ReportStore,
    thread_count: usize,
}

impl Fetcher {
    pub fn new(server: CrashServer, store: ReportStore, thread_count: usize) -> Self {
        Self {
            server,
            store,
            thread_count,
        }
    }

    /// Downloads at most `report_count` reports which are not `known`.
    ///
    /// Reports of versions below `min_version` and reports with unparseable names are skipped.
    /// Failed downloads are logged and left for the next call. Returns the stored reports.
    pub async fn fetch(
        &self,
        report_count: usize,
        known: &Records,
        min_version: &str,
        extension: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Report>, CrashServerError> {
        let mut to_download = Vec::new();
        for name in self.server.list_all(extension).await? {
            if to_download.len() >= report_count {
                break;
            }
            if known.contains(&name) {
                continue;
            }
            match Report::parse(&name) {
                Ok(report) if report.version() < min_version => {}
                Ok(report) => to_download.push(report),
                Err(e) => tracing::debug!("Skipping report: {}", e),
            }
        }
        tracing::info!("Found {} new reports on server to fetch", to_download.len());

        let results: Vec<_> = stream::iter(to_download)
            .map(|report| async move {
                let result = self.download(&report, cancel).await;
                (report, result)
            })
            .buffered(self.thread_count.max(1))
            .collect()
            .await;

        let mut downloaded = Vec::with_capacity(results.len());
        for (report, result) in results {
            match result {
                Ok(()) => downloaded.push(report),
                Err(DownloadError::Cancelled) => {}
                Err(DownloadError::Server(e)) => {
                    metric!(counter("reports.fetch_failed") += 1);
                    tracing::warn!(error = %e, "Unable to fetch {}", report);
                }
                Err(e) => {
                    metric!(counter("reports.fetch_failed") += 1);
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Unable to fetch {}",
                        report
                    );
                }
            }
        }

        metric!(counter("reports.fetched") += downloaded.len() as i64);
        tracing::info!("Fetched {} new reports from server", downloaded.len());
        Ok(downloaded)
    }

    async fn download(
        &self,
        report: &Report,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let content = self.server.get(report.name()).await?;
        self.store.write(report.name(), content).await?;
        tracing::trace!("Fetched {}", report);
        Ok(())
    }
}
