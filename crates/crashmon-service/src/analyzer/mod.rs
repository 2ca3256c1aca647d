//! Analysis of raw reports into crash reasons.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinError;

use crate::dump_tool::{DumpToolCache, DumpToolError};
use crate::report::{Extension, Report, ReportNameError};
use crate::store::ReportStore;
use crate::utils::run_concurrent;

mod backtrace;
mod reason;

pub use backtrace::{BacktraceRules, CdbRules, GdbRules, Rules};
pub use reason::Reason;

/// Failure to analyze a report. The report is considered unanalyzable.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Name(#[from] ReportNameError),
    #[error("code not found")]
    CodeNotFound,
    #[error("stack not found")]
    StackNotFound,
    #[error("unresolved call stack")]
    UnresolvedStack,
    #[error("unable to read report")]
    Io(#[from] io::Error),
    #[error("minidumps cannot be analyzed without a dump tool cache")]
    NoDumpTool,
    #[error("unable to prepare dump tools")]
    DumpTool(#[from] DumpToolError),
    #[error("debugger produced no backtrace")]
    EmptyBacktrace,
    #[error("analysis worker failed")]
    Worker(#[from] JoinError),
}

/// Turns reports of the store into [`Reason`]s.
#[derive(Debug)]
pub struct Analyzer {
    store: ReportStore,
    dump_tools: Option<Arc<DumpToolCache>>,
    thread_count: usize,
}

impl Analyzer {
    pub fn new(
        store: ReportStore,
        dump_tools: Option<Arc<DumpToolCache>>,
        thread_count: usize,
    ) -> Self {
        Self {
            store,
            dump_tools,
            thread_count,
        }
    }

    pub fn dump_tools(&self) -> Option<&DumpToolCache> {
        self.dump_tools.as_deref()
    }

    /// Analyzes a single stored report.
    #[tracing::instrument(skip_all, fields(report = %report))]
    pub async fn analyze(&self, report: &Report) -> Result<Reason, AnalysisError> {
        let rules = Rules::for_report(report);
        let content = match report.extension() {
            Extension::GdbBt | Extension::CdbBt => self.read(report.name()).await?,
            Extension::Dmp => self.dump_backtrace(report).await?,
        };

        let component = report.component();
        let reason = tokio::task::spawn_blocking(move || rules.parse(component, &content)).await??;
        tracing::trace!("Analyzed: {}", reason);
        Ok(reason)
    }

    /// Analyzes all `reports` concurrently, keeping their order.
    ///
    /// A failing or panicking worker only fails its own report.
    pub async fn analyze_all(
        self: &Arc<Self>,
        reports: Vec<Report>,
    ) -> Vec<(Report, Result<Reason, AnalysisError>)> {
        let analyzer = Arc::clone(self);
        let results = run_concurrent(reports.clone(), self.thread_count, move |report| {
            let analyzer = Arc::clone(&analyzer);
            async move { analyzer.analyze(&report).await }
        })
        .await;

        reports
            .into_iter()
            .zip(results)
            .map(|(report, result)| (report, result.unwrap_or_else(|e| Err(e.into()))))
            .collect()
    }

    async fn read(&self, name: &str) -> io::Result<String> {
        let content = tokio::fs::read(self.store.path(name)).await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// The cdb backtrace of a minidump, generated once and kept next to the dump.
    async fn dump_backtrace(&self, report: &Report) -> Result<String, AnalysisError> {
        let companion = report.companion(Extension::CdbBt);
        if self.store.contains(&companion) {
            tracing::debug!("Reusing backtrace {}", companion);
            return Ok(self.read(&companion).await?);
        }

        let dump_tools = self.dump_tools.as_ref().ok_or(AnalysisError::NoDumpTool)?;
        let dump = self.store.path(report.name());
        if !dump.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "minidump is missing").into());
        }

        let backtrace = dump_tools.backtrace(report, &dump).await?;
        if backtrace.trim().is_empty() {
            return Err(AnalysisError::EmptyBacktrace);
        }

        self.store
            .write(&companion, backtrace.clone().into())
            .await?;
        Ok(backtrace)
    }
}
