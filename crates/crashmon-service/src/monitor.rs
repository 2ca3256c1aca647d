//! The service loop: analyze pending reports, upload crash groups, fetch new reports.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::analyzer::Analyzer;
use crate::config::{Config, Options};
use crate::crash_server::CrashServer;
use crate::dump_tool::{CdbDumpAnalyzer, Distributions, DumpAnalyzer, DumpToolCache};
use crate::fetch::Fetcher;
use crate::report::Report;
use crate::store::{CrashId, Record, Records, ReportStore};
use crate::tracker::{IssueTracker, UpdateOutcome};
use crate::upload::{Uploader, group_records};
use crate::utils::Directory;

/// The service was asked to shut down.
#[derive(Debug, Error)]
#[error("service was interrupted")]
pub struct Interrupted;

/// Owns the records and drives all phases of the service.
///
/// Records are only mutated here, after the workers of a phase have finished.
#[derive(Debug)]
pub struct Monitor {
    options: Options,
    records: Records,
    store: ReportStore,
    analyzer: Arc<Analyzer>,
    fetcher: Fetcher,
    uploader: Uploader,
    /// Issues by crash id which were created by a failed sync and have no reports yet.
    created: BTreeMap<String, String>,
    cancel: CancellationToken,
}

impl Monitor {
    /// Creates a monitor analyzing minidumps with the configured debugger.
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let debugger =
            CdbDumpAnalyzer::new(&config.analyze.debugger, config.analyze.debugger_timeout);
        Self::with_dump_analyzer(config, cancel, Arc::new(debugger))
    }

    pub fn with_dump_analyzer(
        config: &Config,
        cancel: CancellationToken,
        dump_analyzer: Arc<dyn DumpAnalyzer>,
    ) -> Result<Self> {
        let options = config.options.clone();
        let store = ReportStore::open(
            Directory::new(options.reports_directory()),
            options.reports_size_limit,
        )?;
        let records = Records::load(options.records_path())?;

        let tools_directory = Directory::create(options.dump_tool_directory())
            .context("failed to create dump tool directory")?;
        let dists = Distributions::new(
            config.analyze.dist_urls.clone(),
            config.analyze.dist_timeout,
        )
        .context("failed to create distribution client")?;
        let dump_tools = DumpToolCache::new(
            tools_directory,
            options.dump_tool_size_limit,
            dists,
            dump_analyzer,
        );
        let analyzer = Arc::new(Analyzer::new(
            store.clone(),
            Some(Arc::new(dump_tools)),
            config.analyze.thread_count,
        ));

        let server =
            CrashServer::new(&config.fetch).context("failed to create crash server client")?;
        let fetcher = Fetcher::new(server, store.clone(), config.fetch.thread_count);

        let tracker =
            IssueTracker::new(&config.upload).context("failed to create tracker client")?;
        let uploader = Uploader::new(
            tracker,
            Arc::clone(&analyzer),
            store.clone(),
            config.upload.thread_count,
        );

        tracing::info!(
            "Monitoring in {} with {} known reports",
            options.directory.display(),
            records.len()
        );
        Ok(Self {
            options,
            records,
            store,
            analyzer,
            fetcher,
            uploader,
            created: BTreeMap::new(),
            cancel,
        })
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Runs the phases in a loop until the service is cancelled.
    ///
    /// Failed iterations are logged and retried after the stand-by period.
    pub async fn run_service(&mut self) -> Result<()> {
        loop {
            let Err(error) = self.run_once().await else {
                continue;
            };
            if error.is::<Interrupted>() {
                break;
            }

            tracing::error!(error = ?error, "Service iteration failed");
            if let Err(e) = self.save_records().await {
                tracing::error!(error = ?e, "Unable to save records");
            }
            if self.stand_by().await.is_err() {
                break;
            }
        }

        tracing::info!("Service has stopped");
        Ok(())
    }

    /// A single loop iteration. Fetching repeats after stand-by until new reports arrive.
    pub async fn run_once(&mut self) -> Result<()> {
        self.check_interrupted()?;
        self.analyze().await?;
        self.check_interrupted()?;
        self.upload().await?;
        loop {
            self.check_interrupted()?;
            if self.fetch().await? > 0 {
                return Ok(());
            }
            self.stand_by().await?;
        }
    }

    /// Analyzes all pending reports and records their crash ids.
    ///
    /// Reports which cannot be analyzed are tombstoned. Afterwards the store budgets are
    /// enforced.
    pub async fn analyze(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut reports = Vec::new();
        let mut tombstoned = 0;
        for name in self.records.pending() {
            match Report::parse(&name) {
                Ok(report) if self.store.contains(&name) => reports.push(report),
                Ok(_) => {
                    tracing::warn!("Report {} is missing", name);
                    self.records.insert(name, Record::analyzed(CrashId::Failed));
                    tombstoned += 1;
                }
                Err(e) => {
                    tracing::warn!("Unable to analyze: {}", e);
                    self.records.insert(name, Record::analyzed(CrashId::Failed));
                    tombstoned += 1;
                }
            }
        }

        if !reports.is_empty() {
            tracing::info!("Analyzing {} reports", reports.len());
        }
        let mut failed = 0;
        let analyzed = reports.len();
        for (report, result) in self.analyzer.analyze_all(reports).await {
            let crash_id = match result {
                Ok(reason) => {
                    metric!(counter("reports.analyzed") += 1, "result" => "ok");
                    CrashId::Hash(reason.crash_id())
                }
                Err(e) => {
                    metric!(counter("reports.analyzed") += 1, "result" => "failed");
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        "Unable to analyze {}",
                        report
                    );
                    failed += 1;
                    CrashId::Failed
                }
            };
            self.records.insert(report.name(), Record::analyzed(crash_id));
        }
        if failed > 0 {
            tracing::info!("{} reports could not be analyzed", failed);
        }

        if analyzed > 0 || tombstoned > 0 {
            self.save_records().await?;
        }
        self.enforce_budgets(true).await?;
        metric!(timer("phase.duration") = started.elapsed(), "phase" => "analyze");
        Ok(())
    }

    /// Creates and updates issues for all crash groups ready for upload.
    ///
    /// Reports added to an issue are removed from the store. Groups which fail stay untouched
    /// and are retried in the next phase. An issue created by a failed group is remembered, so
    /// the retry adds the reports to it instead of creating another one.
    pub async fn upload(&mut self) -> Result<()> {
        let started = Instant::now();
        let groups = group_records(
            &self.records,
            &self.created,
            self.options.min_report_count,
        );
        if groups.is_empty() {
            tracing::debug!("No crash groups to upload");
            return Ok(());
        }

        tracing::info!("Uploading {} crash groups", groups.len());
        let mut synced_reports = Vec::new();
        for result in self.uploader.upload(groups).await {
            match result {
                Ok(synced) => {
                    self.created.remove(&synced.crash_id);
                    if synced.outcome == UpdateOutcome::AlreadyFixed {
                        tracing::info!(
                            "Issue {} is already fixed, dropping {} reports",
                            synced.issue,
                            synced.reports.len()
                        );
                    }
                    for report in &synced.reports {
                        self.set_issue(report.name(), &synced.issue);
                    }
                    synced_reports.extend(synced.reports);
                }
                Err(e) => {
                    tracing::error!(error = &e as &dyn std::error::Error, "Upload failed");
                    if let Some(issue) = e.created {
                        tracing::info!("Issue {} gets its reports in the next phase", issue);
                        self.created.insert(e.crash_id, issue);
                    }
                }
            }
        }

        self.save_records().await?;
        self.remove_reports(synced_reports).await?;
        metric!(timer("phase.duration") = started.elapsed(), "phase" => "upload");
        Ok(())
    }

    /// Downloads new reports and registers them as pending. Returns the number of new reports.
    pub async fn fetch(&mut self) -> Result<usize> {
        let started = Instant::now();
        let reports = self
            .fetcher
            .fetch(
                self.options.reports_each_run,
                &self.records,
                &self.options.min_version,
                &self.options.extension,
                &self.cancel,
            )
            .await
            .context("failed to fetch reports")?;

        for report in &reports {
            self.records.insert(report.name(), Record::default());
        }
        if !reports.is_empty() {
            self.save_records().await?;
        }

        self.enforce_budgets(false).await?;
        metric!(timer("phase.duration") = started.elapsed(), "phase" => "fetch");
        Ok(reports.len())
    }

    /// Sleeps for the stand-by period unless the service is cancelled first.
    pub async fn stand_by(&self) -> Result<(), Interrupted> {
        let sleep = self.options.stand_by_sleep();
        tracing::debug!("Standing by for {}", humantime::format_duration(sleep));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupted),
            _ = tokio::time::sleep(sleep) => Ok(()),
        }
    }

    fn check_interrupted(&self) -> Result<(), Interrupted> {
        match self.cancel.is_cancelled() {
            true => Err(Interrupted),
            false => Ok(()),
        }
    }

    async fn save_records(&self) -> Result<()> {
        let records = self.records.clone();
        tokio::task::spawn_blocking(move || records.save()).await??;
        Ok(())
    }

    /// Removes the files of reports which are attached to their issues.
    async fn remove_reports(&self, reports: Vec<Report>) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            for report in reports {
                if let Err(e) = store.remove(report.name()) {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        "Unable to remove {}",
                        report
                    );
                }
            }
        })
        .await?;
        Ok(())
    }

    fn set_issue(&mut self, name: &str, issue: &str) {
        if let Some(record) = self.records.get_mut(name) {
            record.issue = Some(issue.to_owned());
        }
    }

    async fn enforce_budgets(&self, with_dump_tools: bool) -> Result<()> {
        let store = self.store.clone();
        let records = self.records.clone();
        let analyzer = Arc::clone(&self.analyzer);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            store.enforce_budget(&records)?;
            if let Some(dump_tools) = analyzer.dump_tools().filter(|_| with_dump_tools) {
                dump_tools.cleanup()?;
            }
            Ok(())
        })
        .await?
        .context("failed to enforce store size limits")
    }
}
