//! Reconciliation of analysed reports with the issue tracker.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{StreamExt, stream};
use thiserror::Error;

use crate::analyzer::{AnalysisError, Analyzer};
use crate::jira::TrackerError;
use crate::report::Report;
use crate::store::{CrashId, ReportStore, Records};
use crate::tracker::{IssueTracker, UpdateOutcome};

/// Reports sharing a crash id, together with the issue of the crash if there is one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashGroup {
    pub crash_id: String,
    pub issue: Option<String>,
    /// Reports not attached to an issue yet.
    pub reports: Vec<Report>,
}

/// Groups analysed records by crash id.
///
/// `created` maps crash ids to issues which exist before any of their reports is attached.
/// Only groups with unattached reports are returned, and groups without an issue only once
/// they have at least `min_report_count` reports.
pub fn group_records(
    records: &Records,
    created: &BTreeMap<String, String>,
    min_report_count: usize,
) -> Vec<CrashGroup> {
    let mut groups: BTreeMap<&str, CrashGroup> = BTreeMap::new();
    for (name, record) in records.iter() {
        let Some(crash_id) = record.crash_id.as_ref().and_then(CrashId::as_hash) else {
            continue;
        };
        let group = groups.entry(crash_id).or_insert_with(|| CrashGroup {
            crash_id: crash_id.to_owned(),
            issue: None,
            reports: Vec::new(),
        });

        match &record.issue {
            Some(issue) => group.issue = Some(issue.clone()),
            None => match Report::parse(name) {
                Ok(report) => group.reports.push(report),
                Err(e) => tracing::warn!("Skipping analysed record: {}", e),
            },
        }
    }

    for group in groups.values_mut() {
        if group.issue.is_none() {
            group.issue = created.get(&group.crash_id).cloned();
        }
    }

    groups
        .into_values()
        .filter(|group| {
            !group.reports.is_empty()
                && (group.issue.is_some() || group.reports.len() >= min_report_count)
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unable to analyze {report} again")]
    Analysis {
        report: String,
        #[source]
        source: AnalysisError,
    },
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// A crash group that was reconciled with its issue.
#[derive(Debug)]
pub struct Synced {
    pub crash_id: String,
    pub issue: String,
    pub reports: Vec<Report>,
    pub outcome: UpdateOutcome,
}

/// Failure to reconcile a crash group.
#[derive(Debug, Error)]
#[error("unable to sync crash {crash_id}")]
pub struct SyncError {
    pub crash_id: String,
    /// The issue created for the group before the failure, if any.
    pub created: Option<String>,
    #[source]
    pub source: UploadError,
}

/// Creates and updates issues for crash groups.
#[derive(Debug)]
pub struct Uploader {
    tracker: IssueTracker,
    analyzer: Arc<Analyzer>,
    store: ReportStore,
    thread_count: usize,
}

impl Uploader {
    pub fn new(
        tracker: IssueTracker,
        analyzer: Arc<Analyzer>,
        store: ReportStore,
        thread_count: usize,
    ) -> Self {
        Self {
            tracker,
            analyzer,
            store,
            thread_count,
        }
    }

    /// Reconciles all `groups` concurrently.
    pub async fn upload(&self, groups: Vec<CrashGroup>) -> Vec<Result<Synced, SyncError>> {
        stream::iter(groups)
            .map(|group| self.jira_sync(group))
            .buffer_unordered(self.thread_count.max(1))
            .collect()
            .await
    }

    /// Creates the issue of `group` if needed and adds the group's reports to it.
    #[tracing::instrument(skip_all, fields(crash_id = %group.crash_id))]
    pub async fn jira_sync(&self, group: CrashGroup) -> Result<Synced, SyncError> {
        let CrashGroup {
            crash_id,
            issue,
            reports,
        } = group;
        let error = |created: Option<String>, source: UploadError| SyncError {
            crash_id: crash_id.clone(),
            created,
            source,
        };

        let (issue, created) = match issue {
            Some(issue) => (issue, None),
            None => {
                let Some(report) = reports.first() else {
                    let source = TrackerError::Other("empty crash group".into());
                    return Err(error(None, source.into()));
                };
                let reason = self.analyzer.analyze(report).await.map_err(|source| {
                    let source = UploadError::Analysis {
                        report: report.to_string(),
                        source,
                    };
                    error(None, source)
                })?;
                let issue = self
                    .tracker
                    .create_issue(report, &reason)
                    .await
                    .map_err(|e| error(None, e.into()))?;
                (issue.clone(), Some(issue))
            }
        };

        match self.tracker.update_issue(&issue, &reports, &self.store).await {
            Ok(outcome) => Ok(Synced {
                crash_id,
                issue,
                reports,
                outcome,
            }),
            Err(e) => Err(error(created, e.into())),
        }
    }
}
