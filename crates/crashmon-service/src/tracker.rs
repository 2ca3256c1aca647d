//! The issue lifecycle of crash groups: create, reopen, extend and attach.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde_json::{Value, json};

use crate::analyzer::Reason;
use crate::config::UploadConfig;
use crate::jira::{Issue, JiraClient, TrackerError};
use crate::report::Report;
use crate::store::ReportStore;

/// The project crash issues are filed in.
pub const PROJECT: &str = "VMS";

/// Custom field holding the responsible team.
const TEAM_FIELD: &str = "customfield_10200";

/// Custom field holding the epic link.
const EPIC_FIELD: &str = "customfield_10009";

/// Marks the beginning and end of the call stack in issue descriptions.
pub const CODE_FENCE: &str = "{code}";

/// Result of updating an existing issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The issue is closed and fixed in a version newer than all reports.
    AlreadyFixed,
    Updated {
        reopened: bool,
        attached: usize,
        deleted: usize,
    },
}

#[derive(Clone, Debug)]
pub struct IssueTracker {
    client: JiraClient,
    file_limit: usize,
    prefix: String,
    epic: Option<String>,
}

impl IssueTracker {
    pub fn new(config: &UploadConfig) -> Result<Self, TrackerError> {
        let client = JiraClient::new(
            &config.url,
            &config.login,
            &config.password,
            config.timeout,
        )?;
        Ok(Self::with_client(
            client,
            config.file_limit,
            &config.prefix,
            config.epic.clone(),
        ))
    }

    pub fn with_client(
        client: JiraClient,
        file_limit: usize,
        prefix: &str,
        epic: Option<String>,
    ) -> Self {
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix} ")
        };
        Self {
            client,
            file_limit,
            prefix,
            epic,
        }
    }

    pub fn client(&self) -> &JiraClient {
        &self.client
    }

    pub fn epic(&self) -> Option<&str> {
        self.epic.as_deref()
    }

    /// Creates an issue for the crash `reason` first seen in `report`. Returns the issue key.
    #[tracing::instrument(skip_all, fields(report = %report))]
    pub async fn create_issue(
        &self,
        report: &Report,
        reason: &Reason,
    ) -> Result<String, TrackerError> {
        let fields = self.issue_fields(report, reason)?;
        let summary = fields["summary"].as_str().unwrap_or_default().to_owned();

        let key = self.client.create_issue(fields).await?;
        metric!(counter("issues.created") += 1);
        tracing::info!("New issue {}: {}", key, summary);
        Ok(key)
    }

    fn issue_fields(&self, report: &Report, reason: &Reason) -> Result<Value, TrackerError> {
        let os = report.extension().operating_system().ok_or_else(|| {
            TrackerError::Other(format!("unsupported dump extension {}", report.extension()))
        })?;
        let team = match reason.component.as_str() {
            "Server" => "Server",
            "Client" => "GUI",
            other => return Err(TrackerError::Other(format!("unsupported component {other}"))),
        };

        let summary = format!(
            "{}{} has crashed on {}: {}",
            self.prefix, reason.component, os, reason.code
        );
        let mut fields = json!({
            "project": { "key": PROJECT },
            "issuetype": { "name": "Bug" },
            "summary": summary,
            "versions": [{ "name": report.version() }],
            "fixVersions": [{ "name": format!("{}_hotfix", report.version()) }],
            "components": [{ "name": reason.component }],
            TEAM_FIELD: { "value": team },
            "description": description(reason),
        });
        if let Some(epic) = &self.epic {
            fields[EPIC_FIELD] = json!(epic);
        }
        Ok(fields)
    }

    /// Adds `reports` to the issue `key`.
    ///
    /// A closed issue is reopened unless it is fixed in a version newer than every report. An
    /// issue closed without fix versions counts as not fixed.
    /// Afterwards the issue lists the versions of all reports and carries at most `file_limit`
    /// attachments, the newest ones.
    #[tracing::instrument(skip_all, fields(issue = key))]
    pub async fn update_issue(
        &self,
        key: &str,
        reports: &[Report],
        store: &ReportStore,
    ) -> Result<UpdateOutcome, TrackerError> {
        let Some(max_repro) = reports.iter().map(Report::version).max() else {
            return Err(TrackerError::Other(format!(
                "unable to update issue {key} with no reports"
            )));
        };

        let issue = self.client.issue(key).await?;
        let mut reopened = false;
        if issue.fields.status_name() == Some("Closed") {
            let min_fix = issue
                .fields
                .fix_versions
                .iter()
                .map(|version| version.name.as_str())
                .min();
            if min_fix.is_some_and(|min_fix| min_fix > max_repro) {
                tracing::debug!("Issue {} is already fixed", key);
                return Ok(UpdateOutcome::AlreadyFixed);
            }

            self.transition(key, "Reopen").await?;
            metric!(counter("issues.reopened") += 1);
            tracing::info!("Reopened issue {} for version {}", key, max_repro);
            reopened = true;
        }

        self.update_versions(&issue, reports).await?;

        let mut files = Vec::new();
        for report in reports {
            for file in store.files(report)? {
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
        let attached = self.attach_files(key, &files).await?;
        let deleted = self.prune_attachments(key).await?;

        metric!(counter("issues.updated") += 1);
        Ok(UpdateOutcome::Updated {
            reopened,
            attached,
            deleted,
        })
    }

    async fn update_versions(&self, issue: &Issue, reports: &[Report]) -> Result<(), TrackerError> {
        let current: BTreeSet<&str> = issue
            .fields
            .versions
            .iter()
            .map(|version| version.name.as_str())
            .collect();
        let mut versions = current.clone();
        versions.extend(reports.iter().map(Report::version));
        if versions == current {
            return Ok(());
        }

        let names: Vec<Value> = versions.iter().map(|name| json!({ "name": name })).collect();
        self.client
            .update_fields(&issue.key, json!({ "versions": names }))
            .await?;
        tracing::debug!(
            "Issue {} is updated for versions: {}",
            issue.key,
            versions.into_iter().collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }

    /// Attaches the last `file_limit` of `files`.
    async fn attach_files(&self, key: &str, files: &[PathBuf]) -> Result<usize, TrackerError> {
        let skip = files.len().saturating_sub(self.file_limit);
        for file in &files[skip..] {
            self.client.add_attachment(key, file).await?;
            metric!(counter("attachments.added") += 1);
            tracing::debug!("Issue {} new attachment {}", key, file.display());
        }
        Ok(files.len() - skip)
    }

    /// Deletes the oldest attachments until at most `file_limit` remain.
    async fn prune_attachments(&self, key: &str) -> Result<usize, TrackerError> {
        let mut attachments = self.client.issue(key).await?.fields.attachments;
        if attachments.len() <= self.file_limit {
            return Ok(0);
        }

        attachments.sort_by(|a, b| a.created.cmp(&b.created));
        let overflow = attachments.len() - self.file_limit;
        for attachment in &attachments[..overflow] {
            self.client.delete_attachment(&attachment.id).await?;
            metric!(counter("attachments.deleted") += 1);
            tracing::debug!("Issue {} replaced attachment {}", key, attachment.filename);
        }
        Ok(overflow)
    }

    /// Applies the first transition whose name starts with `prefix`.
    async fn transition(&self, key: &str, prefix: &str) -> Result<(), TrackerError> {
        let transitions = self.client.transitions(key).await?;
        let transition = transitions
            .iter()
            .find(|transition| transition.name.starts_with(prefix))
            .ok_or_else(|| {
                TrackerError::Other(format!("issue {key} has no `{prefix}` transition"))
            })?;
        self.client.transition_issue(key, &transition.id).await
    }
}

/// The issue description listing the call stack between code fences.
pub fn description(reason: &Reason) -> String {
    let mut lines = vec!["Call Stack:", CODE_FENCE];
    lines.extend(reason.stack.iter().map(String::as_str));
    lines.push(CODE_FENCE);
    lines.join("\n")
}
