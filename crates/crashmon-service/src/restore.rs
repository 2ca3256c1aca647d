//! Rebuilding of the records index from the issues in the tracker.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::analyzer::Reason;
use crate::jira::Issue;
use crate::store::{CrashId, Record, Records};
use crate::tracker::{CODE_FENCE, IssueTracker, PROJECT};

/// Issues requested per search page.
const PAGE_SIZE: usize = 100;

/// Extensions of attachments that were uploaded as reports.
const REPORT_EXTENSIONS: &[&str] = &[".dmp", ".gdb-bt"];

/// The query matching the issues created by the monitor.
pub fn issues_query(epic: Option<&str>) -> String {
    match epic {
        Some(epic) => format!(r#"project = {PROJECT} AND "Epic Link" = {epic}"#),
        None => format!("project = {PROJECT}"),
    }
}

/// Recovers the crash reason an issue was created for.
///
/// Returns `None` for issues which were not created by the monitor or were edited since.
pub fn issue_reason(issue: &Issue) -> Option<Reason> {
    let fields = &issue.fields;
    let Some(description) = fields.description.as_deref().filter(|d| !d.is_empty()) else {
        tracing::warn!("Skipping issue {}: empty description", issue.key);
        return None;
    };

    let lines: Vec<&str> = description.lines().collect();
    let stack = match lines.as_slice() {
        [_, open, stack @ .., close] if *open == CODE_FENCE && *close == CODE_FENCE => stack,
        _ => {
            tracing::warn!("Skipping issue {}: invalid description", issue.key);
            return None;
        }
    };

    let Some(component) = fields.components.first() else {
        tracing::warn!("Skipping issue {}: no components", issue.key);
        return None;
    };

    let code = fields.summary.rsplit(':').next().unwrap_or_default().trim();
    Some(Reason::new(
        component.name.clone(),
        code,
        stack.iter().map(|frame| frame.to_string()).collect(),
    ))
}

/// Records of all report attachments of `issues`.
pub fn extract_records<'a>(issues: impl IntoIterator<Item = &'a Issue>, records: &mut Records) {
    for issue in issues {
        let Some(reason) = issue_reason(issue) else {
            continue;
        };
        let crash_id = CrashId::Hash(reason.crash_id());

        for attachment in &issue.fields.attachments {
            if REPORT_EXTENSIONS
                .iter()
                .any(|extension| attachment.filename.ends_with(extension))
            {
                let record = Record {
                    crash_id: Some(crash_id.clone()),
                    issue: Some(issue.key.clone()),
                };
                records.insert(attachment.filename.clone(), record);
            }
        }
    }
}

/// Rebuilds the records index from the tracker and writes it to `path`.
pub async fn restore_records(tracker: &IssueTracker, path: impl Into<PathBuf>) -> Result<Records> {
    let query = issues_query(tracker.epic());
    tracing::info!("Searching issues: {}", query);

    let mut records = Records::new(path);
    let mut start_at = 0;
    let mut processed = 0;
    loop {
        let page = tracker
            .client()
            .search(&query, start_at, PAGE_SIZE)
            .await
            .context("failed to search issues")?;
        if page.issues.is_empty() {
            break;
        }

        processed += page.issues.len();
        start_at = page.start_at + page.issues.len();
        extract_records(&page.issues, &mut records);
        if start_at >= page.total {
            break;
        }
    }

    tracing::info!(
        "Restored {} records from {} issues",
        records.len(),
        processed
    );
    records.save().context("failed to write records")?;
    Ok(records)
}
