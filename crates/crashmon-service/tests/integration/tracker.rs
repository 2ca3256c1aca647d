use std::collections::BTreeSet;
use std::time::Duration;

use crashmon_service::analyzer::Reason;
use crashmon_service::jira::{JiraClient, TrackerError};
use crashmon_service::report::Report;
use crashmon_service::store::ReportStore;
use crashmon_service::tracker::{IssueTracker, UpdateOutcome};
use crashmon_service::utils::{Directory, Size};
use crashmon_test::{JiraMock, LOGIN, MockIssue, PASSWORD, TempDir};

use crate::utils::{gdb_backtrace, gdb_reason};

struct Env {
    _directory: TempDir,
    jira: JiraMock,
    store: ReportStore,
}

impl Env {
    fn new() -> Self {
        crashmon_test::setup();
        let directory = crashmon_test::tempdir();
        let store = ReportStore::open(
            Directory::new(directory.path().join("reports")),
            Size::from_bytes(1 << 20),
        )
        .unwrap();
        Self {
            _directory: directory,
            jira: JiraMock::new(),
            store,
        }
    }

    fn tracker(&self, epic: Option<&str>) -> IssueTracker {
        let client =
            JiraClient::new(&self.jira.url(), LOGIN, PASSWORD, Duration::from_secs(5)).unwrap();
        IssueTracker::with_client(client, 3, "[TEST-RUN]", epic.map(str::to_owned))
    }

    /// Stores gdb reports for the build `version` and returns them.
    async fn reports(&self, version: &str, ids: &[&str]) -> Vec<Report> {
        let mut reports = Vec::new();
        for id in ids {
            let name = format!("server--{version}-abcd-default--{id}.gdb-bt");
            let content = gdb_backtrace("SEGFAULT", &["f1", "f2"]);
            self.store.write(&name, content.into()).await.unwrap();
            reports.push(Report::parse(&name).unwrap());
        }
        reports
    }
}

fn reason() -> Reason {
    gdb_reason("SEGFAULT", &["f1", "f2"])
}

fn attachments(ids: &[(&str, &str)]) -> BTreeSet<String> {
    ids.iter()
        .map(|(version, id)| format!("server--{version}-abcd-default--{id}.gdb-bt"))
        .collect()
}

#[tokio::test]
async fn test_issue_lifecycle() {
    let env = Env::new();
    let tracker = env.tracker(None);

    let first = env.reports("3.1.0.1234", &["1234"]).await;
    let key = tracker.create_issue(&first[0], &reason()).await.unwrap();
    assert_eq!(key, "VMS-1");
    let outcome = tracker.update_issue(&key, &first, &env.store).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            reopened: false,
            attached: 1,
            deleted: 0
        }
    );
    assert_eq!(
        env.jira.issue(&key).attachment_names(),
        attachments(&[("3.1.0.1234", "1234")])
    );

    // Closed and fixed in a newer hotfix: the report is dropped.
    env.jira.close(&key);
    let fixed = env.reports("3.1.0.5678", &["5678"]).await;
    let outcome = tracker.update_issue(&key, &fixed, &env.store).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::AlreadyFixed);
    let issue = env.jira.issue(&key);
    assert_eq!(issue.status, "Closed");
    assert_eq!(issue.attachment_names(), attachments(&[("3.1.0.1234", "1234")]));

    // Reproduced in a newer version: the issue is reopened.
    let newer = env.reports("3.2.0.2344", &["3451", "7634"]).await;
    let outcome = tracker.update_issue(&key, &newer, &env.store).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            reopened: true,
            attached: 2,
            deleted: 0
        }
    );
    let issue = env.jira.issue(&key);
    assert_eq!(issue.status, "Open");
    assert_eq!(issue.versions, ["3.1", "3.2"]);
    assert_eq!(
        issue.attachment_names(),
        attachments(&[
            ("3.1.0.1234", "1234"),
            ("3.2.0.2344", "3451"),
            ("3.2.0.2344", "7634"),
        ])
    );

    // Over the file limit, the oldest attachment is replaced.
    let latest = env.reports("4.0.0.1111", &["1111"]).await;
    let outcome = tracker.update_issue(&key, &latest, &env.store).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            reopened: false,
            attached: 1,
            deleted: 1
        }
    );
    let issue = env.jira.issue(&key);
    assert_eq!(issue.versions, ["3.1", "3.2", "4.0"]);
    assert_eq!(
        issue.attachment_names(),
        attachments(&[
            ("3.2.0.2344", "3451"),
            ("3.2.0.2344", "7634"),
            ("4.0.0.1111", "1111"),
        ])
    );
    assert_eq!(env.jira.created(), 1);
}

#[tokio::test]
async fn test_attach_only_newest_files() {
    let env = Env::new();
    let tracker = env.tracker(None);

    let reports = env
        .reports("3.2.0.1", &["1", "2", "3", "4", "5"])
        .await;
    let key = tracker.create_issue(&reports[0], &reason()).await.unwrap();
    let outcome = tracker.update_issue(&key, &reports, &env.store).await.unwrap();

    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            reopened: false,
            attached: 3,
            deleted: 0
        }
    );
    assert_eq!(
        env.jira.issue(&key).attachment_names(),
        attachments(&[("3.2.0.1", "3"), ("3.2.0.1", "4"), ("3.2.0.1", "5")])
    );
}

#[tokio::test]
async fn test_created_issue_fields() {
    let env = Env::new();
    let tracker = env.tracker(Some("VMS-2022"));

    let reports = env.reports("4.1.0.1", &["1"]).await;
    let key = tracker.create_issue(&reports[0], &reason()).await.unwrap();

    let issue = env.jira.issue(&key);
    assert_eq!(issue.summary, "[TEST-RUN] Server has crashed on Linux: SEGFAULT");
    assert_eq!(issue.components, ["Server"]);
    assert_eq!(issue.versions, ["4.1"]);
    assert_eq!(issue.fix_versions, ["4.1_hotfix"]);
    assert_eq!(issue.team.as_deref(), Some("Server"));
    assert_eq!(issue.epic.as_deref(), Some("VMS-2022"));
    assert_eq!(
        issue.description,
        "Call Stack:\n{code}\n#0  0x00000000 in f1 (this=)\n#1  0x00000001 in f2 (this=)\n{code}"
    );
}

#[tokio::test]
async fn test_cdb_backtrace_cannot_create_issue() {
    let env = Env::new();
    let tracker = env.tracker(None);

    let report = Report::parse("client--4.0.0.1-abcd-default--1.cdb-bt").unwrap();
    let error = tracker.create_issue(&report, &reason()).await.unwrap_err();
    assert!(matches!(error, TrackerError::Other(_)));
    assert_eq!(env.jira.created(), 0);
}

#[tokio::test]
async fn test_update_missing_issue() {
    let env = Env::new();
    let tracker = env.tracker(None);

    let reports = env.reports("4.0.0.1", &["1"]).await;
    let error = tracker
        .update_issue("VMS-99", &reports, &env.store)
        .await
        .unwrap_err();
    assert!(matches!(error, TrackerError::NotFound(key) if key == "VMS-99"));
}

#[tokio::test]
async fn test_wrong_password() {
    let env = Env::new();
    let client = JiraClient::new(&env.jira.url(), LOGIN, "wrong", Duration::from_secs(5)).unwrap();
    let tracker = IssueTracker::with_client(client, 3, "", None);

    let reports = env.reports("4.0.0.1", &["1"]).await;
    let error = tracker.create_issue(&reports[0], &reason()).await.unwrap_err();
    assert!(matches!(
        error,
        TrackerError::Status { status, .. } if status == reqwest::StatusCode::UNAUTHORIZED
    ));
}

#[tokio::test]
async fn test_shared_backtrace_is_attached_once() {
    let env = Env::new();
    let tracker = env.tracker(None);

    let dump = "mediaserver--4.0.0.1-abcd-default--1.dmp";
    let backtrace = "mediaserver--4.0.0.1-abcd-default--1.cdb-bt";
    env.store.write(dump, "MDMP".into()).await.unwrap();
    env.store.write(backtrace, "ExceptionCode: c0000005".into()).await.unwrap();
    let reports = [Report::parse(backtrace).unwrap(), Report::parse(dump).unwrap()];

    let created = env.reports("4.0.0.1", &["2"]).await;
    let key = tracker.create_issue(&created[0], &reason()).await.unwrap();
    let outcome = tracker.update_issue(&key, &reports, &env.store).await.unwrap();

    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            reopened: false,
            attached: 2,
            deleted: 0
        }
    );
    let issue = env.jira.issue(&key);
    assert_eq!(issue.attachments.len(), 2);
    assert_eq!(
        issue.attachment_names(),
        BTreeSet::from([dump.to_owned(), backtrace.to_owned()])
    );
}

#[tokio::test]
async fn test_closed_issue_without_fix_versions_is_reopened() {
    let env = Env::new();
    let tracker = env.tracker(None);
    let key = env.jira.insert(
        MockIssue {
            status: "Closed".into(),
            summary: "[TEST-RUN] Server has crashed on Linux: SEGFAULT".into(),
            versions: vec!["3.1".into()],
            ..Default::default()
        },
        &[],
    );

    let reports = env.reports("3.1.0.1", &["1"]).await;
    let outcome = tracker.update_issue(&key, &reports, &env.store).await.unwrap();

    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            reopened: true,
            attached: 1,
            deleted: 0
        }
    );
    assert_eq!(env.jira.issue(&key).status, "Open");
}
