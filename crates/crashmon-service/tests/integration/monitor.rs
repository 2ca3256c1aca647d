use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crashmon_service::monitor::{Interrupted, Monitor};
use crashmon_service::store::{CrashId, Record};
use crashmon_test::{FileServer, read_fixture, zip_archive};
use tokio_util::sync::CancellationToken;

use crate::utils::{FixedDumpAnalyzer, TestEnv, gdb_backtrace, gdb_reason};

const R1234: &str = "server--3.1.0.1234-abcd-default--1234.gdb-bt";
const R5678: &str = "server--3.1.0.5678-xyzu-default--5678.gdb-bt";
const R3451: &str = "server--3.2.0.2344-asdf-default--3451.gdb-bt";
const R7634: &str = "server--3.2.0.3452-dfga-default--7634.gdb-bt";
const R1111: &str = "server--4.0.0.1111-qwer-default--1111.gdb-bt";

fn crash() -> String {
    gdb_backtrace("SEGFAULT", &["f1", "f2"])
}

fn crash_id() -> String {
    gdb_reason("SEGFAULT", &["f1", "f2"]).crash_id()
}

fn names(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn test_issue_lifecycle() {
    let env = TestEnv::new();
    let config = env.config(&[]);
    let mut monitor = env.monitor(&config, Arc::default());

    // A single report does not create an issue.
    env.crash_server.add(R1234, crash());
    assert_eq!(monitor.fetch().await.unwrap(), 1);
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    assert_eq!(env.jira.created(), 0);
    assert_eq!(
        monitor.records().get(R1234),
        Some(&Record::analyzed(CrashId::Hash(crash_id())))
    );
    assert!(env.report_exists(&config, R1234));

    // The second duplicate creates the issue with both reports attached.
    env.crash_server.add(R5678, crash());
    assert_eq!(monitor.fetch().await.unwrap(), 1);
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    assert_eq!(env.jira.created(), 1);
    let issue = env.jira.issue("VMS-1");
    assert_eq!(issue.summary, "[TEST-RUN] Server has crashed on Linux: SEGFAULT");
    assert_eq!(issue.versions, ["3.1"]);
    assert_eq!(issue.fix_versions, ["3.1_hotfix"]);
    assert_eq!(issue.components, ["Server"]);
    assert_eq!(issue.team.as_deref(), Some("Server"));
    assert_eq!(issue.attachment_names(), names(&[R1234, R5678]));
    for name in [R1234, R5678] {
        assert_eq!(monitor.records().get(name).unwrap().issue.as_deref(), Some("VMS-1"));
        assert!(!env.report_exists(&config, name));
    }

    // Reports of a newer version reopen the closed issue.
    env.jira.close("VMS-1");
    env.crash_server.add(R3451, crash());
    env.crash_server.add(R7634, crash());
    assert_eq!(monitor.fetch().await.unwrap(), 2);
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    assert_eq!(env.jira.created(), 1);
    let issue = env.jira.issue("VMS-1");
    assert_eq!(issue.status, "Open");
    assert_eq!(issue.versions, ["3.1", "3.2"]);
    assert_eq!(issue.attachment_names(), names(&[R5678, R3451, R7634]));

    // Only the newest attachments are kept.
    env.crash_server.add(R1111, crash());
    assert_eq!(monitor.fetch().await.unwrap(), 1);
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    let issue = env.jira.issue("VMS-1");
    assert_eq!(issue.versions, ["3.1", "3.2", "4.0"]);
    assert_eq!(issue.attachment_names(), names(&[R3451, R7634, R1111]));
    assert_eq!(env.jira.created(), 1);
    assert!(monitor.records().iter().all(|(_, r)| r.issue.as_deref() == Some("VMS-1")));
}

#[tokio::test]
async fn test_fixed_issue_is_not_reopened() {
    let env = TestEnv::new();
    let config = env.config(&["options.min_report_count=1"]);
    let mut monitor = env.monitor(&config, Arc::default());

    env.crash_server.add(R3451, crash());
    monitor.fetch().await.unwrap();
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();
    assert_eq!(env.jira.created(), 1);
    env.jira.close("VMS-1");

    // 3.2_hotfix is newer than the report version 3.2.
    env.crash_server.add(R7634, crash());
    monitor.fetch().await.unwrap();
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    let issue = env.jira.issue("VMS-1");
    assert_eq!(issue.status, "Closed");
    assert_eq!(issue.attachment_names(), names(&[R3451]));
    assert_eq!(
        monitor.records().get(R7634).unwrap().issue.as_deref(),
        Some("VMS-1")
    );
    assert!(!env.report_exists(&config, R7634));
}

#[tokio::test]
async fn test_distinct_crashes_get_distinct_issues() {
    let env = TestEnv::new();
    let config = env.config(&["options.min_report_count=1"]);
    let mut monitor = env.monitor(&config, Arc::default());

    env.crash_server.add(R1234, crash());
    env.crash_server.add(R5678, gdb_backtrace("SIGABRT", &["f1", "f3"]));
    env.crash_server.add(
        "server--3.1.0.9999-abcd-default--9999.gdb-bt",
        read_fixture("linux/segfault.gdb-bt"),
    );
    assert_eq!(monitor.fetch().await.unwrap(), 3);
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    assert_eq!(env.jira.created(), 3);
    let summaries: BTreeSet<String> = env
        .jira
        .issues()
        .into_iter()
        .map(|issue| issue.summary)
        .collect();
    assert_eq!(
        summaries,
        names(&[
            "[TEST-RUN] Server has crashed on Linux: SEGFAULT",
            "[TEST-RUN] Server has crashed on Linux: SIGABRT",
            "[TEST-RUN] Server has crashed on Linux: SIGSEGV, Segmentation fault",
        ])
    );
}

#[tokio::test]
async fn test_unprintable_names_are_dropped() {
    let env = TestEnv::new();
    let config = env.config(&[]);
    let mut monitor = env.monitor(&config, Arc::default());

    env.crash_server
        .add_path("/server/3.2.0.1-abcd-default/1\x01.gdb-bt", crash());
    assert_eq!(monitor.fetch().await.unwrap(), 0);

    assert!(monitor.records().is_empty());
    assert_eq!(env.crash_server.get_hits(), 0);
}

#[tokio::test]
async fn test_minidump_without_backtrace() {
    let env = TestEnv::new();
    let dist = FileServer::new();
    dist.add_index("dist/", &["1234-vms_4.0/", "1235-vms_4.0/"]);
    dist.add_index(
        "dist/1234-vms_4.0/default/windows/",
        &["nxwitness-server-4.0.0.1234-win64.zip", "nxwitness-server-4.0.0.1234-win64.msi"],
    );
    dist.add(
        "dist/1234-vms_4.0/default/windows/nxwitness-server-4.0.0.1234-win64.zip",
        zip_archive(&[("bin/mediaserver.exe", b"MZ"), ("bin/mediaserver.pdb", b"PDB")]),
    );

    let dump = "mediaserver--4.0.0.1234-abcd-default--1.dmp";
    let mut config = env.config(&["options.reports_size_limit=1"]);
    config.analyze.dist_urls = vec![dist.url("dist/")];
    let analyzer = Arc::new(FixedDumpAnalyzer::new(""));
    let mut monitor = env.monitor(&config, analyzer.clone());

    env.crash_server.add(dump, b"MDMP".to_vec());
    assert_eq!(monitor.fetch().await.unwrap(), 1);
    assert!(env.report_exists(&config, dump));

    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    assert_eq!(analyzer.calls(), 1);
    assert_eq!(
        monitor.records().get(dump),
        Some(&Record::analyzed(CrashId::Failed))
    );
    assert_eq!(env.jira.created(), 0);
    // The store is over its limit, so the unanalyzable dump is gone.
    assert!(!env.report_exists(&config, dump));

    // The tombstone keeps the dump from being downloaded again.
    let downloads = env.crash_server.get_hits();
    assert_eq!(monitor.fetch().await.unwrap(), 0);
    assert_eq!(env.crash_server.get_hits(), downloads);
}

#[tokio::test]
async fn test_minidump_issue() {
    let env = TestEnv::new();
    let dist = FileServer::new();
    dist.add_index("dist/", &["2345-vms_4.1/"]);
    dist.add_index(
        "dist/2345-vms_4.1/default/windows/",
        &["nxwitness-server-4.1.0.2345-win64.zip", "nxwitness-pdb-all-4.1.0.2345.zip"],
    );
    dist.add(
        "dist/2345-vms_4.1/default/windows/nxwitness-server-4.1.0.2345-win64.zip",
        zip_archive(&[("mediaserver.exe", b"MZ")]),
    );
    dist.add(
        "dist/2345-vms_4.1/default/windows/nxwitness-pdb-all-4.1.0.2345.zip",
        zip_archive(&[("mediaserver.pdb", b"PDB")]),
    );

    let mut config = env.config(&["options.min_report_count=1"]);
    config.analyze.dist_urls = vec![dist.url("dist/")];
    let backtrace = String::from_utf8(read_fixture("windows/access_violation.cdb-bt")).unwrap();
    let analyzer = Arc::new(FixedDumpAnalyzer::new(backtrace));
    let mut monitor = env.monitor(&config, analyzer.clone());

    let dump = "mediaserver--4.1.0.2345-abcd-networkoptix--1.dmp";
    env.crash_server.add(dump, b"MDMP".to_vec());
    monitor.fetch().await.unwrap();
    monitor.analyze().await.unwrap();

    let companion = "mediaserver--4.1.0.2345-abcd-networkoptix--1.cdb-bt";
    assert!(env.report_exists(&config, companion));
    let tools = config
        .options
        .dump_tool_directory()
        .join("4.1.0.2345-default-release");
    assert!(tools.join("mediaserver.exe").is_file());
    assert!(tools.join("mediaserver.pdb").is_file());

    // Issue creation analyzes the report again from the stored backtrace.
    monitor.upload().await.unwrap();
    assert_eq!(analyzer.calls(), 1);

    let issue = env.jira.issue("VMS-1");
    assert_eq!(
        issue.summary,
        "[TEST-RUN] Server has crashed on Windows: c0000005 (Access violation)"
    );
    assert_eq!(issue.versions, ["4.1"]);
    assert_eq!(issue.attachment_names(), names(&[companion, dump]));
    assert!(issue.description.contains("Server!QnResourcePool::getResourceById"));
    assert!(!env.report_exists(&config, dump));
    assert!(!env.report_exists(&config, companion));
}

#[tokio::test]
async fn test_unanalyzable_reports_are_removed_over_budget() {
    let env = TestEnv::new();
    let config = env.config(&["options.reports_size_limit=1K"]);
    let mut monitor = env.monitor(&config, Arc::default());

    let unresolved = "server--3.2.0.1-abcd-default--1.gdb-bt";
    let resolved = "server--3.2.0.2-abcd-default--2.gdb-bt";
    env.crash_server
        .add(unresolved, read_fixture("linux/unresolved.gdb-bt"));
    env.crash_server
        .add(resolved, read_fixture("linux/segfault.gdb-bt"));
    monitor.fetch().await.unwrap();
    monitor.analyze().await.unwrap();

    assert_eq!(
        monitor.records().get(unresolved),
        Some(&Record::analyzed(CrashId::Failed))
    );
    assert!(!env.report_exists(&config, unresolved));
    assert!(env.report_exists(&config, resolved));
}

#[tokio::test]
async fn test_records_survive_restart() {
    let env = TestEnv::new();
    let config = env.config(&[]);

    let mut monitor = env.monitor(&config, Arc::default());
    env.crash_server.add(R1234, crash());
    env.crash_server.add(
        "server--3.2.0.1-abcd-default--broken.gdb",
        b"unknown extension".to_vec(),
    );
    assert_eq!(monitor.fetch().await.unwrap(), 1);
    monitor.analyze().await.unwrap();
    let records = monitor.records().clone();
    drop(monitor);

    let mut monitor = env.monitor(&config, Arc::default());
    assert_eq!(monitor.records(), &records);
    assert_eq!(monitor.fetch().await.unwrap(), 0);
    assert!(monitor.records().get(R1234).unwrap().crash_id.is_some());
}

#[tokio::test]
async fn test_missing_pending_report_is_tombstoned() {
    let env = TestEnv::new();
    let config = env.config(&[]);
    let mut monitor = env.monitor(&config, Arc::default());

    env.crash_server.add(R1234, crash());
    monitor.fetch().await.unwrap();
    std::fs::remove_file(config.options.reports_directory().join(R1234)).unwrap();
    monitor.analyze().await.unwrap();

    assert_eq!(
        monitor.records().get(R1234),
        Some(&Record::analyzed(CrashId::Failed))
    );
}

#[tokio::test]
async fn test_failed_upload_keeps_reports() {
    let env = TestEnv::new();
    let tracker = FileServer::new();
    let config = env.config(&[
        "options.min_report_count=1",
        &format!("upload.url={}", tracker.url("")),
    ]);
    let mut monitor = env.monitor(&config, Arc::default());

    env.crash_server.add(R1234, crash());
    monitor.fetch().await.unwrap();
    monitor.analyze().await.unwrap();
    monitor.upload().await.unwrap();

    assert_eq!(
        monitor.records().get(R1234),
        Some(&Record::analyzed(CrashId::Hash(crash_id())))
    );
    assert!(env.report_exists(&config, R1234));
    assert_eq!(tracker.hits("rest/api/2/issue"), 1);
}

#[tokio::test]
async fn test_created_issue_gets_reports_after_failed_update() {
    let env = TestEnv::new();
    let config = env.config(&[]);
    let mut monitor = env.monitor(&config, Arc::default());

    env.crash_server.add(R1234, crash());
    env.crash_server.add(R5678, crash());
    assert_eq!(monitor.fetch().await.unwrap(), 2);
    monitor.analyze().await.unwrap();

    // The issue is created, but reading it back for the update fails.
    env.jira.break_issue_reads(true);
    monitor.upload().await.unwrap();

    assert_eq!(env.jira.created(), 1);
    for name in [R1234, R5678] {
        assert_eq!(
            monitor.records().get(name),
            Some(&Record::analyzed(CrashId::Hash(crash_id())))
        );
        assert!(env.report_exists(&config, name));
    }

    env.jira.break_issue_reads(false);
    monitor.upload().await.unwrap();

    assert_eq!(env.jira.created(), 1);
    let issue = env.jira.issue("VMS-1");
    assert_eq!(issue.attachment_names(), names(&[R1234, R5678]));
    for name in [R1234, R5678] {
        assert_eq!(monitor.records().get(name).unwrap().issue.as_deref(), Some("VMS-1"));
        assert!(!env.report_exists(&config, name));
    }
}

#[tokio::test]
async fn test_empty_server_causes_no_work() {
    let env = TestEnv::new();
    let config = env.config(&[]);
    let cancel = CancellationToken::new();
    let analyzer = Arc::new(FixedDumpAnalyzer::default());
    let mut monitor =
        Monitor::with_dump_analyzer(&config, cancel.clone(), analyzer.clone()).unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
    });
    let error = tokio::time::timeout(Duration::from_secs(30), monitor.run_once())
        .await
        .unwrap()
        .unwrap_err();
    assert!(error.is::<Interrupted>());

    // The listing is polled again after every stand-by.
    assert!(env.crash_server.list_hits() >= 2);
    assert_eq!(env.crash_server.get_hits(), 0);
    assert!(monitor.records().is_empty());
    assert!(!config.options.records_path().exists());
    assert_eq!(env.jira.requests(), 0);
    assert_eq!(analyzer.calls(), 0);
    let tools = std::fs::read_dir(config.options.dump_tool_directory()).unwrap();
    assert_eq!(tools.count(), 0);
}

#[tokio::test]
async fn test_run_service_until_cancelled() {
    let env = TestEnv::new();
    let config = env.config(&["options.min_report_count=1"]);
    env.crash_server.add(R1234, crash());

    let cancel = CancellationToken::new();
    let mut monitor = Monitor::with_dump_analyzer(
        &config,
        cancel.clone(),
        Arc::new(FixedDumpAnalyzer::default()),
    )
    .unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
    });
    tokio::time::timeout(Duration::from_secs(30), monitor.run_service())
        .await
        .unwrap()
        .unwrap();

    // Fetched in the first iteration, analyzed and uploaded in the second.
    assert_eq!(env.jira.created(), 1);
    assert_eq!(
        monitor.records().get(R1234).unwrap().issue.as_deref(),
        Some("VMS-1")
    );

    let saved = std::fs::read_to_string(config.options.records_path()).unwrap();
    assert!(saved.contains("VMS-1"));
}
