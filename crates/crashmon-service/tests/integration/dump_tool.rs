use std::sync::Arc;
use std::time::Duration;

use crashmon_service::dump_tool::{Distributions, DumpToolCache, DumpToolError};
use crashmon_service::report::Report;
use crashmon_service::utils::{Directory, Size};
use crashmon_test::{FileServer, TempDir, zip_archive};

use crate::utils::FixedDumpAnalyzer;

const SERVER_ZIP: &str = "builds/4.0/1234-vms_4.0/default/windows/nxwitness-server-4.0.0.1234-win64.zip";
const PDB_ZIP: &str = "builds/4.0/1234-vms_4.0/default/windows/nxwitness-pdb-apps-4.0.0.1234.zip";
const CLIENT_ZIP: &str = "builds/4.0/1234-vms_4.0/default/windows/nxwitness-client-4.0.0.1234-win64.zip";

fn distributions() -> FileServer {
    let dist = FileServer::new();
    dist.add_index("builds/4.1/", &["2000-vms_4.1/"]);
    dist.add_index("builds/4.0/", &["1233-vms_4.0/", "1234-vms_4.0/"]);
    dist.add_index(
        "builds/4.0/1234-vms_4.0/default/windows/",
        &[
            "nxwitness-server-4.0.0.1234-win64.zip",
            "nxwitness-server-4.0.0.1234-win64.msi",
            "nxwitness-client-4.0.0.1234-win64.zip",
            "nxwitness-pdb-apps-4.0.0.1234.zip",
        ],
    );
    dist.add(
        SERVER_ZIP,
        zip_archive(&[
            ("server/mediaserver.exe", b"MZ server"),
            ("server/nx_utils.dll", b"MZ utils"),
        ]),
    );
    dist.add(
        PDB_ZIP,
        zip_archive(&[("mediaserver.pdb", b"PDB"), ("nx_utils.pdb", b"PDB")]),
    );
    dist.add(CLIENT_ZIP, zip_archive(&[("client/desktop_client.exe", b"MZ")]));
    dist
}

fn cache(directory: &TempDir, dist: &FileServer, analyzer: Arc<FixedDumpAnalyzer>) -> DumpToolCache {
    let dists = Distributions::new(
        vec![dist.url("builds/4.1/"), dist.url("builds/4.0/")],
        Duration::from_secs(5),
    )
    .unwrap();
    DumpToolCache::new(
        Directory::new(directory.path().join("dump_tool")),
        Size::from_bytes(1 << 20),
        dists,
        analyzer,
    )
}

#[tokio::test]
async fn test_materialise_once() {
    crashmon_test::setup();
    let directory = crashmon_test::tempdir();
    let dist = distributions();
    let cache = Arc::new(cache(&directory, &dist, Arc::default()));

    let report = Report::parse("mediaserver--4.0.0.1234-abcd-nx--1.dmp").unwrap();
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let report = report.clone();
            tokio::spawn(async move { cache.materialise(&report).await.unwrap() })
        })
        .collect();
    for task in tasks {
        let tools = task.await.unwrap();
        assert_eq!(tools.name(), "4.0.0.1234-default-release");
    }

    let tools = cache.key_directory(&report);
    for file in ["mediaserver.exe", "nx_utils.dll", "mediaserver.pdb", "nx_utils.pdb", ".ready"] {
        assert!(tools.file(file).is_file(), "{file} is missing");
    }
    assert!(!tools.file("desktop_client.exe").exists());

    assert_eq!(dist.hits(SERVER_ZIP), 1);
    assert_eq!(dist.hits(PDB_ZIP), 1);
    assert_eq!(dist.hits(CLIENT_ZIP), 0);
}

#[tokio::test]
async fn test_backtrace_uses_tools() {
    crashmon_test::setup();
    let directory = crashmon_test::tempdir();
    let dist = distributions();
    let analyzer = Arc::new(FixedDumpAnalyzer::new("ExceptionCode: c0000005"));
    let cache = cache(&directory, &dist, analyzer.clone());

    let report = Report::parse("mediaserver--4.0.0.1234-abcd-default--1.dmp").unwrap();
    let dump = directory.path().join("1.dmp");
    std::fs::write(&dump, b"MDMP").unwrap();

    assert_eq!(
        cache.backtrace(&report, &dump).await.unwrap(),
        "ExceptionCode: c0000005"
    );
    assert_eq!(
        cache.backtrace(&report, &dump).await.unwrap(),
        "ExceptionCode: c0000005"
    );
    assert_eq!(analyzer.calls(), 2);
    assert_eq!(dist.hits(SERVER_ZIP), 1);
}

#[tokio::test]
async fn test_unknown_build() {
    crashmon_test::setup();
    let directory = crashmon_test::tempdir();
    let dist = distributions();
    let cache = cache(&directory, &dist, Arc::default());

    let report = Report::parse("mediaserver--4.0.0.9999-abcd-default--1.dmp").unwrap();
    let error = cache.materialise(&report).await.unwrap_err();
    assert!(matches!(error, DumpToolError::BuildNotFound(build) if build == "9999"));
    assert!(!cache.key_directory(&report).exists());
}

#[tokio::test]
async fn test_missing_customization() {
    crashmon_test::setup();
    let directory = crashmon_test::tempdir();
    let dist = distributions();
    let cache = cache(&directory, &dist, Arc::default());

    let report = Report::parse("mediaserver--4.0.0.1234-abcd-vista--1.dmp").unwrap();
    let error = cache.materialise(&report).await.unwrap_err();
    assert!(matches!(error, DumpToolError::Status { .. }));
    assert!(!cache.key_directory(&report).exists());
}
