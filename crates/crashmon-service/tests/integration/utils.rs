use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use crashmon_service::analyzer::Reason;
use crashmon_service::config::Config;
use crashmon_service::dump_tool::DumpAnalyzer;
use crashmon_service::monitor::Monitor;
use crashmon_test::{CrashServerMock, JiraMock, LOGIN, PASSWORD, TempDir};
use tokio_util::sync::CancellationToken;

/// Backtrace text as written by gdb for a crash with `code` in `functions`.
pub fn gdb_backtrace(code: &str, functions: &[&str]) -> String {
    let mut content = format!(
        "Core was generated by `/opt/networkoptix/mediaserver/bin/mediaserver'.\n\
         Program terminated with signal {code}.\n\
         (gdb) bt\n\
         Thread 1 (LWP 1234):\n"
    );
    for (index, function) in functions.iter().enumerate() {
        content.push_str(&format!("#{index}  0x0000{index:04x} in {function} (this=0x{index}a)\n"));
    }
    content.push_str("(gdb) quit\n");
    content
}

/// The reason [`gdb_backtrace`] content is analyzed into.
pub fn gdb_reason(code: &str, functions: &[&str]) -> Reason {
    let stack = functions
        .iter()
        .enumerate()
        .map(|(index, function)| format!("#{index}  0x0000{index:04x} in {function} (this=)"))
        .collect();
    Reason::new("Server", code, stack)
}

/// A dump analyzer answering every minidump with the same text.
#[derive(Debug, Default)]
pub struct FixedDumpAnalyzer {
    output: String,
    calls: AtomicUsize,
}

impl FixedDumpAnalyzer {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DumpAnalyzer for FixedDumpAnalyzer {
    async fn backtrace(&self, _dump: &Path, binaries: &Path) -> String {
        assert!(binaries.is_dir());
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.output.clone()
    }
}

/// A monitor environment with mocked crash server and issue tracker.
#[derive(Debug)]
pub struct TestEnv {
    pub directory: TempDir,
    pub crash_server: CrashServerMock,
    pub jira: JiraMock,
}

impl TestEnv {
    pub fn new() -> Self {
        crashmon_test::setup();
        Self {
            directory: crashmon_test::tempdir(),
            crash_server: CrashServerMock::new(),
            jira: JiraMock::new(),
        }
    }

    /// Loads a config for the mocks with `SECTION.KEY=VALUE` overrides.
    pub fn config(&self, overrides: &[&str]) -> Config {
        let yaml = format!(
            r#"
logging:
  level: trace
options:
  directory: {directory:?}
  min_version: "3.0"
  min_report_count: 2
  stand_by_sleep_s: 1
fetch:
  url: {fetch}
  login: {LOGIN}
  password: {PASSWORD}
  thread_count: 2
analyze:
  thread_count: 2
  debugger_timeout: 5s
upload:
  url: {upload}
  login: {LOGIN}
  password: {PASSWORD}
  file_limit: 3
  prefix: "[TEST-RUN]"
  thread_count: 2
"#,
            directory = self.directory.path().join("monitor"),
            fetch = self.crash_server.url(),
            upload = self.jira.url(),
        );

        let path = self.directory.path().join("crashmon.yaml");
        std::fs::write(&path, yaml).unwrap();
        let overrides: Vec<String> = overrides.iter().map(|o| o.to_string()).collect();
        Config::get(&path, &overrides).unwrap()
    }

    pub fn monitor(&self, config: &Config, dump_analyzer: Arc<FixedDumpAnalyzer>) -> Monitor {
        Monitor::with_dump_analyzer(config, CancellationToken::new(), dump_analyzer).unwrap()
    }

    pub fn report_exists(&self, config: &Config, name: &str) -> bool {
        config.options.reports_directory().join(name).is_file()
    }
}
