use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Commands printing the exception record and the call stack of the crashed thread.
const CDB_COMMANDS: &str = ".exr -1;.ecxr;kc;q";

/// Produces backtrace text from a Windows minidump.
#[async_trait]
pub trait DumpAnalyzer: fmt::Debug + Send + Sync {
    /// Returns cdb style backtrace text for `dump`, resolving symbols from `binaries`.
    ///
    /// Returns an empty string when the dump cannot be analyzed.
    async fn backtrace(&self, dump: &Path, binaries: &Path) -> String;
}

/// Runs the cdb debugger as an external process.
#[derive(Debug, Clone)]
pub struct CdbDumpAnalyzer {
    program: PathBuf,
    timeout: Duration,
}

impl CdbDumpAnalyzer {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, dump: &Path, binaries: &Path) -> Command {
        let mut symbols = std::ffi::OsString::from("srv*;");
        symbols.push(binaries);

        let mut command = Command::new(&self.program);
        command
            .arg("-z")
            .arg(dump)
            .arg("-i")
            .arg(binaries)
            .arg("-y")
            .arg(symbols)
            .arg("-c")
            .arg(CDB_COMMANDS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl DumpAnalyzer for CdbDumpAnalyzer {
    #[tracing::instrument(skip_all, fields(dump = %dump.display()))]
    async fn backtrace(&self, dump: &Path, binaries: &Path) -> String {
        let output = self.command(dump, binaries).output();
        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Ok(Ok(output)) => {
                tracing::warn!("{} exited with {}", self.program.display(), output.status);
                String::new()
            }
            Ok(Err(e)) => {
                tracing::warn!("Unable to start {}: {}", self.program.display(), e);
                String::new()
            }
            Err(_) => {
                tracing::warn!(
                    "{} did not finish in {}",
                    self.program.display(),
                    humantime::format_duration(self.timeout)
                );
                String::new()
            }
        }
    }
}
