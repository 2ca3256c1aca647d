use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use serde_yaml::{Mapping, Value};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::utils::Size;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the service.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
    /// Logged once on startup to tell instances apart.
    pub title: Option<String>,
    /// Append logs to this file instead of writing them to stdout.
    pub file: Option<PathBuf>,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
            title: None,
            file: None,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "crashmon".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Options of the monitor loop and its stores.
#[derive(Clone, Debug, Deserialize)]
pub struct Options {
    /// Base directory of the records file, the reports and the dump tool cache.
    pub directory: PathBuf,
    #[serde(default = "default_size_limit")]
    pub reports_size_limit: Size,
    #[serde(default = "default_size_limit")]
    pub dump_tool_size_limit: Size,
    /// Glob of report extensions requested from the crash server.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Reports of versions below this one are not fetched.
    #[serde(default = "default_min_version")]
    pub min_version: String,
    /// Number of duplicate reports needed before an issue is created.
    #[serde(default = "default_min_report_count")]
    pub min_report_count: usize,
    /// Maximum number of reports fetched in one fetch phase.
    #[serde(default = "default_reports_each_run")]
    pub reports_each_run: usize,
    /// Idle time in seconds when the crash server has no new reports.
    #[serde(default = "default_stand_by_sleep_s")]
    pub stand_by_sleep_s: u64,
}

fn default_size_limit() -> Size {
    Size::from_bytes(10 << 30)
}

fn default_extension() -> String {
    "*".into()
}

fn default_min_version() -> String {
    "3.2".into()
}

fn default_min_report_count() -> usize {
    2
}

fn default_reports_each_run() -> usize {
    1000
}

fn default_stand_by_sleep_s() -> u64 {
    60
}

fn default_thread_count() -> usize {
    5
}

impl Options {
    pub fn records_path(&self) -> PathBuf {
        self.directory.join("records.json")
    }

    pub fn reports_directory(&self) -> PathBuf {
        self.directory.join("reports")
    }

    pub fn dump_tool_directory(&self) -> PathBuf {
        self.directory.join("dump_tool")
    }

    pub fn stand_by_sleep(&self) -> Duration {
        Duration::from_secs(self.stand_by_sleep_s)
    }
}

/// Access to the crash server.
#[derive(Clone, Debug, Deserialize)]
pub struct FetchConfig {
    pub url: Url,
    pub login: String,
    pub password: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Timeout of a single request, including the report download.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Analysis of reports and minidumps.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AnalyzeConfig {
    pub thread_count: usize,
    /// The cdb executable used to analyze minidumps.
    pub debugger: PathBuf,
    #[serde(with = "humantime_serde")]
    pub debugger_timeout: Duration,
    /// Indexes of build distributions providing binaries and debug information.
    pub dist_urls: Vec<Url>,
    #[serde(with = "humantime_serde")]
    pub dist_timeout: Duration,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        AnalyzeConfig {
            thread_count: default_thread_count(),
            debugger: PathBuf::from("cdb"),
            debugger_timeout: Duration::from_secs(30),
            dist_urls: Vec::new(),
            dist_timeout: Duration::from_secs(600),
        }
    }
}

/// Access to the issue tracker.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadConfig {
    pub url: Url,
    pub login: String,
    pub password: String,
    /// Maximum number of attachments kept on an issue.
    #[serde(default = "default_file_limit")]
    pub file_limit: usize,
    /// Prepended to the summary of created issues.
    #[serde(default)]
    pub prefix: String,
    /// The epic created issues are linked to.
    #[serde(default)]
    pub epic: Option<String>,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_upload_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_file_limit() -> usize {
    5
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(120)
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Controls the log format.
    #[serde(default)]
    pub logging: Logging,

    /// Controls the internal metrics.
    #[serde(default)]
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    #[serde(default)]
    pub sentry_dsn: Option<Dsn>,

    pub options: Options,

    pub fetch: FetchConfig,

    #[serde(default)]
    pub analyze: AnalyzeConfig,

    pub upload: UploadConfig,
}

impl Config {
    /// Loads the config file at `path` and applies `SECTION.KEY=VALUE` overrides.
    pub fn get(path: &Path, overrides: &[String]) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open configuration file {}", path.display()))?;
        Self::from_reader(file, overrides)
    }

    fn from_reader(mut reader: impl std::io::Read, overrides: &[String]) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }

        let mut value: Value = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        for item in overrides {
            apply_override(&mut value, item)
                .with_context(|| format!("invalid config override `{item}`"))?;
        }
        serde_yaml::from_value(value).context("invalid configuration")
    }
}

/// Sets `SECTION.KEY=VALUE` in the config tree. The value is parsed as a YAML scalar.
fn apply_override(config: &mut Value, item: &str) -> Result<()> {
    let (path, value) = item
        .split_once('=')
        .context("expected SECTION.KEY=VALUE")?;
    let keys: Vec<&str> = path.split('.').collect();
    if keys.iter().any(|key| key.is_empty()) {
        anyhow::bail!("empty key in `{path}`");
    }
    let value = match serde_yaml::from_str::<Value>(value) {
        Ok(parsed) if !parsed.is_sequence() && !parsed.is_mapping() => parsed,
        _ => Value::String(value.to_owned()),
    };

    let mut node = config;
    for key in &keys[..keys.len() - 1] {
        if !node.is_mapping() {
            *node = Value::Mapping(Mapping::new());
        }
        node = node
            .as_mapping_mut()
            .context("expected a section")?
            .entry(Value::String((*key).to_owned()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }

    let mapping = node
        .as_mapping_mut()
        .with_context(|| format!("`{path}` is not inside a section"))?;
    mapping.insert(Value::String(keys[keys.len() - 1].to_owned()), value);
    Ok(())
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
