//! Crash reports and their canonical names.
//!
//! A report name encodes the crashed binary and its build:
//! `<binary>--<version>.<build>-<changeset>-<customization>[-beta]--<etc>.<extension>`, for
//! example `mediaserver--3.1.0.1234-abcd-default--1234.gdb-bt`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extensions longer than this are certainly not report extensions.
const MAX_EXTENSION_LEN: usize = 10;

/// The report name could not be parsed.
///
/// Such reports can never be analyzed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unable to parse report name `{name}`: {reason}")]
pub struct ReportNameError {
    pub name: String,
    pub reason: &'static str,
}

/// The product component a binary belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Component {
    Server,
    Client,
}

impl Component {
    fn from_binary(binary: &str) -> Self {
        if binary.contains("server") {
            Self::Server
        } else {
            Self::Client
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "Server",
            Self::Client => "Client",
        }
    }

    /// The team responsible for crashes of this component.
    pub fn team(self) -> &'static str {
        match self {
            Self::Server => "Server",
            Self::Client => "GUI",
        }
    }

    /// The name of the distribution package containing this component.
    pub fn distribution(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of crash artifact, given by the file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Extension {
    /// Backtrace text produced by gdb on Linux.
    GdbBt,
    /// Backtrace text produced by cdb on Windows.
    CdbBt,
    /// Windows minidump.
    Dmp,
}

impl Extension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GdbBt => "gdb-bt",
            Self::CdbBt => "cdb-bt",
            Self::Dmp => "dmp",
        }
    }

    /// The operating system the crash happened on, if it is known for this extension.
    pub fn operating_system(self) -> Option<&'static str> {
        match self {
            Self::GdbBt => Some("Linux"),
            Self::Dmp => Some("Windows"),
            Self::CdbBt => None,
        }
    }
}

impl FromStr for Extension {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gdb-bt" => Ok(Self::GdbBt),
            "cdb-bt" => Ok(Self::CdbBt),
            "dmp" => Ok(Self::Dmp),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A crash report described by its canonical name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Report {
    name: String,
    binary: String,
    component: Component,
    version: String,
    full_version: String,
    build: String,
    changeset: String,
    customization: String,
    beta: bool,
    extension: Extension,
}

impl Report {
    /// Parses a canonical report name.
    pub fn parse(name: &str) -> Result<Self, ReportNameError> {
        let error = |reason| ReportNameError {
            name: name.to_owned(),
            reason,
        };

        let tokens: Vec<&str> = name.split("--").collect();
        if tokens.len() < 2 || tokens[0].is_empty() {
            return Err(error("expected `--` separated binary and build"));
        }

        let last = tokens[tokens.len() - 1];
        let (_, extension) = last
            .rsplit_once('.')
            .ok_or_else(|| error("missing extension"))?;
        if extension.len() > MAX_EXTENSION_LEN {
            return Err(error("invalid extension"));
        }
        let extension: Extension = extension
            .parse()
            .map_err(|()| error("unsupported extension"))?;

        let mut build_info = tokens[1];
        if tokens.len() == 2 {
            build_info = &build_info[..build_info.len() - extension.as_str().len() - 1];
        }

        let build_parts: Vec<&str> = build_info.split('-').collect();
        if build_parts.len() < 3 {
            return Err(error("expected <version>-<changeset>-<customization>"));
        }

        if build_parts[2].is_empty() {
            return Err(error("missing customization"));
        }

        let full_version = build_parts[0];
        let version_parts: Vec<&str> = full_version.split('.').collect();
        if version_parts.len() < 4 {
            return Err(error("expected <major>.<minor>.<patch>.<build> version"));
        }
        if !version_parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(error("version is not numeric"));
        }

        let mut version = format!("{}.{}", version_parts[0], version_parts[1]);
        if version_parts[2] != "0" {
            version.push('.');
            version.push_str(version_parts[2]);
        }

        let binary = tokens[0];
        Ok(Self {
            name: name.to_owned(),
            binary: binary.to_owned(),
            component: Component::from_binary(binary),
            version,
            full_version: full_version.to_owned(),
            build: version_parts[3].to_owned(),
            changeset: build_parts[1].to_owned(),
            customization: build_parts[2].to_owned(),
            beta: build_parts[3..] == ["beta"],
            extension,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn component(&self) -> Component {
        self.component
    }

    /// The short version, e.g. `3.1` for `3.1.0.1234` and `3.1.2` for `3.1.2.1234`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The complete dotted version including the build number.
    pub fn full_version(&self) -> &str {
        &self.full_version
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    pub fn changeset(&self) -> &str {
        &self.changeset
    }

    pub fn customization(&self) -> &str {
        &self.customization
    }

    pub fn is_beta(&self) -> bool {
        self.beta
    }

    pub fn extension(&self) -> Extension {
        self.extension
    }

    /// The name without the extension.
    pub fn stem(&self) -> &str {
        &self.name[..self.name.len() - self.extension.as_str().len() - 1]
    }

    /// Name of an artifact of this report with a different extension.
    pub fn companion(&self, extension: Extension) -> String {
        format!("{}.{}", self.stem(), extension)
    }

    /// Names of the report file and the artifacts generated from it.
    ///
    /// A minidump is accompanied by the cdb backtrace produced during its analysis.
    pub fn artifacts(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        if self.extension == Extension::Dmp {
            names.push(self.companion(Extension::CdbBt));
        }
        names
    }
}

impl FromStr for Report {
    type Err = ReportNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
