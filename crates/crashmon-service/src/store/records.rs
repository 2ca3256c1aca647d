use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::fs::{catch_not_found, write_atomic};

use super::StoreError;

/// Serialized form of [`CrashId::Failed`].
const FAILED: &str = "FAILED";

/// Tombstone spellings written by earlier versions.
const LEGACY_FAILED: &[&str] = &["FAILED_REMOVED", ""];

/// The analysis outcome of a report.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CrashId {
    /// The report cannot be analyzed. The entry is kept as a tombstone.
    Failed,
    /// The identifier of the analysed crash.
    Hash(String),
}

impl CrashId {
    pub fn as_hash(&self) -> Option<&str> {
        match self {
            Self::Failed => None,
            Self::Hash(hash) => Some(hash),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for CrashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => f.write_str(FAILED),
            Self::Hash(hash) => f.write_str(hash),
        }
    }
}

impl Serialize for CrashId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CrashId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CrashIdVisitor;

        impl Visitor<'_> for CrashIdVisitor {
            type Value = CrashId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a crash id or FAILED")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<CrashId, E> {
                if value == FAILED || LEGACY_FAILED.contains(&value) {
                    Ok(CrashId::Failed)
                } else {
                    Ok(CrashId::Hash(value.to_owned()))
                }
            }
        }

        deserializer.deserialize_str(CrashIdVisitor)
    }
}

/// The state of a single report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Missing until the report is analyzed.
    #[serde(default)]
    pub crash_id: Option<CrashId>,
    /// The tracker issue the report is attached to.
    #[serde(default)]
    pub issue: Option<String>,
}

impl Record {
    pub fn analyzed(crash_id: CrashId) -> Self {
        Self {
            crash_id: Some(crash_id),
            issue: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.crash_id.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.crash_id.as_ref().is_some_and(CrashId::is_failed)
    }
}

/// The persistent index mapping report names to their records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Records {
    path: PathBuf,
    entries: BTreeMap<String, Record>,
}

impl Records {
    /// An empty index to be saved at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Loads the index from `path`. A missing file is an empty index.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let content = catch_not_found(|| std::fs::read(&path))
            .map_err(|source| StoreError::io(&path, source))?;

        let entries = match content {
            Some(content) => serde_json::from_slice(&content).map_err(|source| {
                StoreError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?,
            None => BTreeMap::new(),
        };

        Ok(Self { path, entries })
    }

    /// Atomically replaces the file with the current entries.
    pub fn save(&self) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(&self.entries).map_err(|source| {
            StoreError::io(&self.path, io::Error::new(io::ErrorKind::InvalidData, source))
        })?;
        write_atomic(&self.path, &content).map_err(|source| StoreError::io(&self.path, source))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&Record> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Record> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, record: Record) -> Option<Record> {
        self.entries.insert(name.into(), record)
    }

    pub fn remove(&mut self, name: &str) -> Option<Record> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.entries.iter().map(|(name, record)| (name.as_str(), record))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Names of the reports waiting for analysis, in name order.
    pub fn pending(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, record)| record.is_pending())
            .map(|(name, _)| name.to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
