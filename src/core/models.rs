use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

/// Run identifier: seconds since the Unix epoch, rendered as ten digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(i64);

impl Epoch {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

/// Transfer mechanism a destination belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationClass {
    Local,
    RemoteCopy,
    SyncCopy,
    CloudCopy,
}

impl DestinationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::RemoteCopy => "remote",
            Self::SyncCopy => "sync",
            Self::CloudCopy => "cloud",
        }
    }
}

impl fmt::Display for DestinationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured replication target. Each variant carries only its address;
/// credentials live in the transfer tool's own configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", content = "address", rename_all = "snake_case")]
pub enum Destination {
    Local(PathBuf),
    RemoteCopy(String),
    SyncCopy(String),
    CloudCopy(String),
}

impl Destination {
    pub fn class(&self) -> DestinationClass {
        match self {
            Self::Local(_) => DestinationClass::Local,
            Self::RemoteCopy(_) => DestinationClass::RemoteCopy,
            Self::SyncCopy(_) => DestinationClass::SyncCopy,
            Self::CloudCopy(_) => DestinationClass::CloudCopy,
        }
    }

    pub fn address(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::RemoteCopy(addr) | Self::SyncCopy(addr) | Self::CloudCopy(addr) => addr.clone(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class(), self.address())
    }
}

/// The encrypted archive produced by one run, plus everything that travels
/// with it out of the workspace.
#[derive(Debug, Clone)]
pub struct ArchiveArtifact {
    pub epoch: Epoch,
    /// Epoch directory inside the working set.
    pub dir: PathBuf,
    /// The encrypted archive file.
    pub file: PathBuf,
    /// FEC sidecars, empty when redundancy is disabled or failed.
    pub sidecars: Vec<PathBuf>,
    /// Self-replicated orchestrator copy, if any.
    pub self_copy: Option<PathBuf>,
}

impl ArchiveArtifact {
    pub fn new(epoch: Epoch, dir: PathBuf, file: PathBuf) -> Self {
        Self {
            epoch,
            dir,
            file,
            sidecars: Vec::new(),
            self_copy: None,
        }
    }

    /// Every file that is replicated to a destination.
    pub fn files(&self) -> Vec<&Path> {
        let mut files = vec![self.file.as_path()];
        files.extend(self.sidecars.iter().map(PathBuf::as_path));
        files.extend(self.self_copy.as_deref());
        files
    }
}
