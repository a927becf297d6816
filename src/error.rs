//! Fatal error taxonomy for a backup run.
//!
//! Anything that reaches the caller as a [`BackupError`] terminates the run.
//! Recoverable failures never show up here; they go through the escalation
//! policy and only surface as [`BackupError::Aborted`] when the policy says so.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create working directory under {}", path.display())]
    TempCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source path is not an existing directory: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("required program `{0}` is not available")]
    ToolMissing(String),

    #[error("{step} failed: {detail}")]
    StepFailed { step: String, detail: String },

    #[error("{action}")]
    Io {
        action: String,
        #[source]
        source: io::Error,
    },

    #[error("run aborted after failure: {0}")]
    Aborted(String),

    #[error("run interrupted by signal")]
    Interrupted,
}

impl BackupError {
    pub fn io(action: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }

    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type Result<T, E = BackupError> = std::result::Result<T, E>;
