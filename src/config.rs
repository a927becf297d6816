use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::Destination;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bkpipe/config.toml";
const ENV_PREFIX: &str = "BKPIPE_";
/// Environment variable consulted for the passphrase when no file is set.
pub const PASSPHRASE_ENV: &str = "BKPIPE_PASSPHRASE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("no source paths configured")]
    NoSources,

    #[error("no destinations configured")]
    NoDestinations,

    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Resolved option set for one run. Treated as an immutable snapshot once
/// the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sources: Vec<PathBuf>,
    pub exclude: Vec<String>,
    /// Parent directory for the per-run working set.
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Age in days after which local archive directories are pruned. 0 disables.
    pub retention_days: u32,
    /// FEC redundancy percentage. 0 disables.
    pub redundancy_percent: u8,
    pub self_replicate: bool,
    /// What to self-replicate. Defaults to the running executable.
    pub self_copy_source: Option<PathBuf>,
    pub secure_delete: bool,
    pub non_interactive: bool,
    pub abort_on_error: bool,
    /// Concurrent cloud transfers.
    pub cloud_tasks: usize,
    pub compressor: Compressor,
    pub verbose: bool,
    pub encryption: EncryptionConfig,
    pub destinations: DestinationsConfig,
    pub tools: ToolsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            exclude: Vec::new(),
            temp_dir: std::env::temp_dir(),
            log_dir: PathBuf::from("/var/log/bkpipe"),
            retention_days: 30,
            redundancy_percent: 0,
            self_replicate: false,
            self_copy_source: None,
            secure_delete: true,
            non_interactive: false,
            abort_on_error: false,
            cloud_tasks: 4,
            compressor: Compressor::default(),
            verbose: false,
            encryption: EncryptionConfig::default(),
            destinations: DestinationsConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `BKPIPE_*` environment variables and
    /// CLI overrides, in that order.
    pub fn new<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self, ConfigError> {
        let config = Self::load(path, overrides)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the layers without checking run invariants. Callers that do
    /// not build an archive validate only what they use.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        figment = match path {
            Some(path) => figment.merge(Toml::file_exact(path)),
            None => figment.merge(Toml::file(DEFAULT_CONFIG_PATH)),
        };

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Ok(figment.extract()?)
    }

    /// Destinations are all a retention pass needs.
    pub fn validate_destinations(&self) -> Result<(), ConfigError> {
        if self.destinations.is_empty() {
            return Err(ConfigError::NoDestinations);
        }
        Ok(())
    }

    /// Check the invariants that must hold before any side effect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        self.validate_destinations()?;
        if self.cloud_tasks == 0 {
            return Err(ConfigError::InvalidField {
                field: "cloud_tasks",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.redundancy_percent > 100 {
            return Err(ConfigError::InvalidField {
                field: "redundancy_percent",
                reason: format!("{} exceeds 100", self.redundancy_percent),
            });
        }
        Ok(())
    }
}

/// Compression stage of the archive pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    #[default]
    Xz,
    Gzip,
    Zstd,
    Bzip2,
}

impl Compressor {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Bzip2 => "bzip2",
        }
    }

    /// Arguments that make the program read stdin and write stdout.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Self::Xz => &["-c", "-T0"],
            Self::Gzip => &["-c"],
            Self::Zstd => &["-c", "-q"],
            Self::Bzip2 => &["-c"],
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Gzip => "gz",
            Self::Zstd => "zst",
            Self::Bzip2 => "bz2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub cipher: String,
    pub digest: String,
    pub kdf_iterations: u32,
    pub passphrase_file: Option<PathBuf>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            cipher: "aes-256-cbc".to_string(),
            digest: "sha512".to_string(),
            kdf_iterations: 200_000,
            passphrase_file: None,
        }
    }
}

impl EncryptionConfig {
    /// `-pass` argument for the cipher tool.
    pub fn pass_arg(&self) -> String {
        match &self.passphrase_file {
            Some(path) => format!("file:{}", path.display()),
            None => format!("env:{}", PASSPHRASE_ENV),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationsConfig {
    pub local: Vec<PathBuf>,
    pub remote: Vec<String>,
    pub sync: Vec<String>,
    pub cloud: Vec<String>,
}

impl DestinationsConfig {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty() && self.sync.is_empty() && self.cloud.is_empty()
    }

    /// All configured destinations in dispatch-class order.
    pub fn to_destinations(&self) -> Vec<Destination> {
        self.local
            .iter()
            .cloned()
            .map(Destination::Local)
            .chain(self.remote.iter().cloned().map(Destination::RemoteCopy))
            .chain(self.sync.iter().cloned().map(Destination::SyncCopy))
            .chain(self.cloud.iter().cloned().map(Destination::CloudCopy))
            .collect()
    }
}

/// Program used for each external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub tar: String,
    /// Overrides the program implied by `compressor`.
    pub compressor: Option<String>,
    pub openssl: String,
    pub par2: String,
    pub rsync: String,
    pub ssh: String,
    pub scp: String,
    pub rclone: String,
    pub shred: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tar: "tar".to_string(),
            compressor: None,
            openssl: "openssl".to_string(),
            par2: "par2".to_string(),
            rsync: "rsync".to_string(),
            ssh: "ssh".to_string(),
            scp: "scp".to_string(),
            rclone: "rclone".to_string(),
            shred: "shred".to_string(),
        }
    }
}
