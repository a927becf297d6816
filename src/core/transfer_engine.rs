pub mod cloud;
pub mod local;
pub mod remote;
pub mod sync;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::core::exec::Outcome;
use crate::core::models::{ArchiveArtifact, DestinationClass};
use crate::error::Result;

pub use cloud::CloudCopyEngine;
pub use local::LocalEngine;
pub use remote::RemoteCopyEngine;
pub use sync::SyncCopyEngine;

/// Replicates the artifact to one destination of a single class.
///
/// Recoverable failures are escalated inside the engine; `Err` means the run
/// must stop (the policy aborted, or the run was interrupted).
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn transfer(&self, ctx: &RunContext, artifact: &ArchiveArtifact, address: &str) -> Result<Outcome>;
}

/// One engine per destination class.
#[derive(Clone)]
pub struct EngineSet {
    pub local: Arc<dyn TransferEngine>,
    pub remote: Arc<dyn TransferEngine>,
    pub sync: Arc<dyn TransferEngine>,
    pub cloud: Arc<dyn TransferEngine>,
}

impl Default for EngineSet {
    fn default() -> Self {
        Self {
            local: Arc::new(LocalEngine::default()),
            remote: Arc::new(RemoteCopyEngine),
            sync: Arc::new(SyncCopyEngine),
            cloud: Arc::new(CloudCopyEngine),
        }
    }
}

impl EngineSet {
    pub fn for_class(&self, class: DestinationClass) -> Arc<dyn TransferEngine> {
        match class {
            DestinationClass::Local => Arc::clone(&self.local),
            DestinationClass::RemoteCopy => Arc::clone(&self.remote),
            DestinationClass::SyncCopy => Arc::clone(&self.sync),
            DestinationClass::CloudCopy => Arc::clone(&self.cloud),
        }
    }
}

/// `host:/srv/backups` + `1700000000` -> `host:/srv/backups/1700000000`.
/// A bare remote name such as `b2:` gets no extra separator.
pub fn join_remote(address: &str, name: &str) -> String {
    if address.ends_with(':') || address.ends_with('/') {
        format!("{}{}", address, name)
    } else {
        format!("{}/{}", address, name)
    }
}

/// Address as an rsync/scp directory target.
pub fn as_directory(address: &str) -> String {
    if address.ends_with(':') || address.ends_with('/') {
        address.to_string()
    } else {
        format!("{}/", address)
    }
}
