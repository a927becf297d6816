use async_trait::async_trait;

use crate::context::RunContext;
use crate::core::exec::{self, Invocation, Outcome, Tier};
use crate::core::models::ArchiveArtifact;
use crate::core::tools::Tool;
use crate::core::transfer_engine::{TransferEngine, as_directory};
use crate::error::Result;

const STEP: &str = "remote-copy";

/// Copies the epoch directory to `host:path` with scp.
///
/// Also serves synchronizing destinations that fell back because rsync is
/// not installed.
pub struct RemoteCopyEngine;

#[async_trait]
impl TransferEngine for RemoteCopyEngine {
    async fn transfer(&self, ctx: &RunContext, artifact: &ArchiveArtifact, address: &str) -> Result<Outcome> {
        let cmd = Invocation::new(ctx.tools.program(Tool::Scp))
            .args(["-r", "-p", "-q", "-B", "--"])
            .arg(&artifact.dir)
            .arg(as_directory(address));

        exec::invoke(ctx, STEP, &cmd, Tier::Escalate).await
    }
}
