use async_trait::async_trait;
use tracing::info;

use crate::context::RunContext;
use crate::core::exec::{self, Invocation, Outcome, Tier};
use crate::core::models::ArchiveArtifact;
use crate::core::tools::Tool;
use crate::core::transfer_engine::{TransferEngine, join_remote};
use crate::error::Result;

const STEP: &str = "cloud-copy";
const STEP_VERIFY: &str = "cloud-verify";

/// Uploads the epoch directory with rclone and re-reads it with a one-way
/// `rclone check`. Runs inside the bounded cloud pool.
pub struct CloudCopyEngine;

#[async_trait]
impl TransferEngine for CloudCopyEngine {
    async fn transfer(&self, ctx: &RunContext, artifact: &ArchiveArtifact, address: &str) -> Result<Outcome> {
        let rclone = ctx.tools.program(Tool::Rclone);
        let remote = join_remote(address, &artifact.epoch.to_string());

        let copy = Invocation::new(rclone)
            .arg("copy")
            .arg(&artifact.dir)
            .arg(&remote);
        let outcome = exec::invoke(ctx, STEP, &copy, Tier::Escalate).await?;
        if !outcome.is_success() {
            return Ok(outcome);
        }

        let check = Invocation::new(rclone)
            .args(["check", "--one-way"])
            .arg(&artifact.dir)
            .arg(&remote);
        let verified = exec::invoke(ctx, STEP_VERIFY, &check, Tier::Escalate).await?;
        if verified.is_success() {
            info!(remote = %remote, "Cloud copy verified");
        }
        Ok(verified)
    }
}
